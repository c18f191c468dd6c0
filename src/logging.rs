use std::io;
/// Structured logging and build observation for layerstack
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output.
///
/// Only the binary calls this. Library components report through a
/// [`BuildObserver`] handed to them at construction.
pub fn init_logging(json_output: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("layerstack=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

/// Why an index child was left out of the result index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoPlatform,
    UnsupportedMediaType(String),
    Attestation { refers_to: Option<String> },
    PlatformNotSelected(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPlatform => write!(f, "no platform"),
            Self::UnsupportedMediaType(mt) => write!(f, "unsupported media type {}", mt),
            Self::Attestation { refers_to } => match refers_to {
                Some(d) => write!(f, "attestation manifest for {}", d),
                None => write!(f, "attestation manifest"),
            },
            Self::PlatformNotSelected(p) => write!(f, "platform {} not selected", p),
        }
    }
}

/// Event types reported by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    LayerBuilt {
        source: String,
        files: usize,
        bytes: u64,
        digest: String,
    },
    BaseResolved {
        reference: String,
        media_type: String,
        layer_type: String,
    },
    Warning {
        message: String,
    },
    PushProgress {
        completed: u64,
        total: u64,
    },
    Pushed {
        reference: String,
        digest: String,
        media_type: String,
    },
    IndexEntrySkipped {
        position: usize,
        digest: String,
        reason: SkipReason,
    },
    IndexEntrySelected {
        position: usize,
        digest: String,
        platform: String,
    },
    IndexPushed {
        reference: String,
        digest: String,
        manifests: usize,
    },
    Failed {
        component: String,
        message: String,
    },
}

impl std::fmt::Display for BuildEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LayerBuilt {
                source,
                files,
                bytes,
                digest,
            } => write!(
                f,
                "Layer built from {} ({} files, {} bytes) {}",
                source, files, bytes, digest
            ),
            Self::BaseResolved {
                reference,
                media_type,
                ..
            } => write!(f, "Base {} resolved as {}", reference, media_type),
            Self::Warning { message } => write!(f, "Warning: {}", message),
            Self::PushProgress { completed, total } => {
                write!(f, "Push {}/{} bytes", completed, total)
            }
            Self::Pushed {
                reference, digest, ..
            } => write!(f, "Pushed {}@{}", reference, digest),
            Self::IndexEntrySkipped {
                position,
                digest,
                reason,
            } => write!(f, "Skipping index entry {} {}: {}", position, digest, reason),
            Self::IndexEntrySelected {
                position, platform, ..
            } => write!(f, "Selected index entry {} for {}", position, platform),
            Self::IndexPushed {
                reference,
                digest,
                manifests,
            } => write!(
                f,
                "Pushed index {}@{} with {} manifests",
                reference, digest, manifests
            ),
            Self::Failed { component, message } => {
                write!(f, "Error in {}: {}", component, message)
            }
        }
    }
}

/// Capability every engine component receives instead of ambient logger state
pub trait BuildObserver: Send + Sync {
    fn on_event(&self, event: BuildEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl BuildObserver for TracingObserver {
    fn on_event(&self, event: BuildEvent) {
        match &event {
            BuildEvent::LayerBuilt {
                files,
                bytes,
                digest,
                ..
            } => {
                tracing::info!(files = files, bytes = bytes, digest = %digest, "layer built")
            }
            BuildEvent::PushProgress { completed, total } => {
                tracing::info!(completed = completed, total = total, "push")
            }
            BuildEvent::IndexEntrySkipped { .. } | BuildEvent::IndexEntrySelected { .. } => {
                tracing::debug!("{}", event)
            }
            BuildEvent::Warning { message } => tracing::warn!("{}", message),
            BuildEvent::Failed { component, message } => {
                tracing::error!(component = %component, "{}", message)
            }
            _ => tracing::info!("{}", event),
        }
    }
}

pub struct NoopObserver;
impl BuildObserver for NoopObserver {
    fn on_event(&self, _event: BuildEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reason_display() {
        let reason = SkipReason::Attestation {
            refers_to: Some("sha256:abc".to_string()),
        };
        assert_eq!(reason.to_string(), "attestation manifest for sha256:abc");
        assert_eq!(SkipReason::NoPlatform.to_string(), "no platform");
    }

    #[test]
    fn test_index_pushed_event_formatting() {
        let event = BuildEvent::IndexPushed {
            reference: "example.com/app:1".to_string(),
            digest: "sha256:def".to_string(),
            manifests: 2,
        };
        let display = event.to_string();
        assert!(display.contains("example.com/app:1@sha256:def"));
        assert!(display.contains("2 manifests"));
    }
}
