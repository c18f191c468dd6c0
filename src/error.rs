/// layerstack error types
use thiserror::Error;

/// Main error type for layer composition and push operations
#[derive(Debug, Error)]
pub enum LayerstackError {
    /// A platform string that is not `os[/arch[/variant]]`
    #[error("Invalid platform '{value}': {reason}")]
    InvalidPlatform { value: String, reason: String },

    /// Configuration rejected before any registry access
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An image reference that could not be parsed or is not allowed here
    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Every file of a layer source was filtered out
    #[error("Layer source {source_path} resulted in an empty layer")]
    EmptyLayer { source_path: String },

    /// Max file count or max accumulated size of a layer source exceeded
    #[error("{what} {actual} exceeds max from layer config: {limit}")]
    LimitExceeded {
        what: &'static str,
        actual: u64,
        limit: u64,
    },

    /// No child of a base index qualified for appending
    #[error("Found no platform manifest to append to in index {base}: {raw_manifest}")]
    NoPlatformSelected { base: String, raw_manifest: String },

    /// Configured platforms that no eligible child of a base index provides
    #[error("Found {selected} index manifests to append to in {base}, config has {configured} platforms, none for {}: {raw_manifest}", .unmatched.join(", "))]
    UnmatchedPlatforms {
        base: String,
        selected: usize,
        configured: usize,
        unmatched: Vec<String>,
        raw_manifest: String,
    },

    /// A manifest of a type this engine does not compose
    #[error("Unsupported media type {media_type} for {reference}")]
    UnsupportedMediaType {
        media_type: String,
        reference: String,
    },

    /// An index child that is itself an index
    #[error("Unsupported nested index {reference} type {media_type}")]
    NestedIndex {
        reference: String,
        media_type: String,
    },

    /// Pull, push or progress stream failure
    #[error("Registry error in {operation}: {reason}")]
    Registry { operation: String, reason: String },

    /// Caller defect, such as resolving a base twice
    #[error("Contract violation: {0}")]
    Contract(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl LayerstackError {
    pub fn registry(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Registry {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Configuration and selection errors are raised before anything is pushed
    pub fn is_pre_push(&self) -> bool {
        matches!(
            self,
            Self::InvalidPlatform { .. }
                | Self::InvalidConfig(_)
                | Self::InvalidReference { .. }
                | Self::EmptyLayer { .. }
                | Self::LimitExceeded { .. }
                | Self::NoPlatformSelected { .. }
                | Self::UnmatchedPlatforms { .. }
                | Self::UnsupportedMediaType { .. }
                | Self::NestedIndex { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LayerstackError>;
