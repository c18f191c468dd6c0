//! Append layers to one base image and push the result.
//!
//! The base is resolved once. Its manifest dialect decides the media type of
//! appended layers, so an OCI base gets OCI layers and a Docker base Docker ones.

pub mod env;
pub mod push;

use crate::annotate::BaseAnnotations;
use crate::constants::{EPOCH_TIMESTAMP, HISTORY_CREATED_BY, OCI_CONFIG, OCI_MANIFEST};
use crate::error::{LayerstackError, Result};
use crate::layer::Layer;
use crate::logging::{BuildEvent, BuildObserver};
use crate::oci::digest::Digest;
use crate::oci::manifest::{Descriptor, ImageConfig, ImageManifest, ManifestKind};
use crate::oci::platform::Platform;
use crate::oci::reference::Reference;
use crate::oci::registry::{RawManifest, Registry};
use push::{push_with_progress, PushPlan};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A base image after its manifest and config were read
#[derive(Debug, Clone)]
pub struct ResolvedBase {
    /// None for the synthetic empty base
    pub reference: Option<Reference>,
    pub raw: RawManifest,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
    pub kind: ManifestKind,
}

impl ResolvedBase {
    /// An image with no layers, OCI manifest and config types
    pub fn empty() -> Result<Self> {
        let config = ImageConfig::empty();
        let config_bytes = serde_json::to_vec(&config)?;
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST.to_string()),
            config: Descriptor::new(
                OCI_CONFIG,
                Digest::sha256(&config_bytes),
                config_bytes.len() as u64,
            ),
            layers: Vec::new(),
            annotations: None,
            extra: Default::default(),
        };
        let raw = RawManifest::new(OCI_MANIFEST, serde_json::to_vec(&manifest)?);
        Ok(Self {
            reference: None,
            raw,
            manifest,
            config,
            kind: ManifestKind::OciManifest,
        })
    }

    pub fn media_type(&self) -> &str {
        &self.raw.media_type
    }

    /// Media type for layers appended to this base
    pub fn layer_type(&self) -> &'static str {
        self.kind.layer_media_type()
    }

    pub fn digest(&self) -> &Digest {
        &self.raw.digest
    }
}

/// Base resolution happens exactly once per appender
#[derive(Debug, Clone, Default)]
pub enum BaseState {
    #[default]
    Unresolved,
    Resolved(Box<ResolvedBase>),
}

/// One appended layer as it appears in the result manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResultLayer {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// How a pushed image is added to an index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexAddendum {
    pub descriptor: Descriptor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendResult {
    /// Digest of the pushed manifest, annotations included
    pub hash: Digest,
    pub pushed: IndexAddendum,
    pub added_layers: Vec<AppendResultLayer>,
    pub config_digest: Digest,
}

/// Appends layers to a base and pushes the result to a tag
pub struct Appender {
    base: Option<Reference>,
    tag: Reference,
    registry: Arc<dyn Registry>,
    observer: Arc<dyn BuildObserver>,
    state: BaseState,
    envs: Vec<String>,
    annotations: Option<BaseAnnotations>,
    push_by_digest: bool,
}

impl Appender {
    /// `base` None starts from an empty image
    pub fn new(
        base: Option<Reference>,
        tag: Reference,
        registry: Arc<dyn Registry>,
        observer: Arc<dyn BuildObserver>,
    ) -> Self {
        Self {
            base,
            tag,
            registry,
            observer,
            state: BaseState::Unresolved,
            envs: Vec::new(),
            annotations: None,
            push_by_digest: false,
        }
    }

    /// `KEY=VALUE` overrides for the result config environment
    pub fn with_envs(mut self, envs: Vec<String>) -> Self {
        self.envs = envs;
        self
    }

    pub fn with_annotations(mut self, annotations: BaseAnnotations) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Push the manifest untagged, for images that only an index will reference
    pub fn push_by_digest(mut self) -> Self {
        self.push_by_digest = true;
        self
    }

    pub fn state(&self) -> &BaseState {
        &self.state
    }

    /// Read the base manifest and config. Calling this twice is a caller defect.
    pub async fn resolve_base(&mut self) -> Result<&ResolvedBase> {
        if let BaseState::Resolved(_) = self.state {
            tracing::error!(tag = %self.tag, "base resolved twice");
            return Err(LayerstackError::Contract(
                "base resolution may only be invoked once per appender".to_string(),
            ));
        }
        let resolved = match self.base {
            None => ResolvedBase::empty()?,
            Some(ref base) => fetch_base(self.registry.as_ref(), base).await?,
        };
        self.observer.on_event(BuildEvent::BaseResolved {
            reference: self
                .base
                .as_ref()
                .map(|b| b.to_string())
                .unwrap_or_else(|| "(empty)".to_string()),
            media_type: resolved.media_type().to_string(),
            layer_type: resolved.layer_type().to_string(),
        });
        self.state = BaseState::Resolved(Box::new(resolved));
        match self.state {
            BaseState::Resolved(ref r) => Ok(&**r),
            BaseState::Unresolved => Err(LayerstackError::Contract(
                "base state not resolved after resolution".to_string(),
            )),
        }
    }

    /// Append layers in order after the base layers and push the result
    pub async fn append(&mut self, layers: &[Layer]) -> Result<AppendResult> {
        if let BaseState::Unresolved = self.state {
            self.resolve_base().await?;
        }
        let base = match self.state {
            BaseState::Resolved(ref r) => (**r).clone(),
            BaseState::Unresolved => {
                return Err(LayerstackError::Contract("base not resolved".to_string()))
            }
        };
        let layer_type = base.layer_type();

        let mut config = base.config.clone();
        for layer in layers {
            config.rootfs.diff_ids.push(layer.diff_id().clone());
            config.history.push(serde_json::json!({
                "created": EPOCH_TIMESTAMP,
                "created_by": HISTORY_CREATED_BY,
            }));
        }
        if !self.envs.is_empty() {
            let merged = env::apply_env_overrides(config.env(), &self.envs);
            config.config.get_or_insert_with(Default::default).env = Some(merged);
        }
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = Digest::sha256(&config_bytes);

        let mut manifest = base.manifest.clone();
        manifest.config = Descriptor::new(
            &base.manifest.config.media_type,
            config_digest.clone(),
            config_bytes.len() as u64,
        );
        manifest
            .layers
            .extend(layers.iter().map(|l| l.descriptor(layer_type)));
        if let (Some(annotations), Some(_)) = (&self.annotations, &base.reference) {
            annotations.apply(
                manifest.annotations.get_or_insert_with(Default::default),
                base.digest(),
            );
        }
        let raw = RawManifest::new(base.media_type(), serde_json::to_vec(&manifest)?);

        let target = if self.push_by_digest {
            self.tag.with_digest(raw.digest.clone())
        } else {
            self.tag.clone()
        };
        let cross_repo = base
            .reference
            .as_ref()
            .filter(|b| !b.same_repository(&self.tag))
            .cloned();
        let base_layers = match cross_repo {
            Some(_) => base
                .manifest
                .layers
                .iter()
                .map(|d| (d.digest.clone(), d.size))
                .collect(),
            None => Vec::new(),
        };
        let mut blobs: Vec<(Digest, Vec<u8>)> = layers
            .iter()
            .map(|l| (l.digest().clone(), l.blob().to_vec()))
            .collect();
        blobs.push((config_digest.clone(), config_bytes));

        tracing::info!(media_type = %raw.media_type, target = %target, "pushing");
        let plan = PushPlan {
            base_layers,
            base_repository: cross_repo,
            blobs,
            manifest: raw.clone(),
            target: target.clone(),
        };
        push_with_progress(self.registry.clone(), plan, self.observer.as_ref()).await?;
        self.observer.on_event(BuildEvent::Pushed {
            reference: target.to_string(),
            digest: raw.digest.to_string(),
            media_type: raw.media_type.clone(),
        });

        let platform = config.platform();
        let added_layers = layers_delta(&base.manifest, &manifest, platform.as_ref())?;
        let mut descriptor = Descriptor::new(&raw.media_type, raw.digest.clone(), raw.bytes.len() as u64);
        descriptor.platform = platform;
        Ok(AppendResult {
            hash: raw.digest,
            pushed: IndexAddendum { descriptor },
            added_layers,
            config_digest,
        })
    }
}

async fn fetch_base(registry: &dyn Registry, base: &Reference) -> Result<ResolvedBase> {
    let raw = registry.get_manifest(base).await?;
    let kind = raw.kind();
    if !kind.is_image() {
        return Err(LayerstackError::UnsupportedMediaType {
            media_type: raw.media_type.clone(),
            reference: base.to_string(),
        });
    }
    let manifest: ImageManifest = serde_json::from_slice(&raw.bytes)?;
    let config_bytes = registry.get_blob(base, &manifest.config.digest).await?;
    let config: ImageConfig = serde_json::from_slice(&config_bytes)?;
    Ok(ResolvedBase {
        reference: Some(base.clone()),
        raw,
        manifest,
        config,
        kind,
    })
}

/// Result layers beyond the base layer count.
///
/// Composition is additive, so the base layers must be an unchanged prefix.
pub fn layers_delta(
    base: &ImageManifest,
    result: &ImageManifest,
    platform: Option<&Platform>,
) -> Result<Vec<AppendResultLayer>> {
    let n = base.layers.len();
    let prefix_intact = result.layers.len() >= n
        && base
            .layers
            .iter()
            .zip(&result.layers)
            .all(|(b, r)| b.digest == r.digest);
    if !prefix_intact {
        return Err(LayerstackError::Contract(format!(
            "result manifest does not start with the {} base layers",
            n
        )));
    }
    Ok(result.layers[n..]
        .iter()
        .map(|d| AppendResultLayer {
            media_type: d.media_type.clone(),
            size: d.size,
            digest: d.digest.clone(),
            platform: platform.cloned(),
        })
        .collect())
}
