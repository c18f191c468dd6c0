//! Multi-platform builds: append the same layers to every selected child of
//! a base index and push a new index that references only the new children.
//!
//! Children are composed one at a time in index order. The first failure
//! aborts the build before the index is pushed, so the result tag never
//! points at a partial index.

use crate::annotate::BaseAnnotations;
use crate::append::{AppendResult, Appender};
use crate::constants::{OCI_INDEX, REFERENCE_DIGEST_ANNOTATION};
use crate::error::{LayerstackError, Result};
use crate::layer::Layer;
use crate::logging::{BuildEvent, BuildObserver, SkipReason};
use crate::oci::digest::Digest;
use crate::oci::manifest::{is_attestation, Descriptor, ImageIndex, ManifestKind};
use crate::oci::platform::{Platform, PlatformMatcher};
use crate::oci::reference::Reference;
use crate::oci::registry::{Describable, RawManifest, Registry, Taggable};
use crate::pushed::Artifact;
use async_trait::async_trait;
use std::sync::Arc;

/// The result entry of a child, filled in once it has been pushed
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDescriptor {
    pub platform: Option<Platform>,
    pub digest: Option<Digest>,
}

/// A selected index child, pinned by digest, to be used as a base
#[derive(Debug, Clone, PartialEq)]
pub struct ToAppend {
    pub base: Reference,
    /// Position in the base index
    pub position: usize,
    pub pending: PendingDescriptor,
}

/// Composes one platform image from a pinned child and pushes it untagged
#[async_trait]
pub trait PlatformAppend: Send + Sync {
    async fn append(&self, base: &Reference, target: &Reference) -> Result<AppendResult>;
}

/// Appends prebuilt layers with a fresh [`Appender`] per child
pub struct LayerAppend {
    registry: Arc<dyn Registry>,
    observer: Arc<dyn BuildObserver>,
    layers: Vec<Layer>,
    envs: Vec<String>,
    annotations: BaseAnnotations,
}

impl LayerAppend {
    pub fn new(
        registry: Arc<dyn Registry>,
        observer: Arc<dyn BuildObserver>,
        layers: Vec<Layer>,
        envs: Vec<String>,
        annotations: BaseAnnotations,
    ) -> Self {
        Self {
            registry,
            observer,
            layers,
            envs,
            annotations,
        }
    }
}

#[async_trait]
impl PlatformAppend for LayerAppend {
    async fn append(&self, base: &Reference, target: &Reference) -> Result<AppendResult> {
        let mut appender = Appender::new(
            Some(base.clone()),
            target.clone(),
            self.registry.clone(),
            self.observer.clone(),
        )
        .with_envs(self.envs.clone())
        .with_annotations(self.annotations.clone())
        .push_by_digest();
        appender.append(&self.layers).await
    }
}

/// Final index bytes, computed once and pushed exactly as they are
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSnapshot {
    bytes: Vec<u8>,
    digest: Digest,
    media_type: String,
    size: u64,
}

impl IndexSnapshot {
    pub fn of(index: &ImageIndex) -> Result<Self> {
        let bytes = serde_json::to_vec(index)?;
        Ok(Self {
            digest: Digest::sha256(&bytes),
            media_type: index
                .media_type
                .clone()
                .unwrap_or_else(|| OCI_INDEX.to_string()),
            size: bytes.len() as u64,
            bytes,
        })
    }
}

impl Taggable for IndexSnapshot {
    fn raw_manifest(&self) -> &[u8] {
        &self.bytes
    }
}

impl Describable for IndexSnapshot {
    fn digest(&self) -> &Digest {
        &self.digest
    }

    fn media_type(&self) -> &str {
        &self.media_type
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Outcome of a multi-platform build
#[derive(Debug, Clone)]
pub struct AssembledIndex {
    pub artifact: Artifact,
    pub index: ImageIndex,
    /// One result per composed child, in index order
    pub results: Vec<AppendResult>,
}

/// A base index after child selection, ready to compose
pub struct IndexAssembler {
    base: Reference,
    raw: RawManifest,
    canvas: ImageIndex,
    to_append: Vec<ToAppend>,
    observer: Arc<dyn BuildObserver>,
}

impl std::fmt::Debug for IndexAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexAssembler")
            .field("base", &self.base)
            .field("raw", &self.raw)
            .field("canvas", &self.canvas)
            .field("to_append", &self.to_append)
            .finish_non_exhaustive()
    }
}

impl IndexAssembler {
    /// Fetch a digest-pinned base index and select the children to compose
    pub async fn discover(
        base: &Reference,
        matcher: &PlatformMatcher,
        registry: &dyn Registry,
        observer: Arc<dyn BuildObserver>,
    ) -> Result<Self> {
        require_digest(base)?;
        let raw = registry.get_manifest(base).await?;
        Self::select(base, raw, matcher, registry, observer).await
    }

    /// Select children of an index that was already fetched
    pub async fn select(
        base: &Reference,
        raw: RawManifest,
        matcher: &PlatformMatcher,
        registry: &dyn Registry,
        observer: Arc<dyn BuildObserver>,
    ) -> Result<Self> {
        require_digest(base)?;
        if raw.kind() != ManifestKind::OciIndex {
            return Err(LayerstackError::UnsupportedMediaType {
                media_type: raw.media_type.clone(),
                reference: base.to_string(),
            });
        }
        let index: ImageIndex = serde_json::from_slice(&raw.bytes)?;

        let mut to_append = Vec::new();
        for (position, child) in index.manifests.iter().enumerate() {
            if let Some(reason) = skip_reason(child, matcher) {
                observer.on_event(BuildEvent::IndexEntrySkipped {
                    position,
                    digest: child.digest.to_string(),
                    reason,
                });
                continue;
            }
            let pinned = base.with_digest(child.digest.clone());
            let child_raw = registry.get_manifest(&pinned).await?;
            if child_raw.kind().is_index() {
                return Err(LayerstackError::NestedIndex {
                    reference: pinned.to_string(),
                    media_type: child_raw.media_type,
                });
            }
            observer.on_event(BuildEvent::IndexEntrySelected {
                position,
                digest: child.digest.to_string(),
                platform: child
                    .platform
                    .as_ref()
                    .map(Platform::to_string)
                    .unwrap_or_default(),
            });
            to_append.push(ToAppend {
                base: pinned,
                position,
                pending: PendingDescriptor {
                    platform: child.platform.clone(),
                    digest: None,
                },
            });
        }

        if to_append.is_empty() {
            return Err(LayerstackError::NoPlatformSelected {
                base: base.to_string(),
                raw_manifest: raw.as_text(),
            });
        }
        let unmatched =
            matcher.unmatched(to_append.iter().filter_map(|t| t.pending.platform.as_ref()));
        if !unmatched.is_empty() {
            return Err(LayerstackError::UnmatchedPlatforms {
                base: base.to_string(),
                selected: to_append.len(),
                configured: matcher.wanted().len(),
                unmatched: unmatched.iter().map(|p| p.to_string()).collect(),
                raw_manifest: raw.as_text(),
            });
        }

        Ok(Self {
            base: base.clone(),
            canvas: index.without_manifests(),
            raw,
            to_append,
            observer,
        })
    }

    pub fn base(&self) -> &Reference {
        &self.base
    }

    /// The fetched base index bytes
    pub fn raw(&self) -> &RawManifest {
        &self.raw
    }

    pub fn to_append(&self) -> &[ToAppend] {
        &self.to_append
    }

    /// The base index with every child removed
    pub fn canvas(&self) -> &ImageIndex {
        &self.canvas
    }

    /// Compose every selected child in order, then push the new index to `tag`
    pub async fn push_with_append(
        mut self,
        each: &dyn PlatformAppend,
        tag: &Reference,
        registry: &dyn Registry,
        base_ref: &str,
    ) -> Result<AssembledIndex> {
        let mut index = self.canvas.clone();
        let mut results = Vec::with_capacity(self.to_append.len());
        for entry in self.to_append.iter_mut() {
            if let Some(ref digest) = entry.pending.digest {
                tracing::error!(base = %entry.base, digest = %digest, "index entry already has a digest");
                return Err(LayerstackError::Contract(format!(
                    "index entry {} has digest {} already",
                    entry.position, digest
                )));
            }
            let result = each.append(&entry.base, tag).await.map_err(|e| {
                self.observer.on_event(BuildEvent::Failed {
                    component: "index".to_string(),
                    message: format!("{}: {}", entry.base, e),
                });
                e
            })?;
            entry.pending.digest = Some(result.hash.clone());

            let mut descriptor: Descriptor = result.pushed.descriptor.clone();
            if entry.pending.platform.is_some() {
                descriptor.platform = entry.pending.platform.clone();
            }
            index.manifests.push(descriptor);
            results.push(result);
        }

        let snapshot = IndexSnapshot::of(&index)?;
        registry.put_manifest(tag, &snapshot).await?;
        self.observer.on_event(BuildEvent::IndexPushed {
            reference: tag.to_string(),
            digest: snapshot.digest.to_string(),
            manifests: index.manifests.len(),
        });

        let artifact = Artifact::index_image(
            tag,
            snapshot.digest.clone(),
            &snapshot.media_type,
            &index,
            base_ref,
        );
        Ok(AssembledIndex {
            artifact,
            index,
            results,
        })
    }
}

fn require_digest(base: &Reference) -> Result<()> {
    if base.digest().is_none() {
        return Err(LayerstackError::InvalidReference {
            reference: base.written().to_string(),
            reason: "a base index must be referenced by digest".to_string(),
        });
    }
    Ok(())
}

fn skip_reason(child: &Descriptor, matcher: &PlatformMatcher) -> Option<SkipReason> {
    let Some(ref platform) = child.platform else {
        return Some(SkipReason::NoPlatform);
    };
    if ManifestKind::of(&child.media_type) != ManifestKind::OciManifest {
        return Some(SkipReason::UnsupportedMediaType(child.media_type.clone()));
    }
    if is_attestation(child) {
        return Some(SkipReason::Attestation {
            refers_to: child
                .annotation(REFERENCE_DIGEST_ANNOTATION)
                .map(str::to_string),
        });
    }
    if !matcher.matches(Some(platform)) {
        return Some(SkipReason::PlatformNotSelected(platform.to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{OCI_MANIFEST, REFERENCE_TYPE_ANNOTATION, REFERENCE_TYPE_ATTESTATION};
    use crate::logging::NoopObserver;
    use crate::oci::manifest::ImageConfig;
    use crate::oci::memory::MemoryRegistry;

    fn child(platform: Option<&str>) -> Descriptor {
        let mut d = Descriptor::new(OCI_MANIFEST, Digest::sha256(b"child"), 100);
        d.platform = platform.map(|p| Platform::parse(p).unwrap());
        d
    }

    #[test]
    fn test_skip_order() {
        let any = PlatformMatcher::any();
        assert_eq!(skip_reason(&child(None), &any), Some(SkipReason::NoPlatform));

        let mut docker = child(Some("linux/amd64"));
        docker.media_type = crate::constants::DOCKER_MANIFEST.to_string();
        assert!(matches!(
            skip_reason(&docker, &any),
            Some(SkipReason::UnsupportedMediaType(_))
        ));

        let mut attestation = child(Some("unknown/unknown"));
        attestation.annotations = Some(
            [
                (REFERENCE_TYPE_ANNOTATION.to_string(), REFERENCE_TYPE_ATTESTATION.to_string()),
                (REFERENCE_DIGEST_ANNOTATION.to_string(), "sha256:abc".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(
            skip_reason(&attestation, &any),
            Some(SkipReason::Attestation {
                refers_to: Some("sha256:abc".to_string())
            })
        );

        let arm = PlatformMatcher::new(&["linux/arm64"]).unwrap();
        assert!(matches!(
            skip_reason(&child(Some("linux/arm64/v8")), &arm),
            Some(SkipReason::PlatformNotSelected(_))
        ));
        assert_eq!(skip_reason(&child(Some("linux/arm64")), &arm), None);
    }

    #[test]
    fn test_snapshot_is_stable() {
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(OCI_INDEX.to_string()),
            manifests: vec![child(Some("linux/amd64"))],
            annotations: None,
            extra: Default::default(),
        };
        let snapshot = IndexSnapshot::of(&index).unwrap();
        assert_eq!(snapshot.digest(), &Digest::sha256(snapshot.raw_manifest()));
        assert_eq!(snapshot.size(), snapshot.raw_manifest().len() as u64);
        assert_eq!(snapshot, IndexSnapshot::of(&index).unwrap());
    }

    #[tokio::test]
    async fn test_tag_only_base_rejected_before_fetch() {
        let registry = MemoryRegistry::new();
        let base = Reference::parse("example.com/base:1").unwrap();
        let err = IndexAssembler::discover(
            &base,
            &PlatformMatcher::any(),
            &registry,
            Arc::new(NoopObserver),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LayerstackError::InvalidReference { .. }));
    }

    #[tokio::test]
    async fn test_nested_index_child_rejected() {
        let registry = MemoryRegistry::new();
        let repo = Reference::parse("example.com/base:1").unwrap();
        let inner = ImageIndex {
            schema_version: 2,
            media_type: Some(OCI_INDEX.to_string()),
            manifests: Vec::new(),
            annotations: None,
            extra: Default::default(),
        };
        let inner_raw = registry.seed_index(&repo, &inner).unwrap();
        let mut entry = Descriptor::new(OCI_MANIFEST, inner_raw.digest.clone(), inner_raw.bytes.len() as u64);
        entry.platform = Some(Platform::new("linux", "amd64", None));
        let outer = ImageIndex {
            manifests: vec![entry],
            ..inner.clone()
        };
        let outer_raw = registry.seed_index(&repo, &outer).unwrap();

        let base = repo.with_digest(outer_raw.digest);
        let err = IndexAssembler::discover(
            &base,
            &PlatformMatcher::any(),
            &registry,
            Arc::new(NoopObserver),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LayerstackError::NestedIndex { .. }));
    }

    #[tokio::test]
    async fn test_image_base_is_not_an_index() {
        let registry = MemoryRegistry::new();
        let repo = Reference::parse("example.com/base:1").unwrap();
        let raw = registry
            .seed_image(&repo, ManifestKind::OciManifest, &ImageConfig::empty(), Vec::new())
            .unwrap();
        let err = IndexAssembler::discover(
            &repo.with_digest(raw.digest),
            &PlatformMatcher::any(),
            &registry,
            Arc::new(NoopObserver),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LayerstackError::UnsupportedMediaType { .. }));
    }
}
