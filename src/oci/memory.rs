use crate::error::{LayerstackError, Result};
use crate::oci::digest::Digest;
use crate::oci::manifest::{Descriptor, ImageConfig, ImageIndex, ImageManifest, ManifestKind};
use crate::oci::reference::Reference;
use crate::oci::registry::{ManifestPayload, RawManifest, Registry};
use async_trait::async_trait;
use std::collections::HashMap;
use parking_lot::Mutex;

#[derive(Default)]
struct State {
    blobs: HashMap<String, HashMap<Digest, Vec<u8>>>,
    /// repository context → tag or digest → manifest
    manifests: HashMap<String, HashMap<String, RawManifest>>,
    pushed: Vec<(String, RawManifest)>,
    blob_puts: usize,
    fail_blob_push: Option<String>,
    fail_manifest_push: Option<String>,
}

/// In-process registry, used for dry runs and tests
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock())
    }

    pub fn seed_blob(&self, repo: &Reference, data: Vec<u8>) -> Digest {
        let digest = Digest::sha256(&data);
        let key = digest.clone();
        self.with_state(|s| {
            s.blobs.entry(repo.context()).or_default().insert(key, data);
        });
        digest
    }

    /// Store a manifest by digest, and by tag when the reference carries one
    pub fn seed_manifest(&self, target: &Reference, raw: RawManifest) {
        self.with_state(|s| store_manifest(s, target, raw))
    }

    /// Store an image built from a config and already compressed layer blobs
    pub fn seed_image(
        &self,
        target: &Reference,
        kind: ManifestKind,
        config: &ImageConfig,
        layers: Vec<Vec<u8>>,
    ) -> Result<RawManifest> {
        let config_bytes = serde_json::to_vec(config)?;
        let config_size = config_bytes.len() as u64;
        let config_digest = self.seed_blob(target, config_bytes);
        let mut descriptors = Vec::with_capacity(layers.len());
        for layer in layers {
            let size = layer.len() as u64;
            let digest = self.seed_blob(target, layer);
            descriptors.push(Descriptor::new(kind.layer_media_type(), digest, size));
        }
        let media_type = match kind {
            ManifestKind::Other(ref mt) => mt.clone(),
            ManifestKind::DockerManifest | ManifestKind::DockerManifestList => {
                crate::constants::DOCKER_MANIFEST.to_string()
            }
            _ => crate::constants::OCI_MANIFEST.to_string(),
        };
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_type.clone()),
            config: Descriptor::new(kind.config_media_type(), config_digest, config_size),
            layers: descriptors,
            annotations: None,
            extra: Default::default(),
        };
        let raw = RawManifest::new(media_type, serde_json::to_vec(&manifest)?);
        self.seed_manifest(target, raw.clone());
        Ok(raw)
    }

    pub fn seed_index(&self, target: &Reference, index: &ImageIndex) -> Result<RawManifest> {
        let media_type = index
            .media_type
            .clone()
            .unwrap_or_else(|| crate::constants::OCI_INDEX.to_string());
        let raw = RawManifest::new(media_type, serde_json::to_vec(index)?);
        self.seed_manifest(target, raw.clone());
        Ok(raw)
    }

    /// Make every following blob upload fail
    pub fn fail_blob_pushes(&self, reason: &str) {
        self.with_state(|s| s.fail_blob_push = Some(reason.to_string()));
    }

    /// Make every following manifest upload fail
    pub fn fail_manifest_pushes(&self, reason: &str) {
        self.with_state(|s| s.fail_manifest_push = Some(reason.to_string()));
    }

    /// Manifests written through [`Registry::put_manifest`], with their target, in order
    pub fn pushed_manifests(&self) -> Vec<(String, RawManifest)> {
        self.with_state(|s| s.pushed.clone())
    }

    pub fn blob_uploads(&self) -> usize {
        self.with_state(|s| s.blob_puts)
    }

    pub fn has_blob(&self, repo: &Reference, digest: &Digest) -> bool {
        self.with_state(|s| {
            s.blobs
                .get(&repo.context())
                .map(|b| b.contains_key(digest))
                .unwrap_or(false)
        })
    }
}

fn store_manifest(state: &mut State, target: &Reference, raw: RawManifest) {
    let repo = state.manifests.entry(target.context()).or_default();
    if let Some(tag) = target.tag() {
        repo.insert(tag.to_string(), raw.clone());
    }
    repo.insert(raw.digest.to_string(), raw);
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_manifest(&self, reference: &Reference) -> Result<RawManifest> {
        let key = match reference.digest() {
            Some(d) => d.to_string(),
            None => reference.identifier(),
        };
        self.with_state(|s| {
            s.manifests
                .get(&reference.context())
                .and_then(|m| m.get(&key))
                .cloned()
        })
        .ok_or_else(|| LayerstackError::registry("pull", format!("manifest unknown: {}", reference)))
    }

    async fn get_blob(&self, repo: &Reference, digest: &Digest) -> Result<Vec<u8>> {
        self.with_state(|s| {
            s.blobs
                .get(&repo.context())
                .and_then(|b| b.get(digest))
                .cloned()
        })
        .ok_or_else(|| LayerstackError::registry("pull", format!("blob unknown: {}", digest)))
    }

    async fn blob_exists(&self, repo: &Reference, digest: &Digest) -> Result<bool> {
        Ok(self.has_blob(repo, digest))
    }

    async fn put_blob(&self, repo: &Reference, digest: &Digest, data: Vec<u8>) -> Result<()> {
        if Digest::sha256(&data) != *digest {
            return Err(LayerstackError::registry(
                "upload",
                format!("content does not match {}", digest),
            ));
        }
        self.with_state(|s| {
            if let Some(ref reason) = s.fail_blob_push {
                return Err(LayerstackError::registry("upload", reason));
            }
            s.blob_puts += 1;
            s.blobs
                .entry(repo.context())
                .or_default()
                .insert(digest.clone(), data);
            Ok(())
        })
    }

    async fn mount_blob(&self, from: &Reference, to: &Reference, digest: &Digest) -> Result<bool> {
        Ok(self.with_state(|s| {
            let Some(data) = s
                .blobs
                .get(&from.context())
                .and_then(|b| b.get(digest))
                .cloned()
            else {
                return false;
            };
            s.blobs
                .entry(to.context())
                .or_default()
                .insert(digest.clone(), data);
            true
        }))
    }

    async fn put_manifest(&self, target: &Reference, manifest: &dyn ManifestPayload) -> Result<()> {
        let raw = RawManifest {
            media_type: manifest.media_type().to_string(),
            bytes: manifest.raw_manifest().to_vec(),
            digest: manifest.digest().clone(),
        };
        self.with_state(|s| {
            if let Some(ref reason) = s.fail_manifest_push {
                return Err(LayerstackError::registry("push", reason));
            }
            s.pushed.push((target.to_string(), raw.clone()));
            store_manifest(s, target, raw);
            Ok(())
        })
    }
}
