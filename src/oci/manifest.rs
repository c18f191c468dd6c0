use crate::constants::{
    ATTESTATION_PLATFORM, DOCKER_CONFIG, DOCKER_LAYER_GZIP, DOCKER_MANIFEST,
    DOCKER_MANIFEST_LIST, OCI_CONFIG, OCI_INDEX, OCI_LAYER_GZIP, OCI_MANIFEST,
    REFERENCE_TYPE_ANNOTATION, REFERENCE_TYPE_ATTESTATION,
};
use crate::error::Result;
use crate::oci::digest::Digest;
use crate::oci::platform::Platform;
use oci_spec::image::MediaType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type Annotations = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    /// urls, artifactType and anything else we pass through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            platform: None,
            annotations: None,
            extra: Map::new(),
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageIndex {
    /// The same index with every child removed
    pub fn without_manifests(&self) -> Self {
        Self {
            manifests: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Image config blob, keeping fields we don't touch as they were
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageConfig {
    /// Config of an image without layers or platform
    pub fn empty() -> Self {
        Self {
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: Vec::new(),
            },
            config: Some(ContainerConfig::default()),
            ..Default::default()
        }
    }

    /// Platform recorded in the config, if the config names an os
    pub fn platform(&self) -> Option<Platform> {
        if self.os.is_empty() {
            return None;
        }
        let mut p = Platform::new(&self.os, &self.architecture, self.variant.as_deref());
        p.os_version = self
            .extra
            .get("os.version")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(p)
    }

    pub fn env(&self) -> &[String] {
        self.config
            .as_ref()
            .and_then(|c| c.env.as_deref())
            .unwrap_or(&[])
    }
}

/// Manifest dialects the engine distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestKind {
    OciManifest,
    OciIndex,
    DockerManifest,
    DockerManifestList,
    Other(String),
}

impl ManifestKind {
    pub fn of(media_type: &str) -> Self {
        match MediaType::from(media_type) {
            MediaType::ImageManifest => Self::OciManifest,
            MediaType::ImageIndex => Self::OciIndex,
            _ if media_type == DOCKER_MANIFEST => Self::DockerManifest,
            _ if media_type == DOCKER_MANIFEST_LIST => Self::DockerManifestList,
            _ => Self::Other(media_type.to_string()),
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Self::OciIndex | Self::DockerManifestList)
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::OciManifest | Self::DockerManifest)
    }

    /// Layer media type matching this manifest's dialect
    pub fn layer_media_type(&self) -> &'static str {
        match self {
            Self::OciManifest | Self::OciIndex => OCI_LAYER_GZIP,
            _ => DOCKER_LAYER_GZIP,
        }
    }

    pub fn config_media_type(&self) -> &'static str {
        match self {
            Self::OciManifest | Self::OciIndex => OCI_CONFIG,
            _ => DOCKER_CONFIG,
        }
    }
}

/// Media type of raw manifest bytes when the registry sent no usable content type
pub fn sniff_media_type(bytes: &[u8]) -> Result<String> {
    let value: Value = serde_json::from_slice(bytes)?;
    if let Some(mt) = value.get("mediaType").and_then(Value::as_str) {
        return Ok(mt.to_string());
    }
    if value.get("manifests").is_some() {
        Ok(OCI_INDEX.to_string())
    } else {
        Ok(OCI_MANIFEST.to_string())
    }
}

/// BuildKit attestation entries carry a sentinel platform and a reference type annotation
pub fn is_attestation(descriptor: &Descriptor) -> bool {
    let sentinel = descriptor
        .platform
        .as_ref()
        .map(|p| p.to_string() == ATTESTATION_PLATFORM)
        .unwrap_or(false);
    sentinel && descriptor.annotation(REFERENCE_TYPE_ANNOTATION) == Some(REFERENCE_TYPE_ATTESTATION)
}

/// Platforms of the runnable image entries of an index, in index order
pub fn image_platforms(index: &ImageIndex) -> Vec<Platform> {
    index
        .manifests
        .iter()
        .filter(|d| ManifestKind::of(&d.media_type) == ManifestKind::OciManifest)
        .filter(|d| !is_attestation(d))
        .filter_map(|d| d.platform.clone())
        .collect()
}
