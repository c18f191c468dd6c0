//! Provenance of a successful push.
//!
//! An [`Artifact`] describes a pushed image or index without fetching it
//! again. Its JSON form is what build output writers and SBOM tooling read.

use crate::oci::digest::Digest;
use crate::oci::manifest::{image_platforms, ImageIndex};
use crate::oci::platform::Platform;
use crate::oci::reference::Reference;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ArtifactJson", into = "ArtifactJson")]
pub struct Artifact {
    /// Name without tag or digest, as configured
    pub image_name: String,
    /// Configured tag reference with the pushed digest appended
    pub tag_ref: String,
    pub media_type: String,
    pub platforms: Vec<Platform>,
    /// Base reference as configured, empty for the empty base
    pub base_ref: String,
    reference: Option<Reference>,
    hash: Option<Digest>,
    config_digest: Option<Digest>,
}

/// What HTTP clients need to address the pushed manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHttp {
    /// Registry host with port, without scheme
    pub host: String,
    /// Repository path, excluding the /v2 prefix
    pub repository: String,
    /// Tag, or "latest" if none was given
    pub tag: String,
    pub hash: Digest,
}

impl Artifact {
    fn with_ref(tag: &Reference, hash: Digest) -> Self {
        Self {
            image_name: tag.name().to_string(),
            tag_ref: format!("{}@{}", tag.written(), hash),
            media_type: String::new(),
            platforms: Vec::new(),
            base_ref: String::new(),
            reference: Some(tag.clone()),
            hash: Some(hash),
            config_digest: None,
        }
    }

    /// A pushed image without an index
    pub fn single_image(
        tag: &Reference,
        hash: Digest,
        media_type: &str,
        platform: Option<Platform>,
        config_digest: Digest,
        base_ref: &str,
    ) -> Self {
        let mut artifact = Self::with_ref(tag, hash);
        artifact.media_type = media_type.to_string();
        artifact.platforms = platform.into_iter().collect();
        artifact.config_digest = Some(config_digest);
        artifact.base_ref = base_ref.to_string();
        artifact
    }

    /// A pushed index, even one with a single platform
    pub fn index_image(
        tag: &Reference,
        hash: Digest,
        media_type: &str,
        index: &ImageIndex,
        base_ref: &str,
    ) -> Self {
        let mut artifact = Self::with_ref(tag, hash);
        artifact.media_type = media_type.to_string();
        artifact.platforms = image_platforms(index);
        artifact.base_ref = base_ref.to_string();
        artifact
    }

    pub fn reference(&self) -> Option<&Reference> {
        self.reference.as_ref()
    }

    pub fn hash(&self) -> Option<&Digest> {
        self.hash.as_ref()
    }

    /// Config digest of a single image. Never known for indexes or after deserialization.
    pub fn config_digest(&self) -> Option<&Digest> {
        self.config_digest.as_ref()
    }

    pub fn http(&self) -> Option<ArtifactHttp> {
        let reference = self.reference.as_ref()?;
        Some(ArtifactHttp {
            host: reference.registry().to_string(),
            repository: reference.repository().to_string(),
            tag: reference.tag().unwrap_or(crate::constants::DEFAULT_TAG).to_string(),
            hash: self.hash.clone()?,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct ArtifactJson {
    #[serde(rename = "imageName")]
    image_name: String,
    #[serde(rename = "tag")]
    tag_ref: String,
    #[serde(rename = "mediaType", default)]
    media_type: String,
    #[serde(default)]
    platforms: Vec<String>,
    #[serde(rename = "base", default, skip_serializing_if = "String::is_empty")]
    base_ref: String,
}

impl From<Artifact> for ArtifactJson {
    fn from(a: Artifact) -> Self {
        Self {
            image_name: a.image_name,
            tag_ref: a.tag_ref,
            media_type: a.media_type,
            platforms: a.platforms.iter().map(Platform::to_string).collect(),
            base_ref: a.base_ref,
        }
    }
}

impl From<ArtifactJson> for Artifact {
    fn from(json: ArtifactJson) -> Self {
        let (name, digest) = match json.tag_ref.rfind('@') {
            Some(at) => (&json.tag_ref[..at], Some(&json.tag_ref[at + 1..])),
            None => (json.tag_ref.as_str(), None),
        };
        let hash = digest.and_then(|d| match Digest::parse(d) {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!(tag = %json.tag_ref, error = %e, "failed to parse digest from tag");
                None
            }
        });
        let reference = match Reference::parse(name) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(tag = %json.tag_ref, error = %e, "failed to parse reference from tag");
                None
            }
        };
        Self {
            platforms: json.platforms.iter().map(|s| platform_from_str(s)).collect(),
            image_name: json.image_name,
            tag_ref: json.tag_ref,
            media_type: json.media_type,
            base_ref: json.base_ref,
            reference,
            hash,
            config_digest: None,
        }
    }
}

/// Lenient `os/arch[/variant]`, extra segments ignored
fn platform_from_str(s: &str) -> Platform {
    let mut parts = s.split('/');
    let os = parts.next().unwrap_or_default();
    let arch = parts.next().unwrap_or_default();
    let variant = parts.next();
    Platform::new(os, arch, variant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{OCI_INDEX, OCI_MANIFEST};

    #[test]
    fn test_single_image_json() {
        let hash = Digest::sha256(b"manifest");
        let tag = Reference::parse("example.com/app:dev").unwrap();
        let artifact = Artifact::single_image(
            &tag,
            hash.clone(),
            OCI_MANIFEST,
            Some(Platform::new("linux", "arm64", Some("v8"))),
            Digest::sha256(b"config"),
            "example.com/base:1",
        );
        let json: serde_json::Value = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["imageName"], "example.com/app");
        assert_eq!(json["tag"], format!("example.com/app:dev@{}", hash));
        assert_eq!(json["platforms"][0], "linux/arm64/v8");
        assert_eq!(json["base"], "example.com/base:1");
        assert_eq!(artifact.config_digest(), Some(&Digest::sha256(b"config")));
    }

    #[test]
    fn test_round_trip_rebuilds_reference_and_hash() {
        let hash = Digest::sha256(b"index");
        let index: ImageIndex = serde_json::from_str(&format!(
            r#"{{"schemaVersion":2,"mediaType":"{}","manifests":[]}}"#,
            OCI_INDEX
        ))
        .unwrap();
        let tag = Reference::parse("localhost:5000/app:1").unwrap();
        let mut artifact = Artifact::index_image(&tag, hash.clone(), OCI_INDEX, &index, "");
        artifact.platforms = vec![
            Platform::new("linux", "amd64", None),
            Platform::new("linux", "arm64", Some("v8")),
        ];
        let text = serde_json::to_string(&artifact).unwrap();
        assert!(!text.contains("\"base\""));

        let back: Artifact = serde_json::from_str(&text).unwrap();
        assert_eq!(back, artifact);
        let http = back.http().unwrap();
        assert_eq!(http.host, "localhost:5000");
        assert_eq!(http.repository, "app");
        assert_eq!(http.tag, "1");
        assert_eq!(http.hash, hash);
        assert_eq!(back.config_digest(), None);
    }

    #[test]
    fn test_config_digest_is_not_serialized() {
        let tag = Reference::parse("example.com/app:dev").unwrap();
        let artifact = Artifact::single_image(
            &tag,
            Digest::sha256(b"m"),
            OCI_MANIFEST,
            None,
            Digest::sha256(b"c"),
            "",
        );
        let back: Artifact = serde_json::from_str(&serde_json::to_string(&artifact).unwrap()).unwrap();
        assert!(back.config_digest().is_none());
        assert_eq!(back.reference(), artifact.reference());
        assert_eq!(back.hash(), artifact.hash());
    }

    #[test]
    fn test_unparseable_tag_does_not_fail() {
        let back: Artifact =
            serde_json::from_str(r#"{"imageName":"x","tag":"NOT VALID@nope","mediaType":"","platforms":[]}"#)
                .unwrap();
        assert!(back.reference().is_none());
        assert!(back.hash().is_none());
    }
}
