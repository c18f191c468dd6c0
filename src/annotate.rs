use crate::constants::{ANNOTATION_BASE_DIGEST, ANNOTATION_BASE_NAME};
use crate::oci::digest::Digest;
use crate::oci::manifest::Annotations;
use crate::oci::reference::Reference;

/// Base image provenance written into result manifests.
///
/// Both annotations describe the configured base. For a digest pinned base
/// that is the pinned digest, even when it is an index and the layers went
/// onto one of its children. The name is the configured name and tag as
/// written, and is set only when the configured base carries a tag, since a
/// bare digest names nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseAnnotations {
    name: Option<String>,
    digest: Option<Digest>,
}

impl BaseAnnotations {
    pub fn new(configured_base: Option<&Reference>) -> Self {
        let Some(base) = configured_base else {
            return Self::default();
        };
        Self {
            name: base.tag().map(|tag| format!("{}:{}", base.name(), tag)),
            digest: base.digest().cloned(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The pinned digest of the configured base, if it had one
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Add provenance. `appended_to` is used only when the configured base
    /// was not pinned, i.e. a tag resolved at build time.
    pub fn apply(&self, annotations: &mut Annotations, appended_to: &Digest) {
        let digest = self.digest.as_ref().unwrap_or(appended_to);
        annotations.insert(ANNOTATION_BASE_DIGEST.to_string(), digest.to_string());
        if let Some(ref name) = self.name {
            annotations.insert(ANNOTATION_BASE_NAME.to_string(), name.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_tagged_digest_sets_both() {
        let base = Reference::parse(&format!("example.com/base:3.19@sha256:{}", HEX)).unwrap();
        let mut annotations = Annotations::new();
        BaseAnnotations::new(Some(&base)).apply(&mut annotations, base.digest().unwrap());
        assert_eq!(annotations[ANNOTATION_BASE_NAME], "example.com/base:3.19");
        assert_eq!(annotations[ANNOTATION_BASE_DIGEST], format!("sha256:{}", HEX));
    }

    #[test]
    fn test_bare_digest_omits_name() {
        let base = Reference::parse(&format!("example.com/base@sha256:{}", HEX)).unwrap();
        let mut annotations = Annotations::new();
        BaseAnnotations::new(Some(&base)).apply(&mut annotations, base.digest().unwrap());
        assert!(!annotations.contains_key(ANNOTATION_BASE_NAME));
        assert!(annotations.contains_key(ANNOTATION_BASE_DIGEST));
    }

    #[test]
    fn test_pinned_digest_wins_over_appended_image() {
        let base = Reference::parse(&format!("base:3@sha256:{}", HEX)).unwrap();
        let child = Digest::sha256(b"child manifest");
        let mut annotations = Annotations::new();
        BaseAnnotations::new(Some(&base)).apply(&mut annotations, &child);
        assert_eq!(annotations[ANNOTATION_BASE_DIGEST], format!("sha256:{}", HEX));
        assert_eq!(annotations[ANNOTATION_BASE_NAME], "base:3");
    }

    #[test]
    fn test_tag_only_base_records_resolved_digest() {
        let base = Reference::parse("example.com/base:3.19").unwrap();
        let resolved = Digest::sha256(b"resolved");
        let mut annotations = Annotations::new();
        BaseAnnotations::new(Some(&base)).apply(&mut annotations, &resolved);
        assert_eq!(annotations[ANNOTATION_BASE_DIGEST], resolved.to_string());
        assert_eq!(annotations[ANNOTATION_BASE_NAME], "example.com/base:3.19");
    }

    #[test]
    fn test_empty_base_has_no_name() {
        assert_eq!(BaseAnnotations::new(None).name(), None);
    }
}
