//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1` or
//! `example.com/base:3@sha256:...` into registry, repository, tag and digest.

use crate::constants::{DEFAULT_REGISTRY, DEFAULT_TAG};
use crate::error::{LayerstackError, Result};
use crate::oci::digest::Digest;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn tag_pattern() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("static regex"))
}

fn repository_pattern() -> &'static Regex {
    static REPO: OnceLock<Regex> = OnceLock::new();
    REPO.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$")
            .expect("static regex")
    })
}

/// Parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The reference as written
    written: String,
    /// Name as written, without tag or digest
    name: String,
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// Parse an image reference string.
    ///
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `localhost:5000/app:dev` → localhost:5000/app:dev
    /// - `example.com/org/app@sha256:…` → digest only, no tag
    /// - `example.com/org/app:3@sha256:…` → tagged digest
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let invalid = |reason: &str| LayerstackError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };
        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((n, d)) => (n, Some(Digest::parse(d)?)),
            None => (reference, None),
        };

        // a colon after the last slash separates the tag, otherwise it's a port
        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };
        if name.is_empty() {
            return Err(invalid("missing repository"));
        }
        if let Some(ref t) = tag {
            if !tag_pattern().is_match(t) {
                return Err(invalid("invalid tag"));
            }
        }

        let (registry, repository) = split_registry_repository(name);
        if !repository_pattern().is_match(&repository) {
            return Err(invalid("invalid repository"));
        }

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(Self {
            written: reference.to_string(),
            name: name.to_string(),
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// The name as written in configuration, without tag or digest
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full reference as written, without registry or tag defaults
    pub fn written(&self) -> &str {
        &self.written
    }

    /// Tag if any, else the digest
    pub fn identifier(&self) -> String {
        match (&self.tag, &self.digest) {
            (Some(t), _) => t.clone(),
            (None, Some(d)) => d.to_string(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// `registry/repository`
    pub fn context(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The same repository pinned to another digest, without tag
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            written: format!("{}@{}", self.name, digest),
            name: self.name.clone(),
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }

    pub fn same_repository(&self, other: &Reference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }
}

fn split_registry_repository(name: &str) -> (String, String) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first.to_string(), rest.to_string());
        }
    }
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    (DEFAULT_REGISTRY.to_string(), repository)
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(ref t) = self.tag {
            write!(f, ":{}", t)?;
        }
        if let Some(ref d) = self.digest {
            write!(f, "@{}", d)?;
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = LayerstackError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_docker_hub_short_name() {
        let r = Reference::parse("nginx").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "library/nginx");
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.name(), "nginx");
        assert_eq!(r.written(), "nginx");
        assert_eq!(r.to_string(), "docker.io/library/nginx:latest");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = Reference::parse("localhost:5000/app:dev").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "app");
        assert_eq!(r.tag(), Some("dev"));
        assert_eq!(r.to_string(), "localhost:5000/app:dev");
    }

    #[test]
    fn test_parse_digest_only() {
        let r = Reference::parse(&format!("ghcr.io/org/app@sha256:{}", HEX)).unwrap();
        assert_eq!(r.tag(), None);
        assert_eq!(r.digest().unwrap().hex(), HEX);
    }

    #[test]
    fn test_parse_tagged_digest() {
        let r = Reference::parse(&format!("ghcr.io/org/app:3.1@sha256:{}", HEX)).unwrap();
        assert_eq!(r.tag(), Some("3.1"));
        assert!(r.digest().is_some());
        assert_eq!(r.name(), "ghcr.io/org/app");
    }

    #[test]
    fn test_with_digest_drops_tag() {
        let r = Reference::parse("ghcr.io/org/app:3.1").unwrap();
        let child = r.with_digest(Digest::sha256(b"child"));
        assert_eq!(child.tag(), None);
        assert_eq!(child.context(), "ghcr.io/org/app");
        assert!(child.written().starts_with("ghcr.io/org/app@sha256:"));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("Example.com/UPPER:tag").is_err());
        assert!(Reference::parse("example.com/app@sha256:short").is_err());
        assert!(Reference::parse("example.com/app:bad tag").is_err());
    }
}
