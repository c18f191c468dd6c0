use crate::error::{LayerstackError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Platform tuple of an image or index entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: variant.map(str::to_string),
            ..Default::default()
        }
    }

    /// Parse `os[/arch[/variant]]`
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| LayerstackError::InvalidPlatform {
            value: value.to_string(),
            reason: reason.to_string(),
        };
        if value.trim().is_empty() {
            return Err(invalid("empty platform"));
        }
        let parts: Vec<&str> = value.trim().split('/').collect();
        if parts.len() > 3 {
            return Err(invalid("expected os[/arch[/variant]]"));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty segment"));
        }
        Ok(Self {
            os: parts[0].to_string(),
            architecture: parts.get(1).map(|s| s.to_string()).unwrap_or_default(),
            variant: parts.get(2).map(|s| s.to_string()),
            ..Default::default()
        })
    }

    /// Full tuple equality, so a missing variant only matches a missing variant
    pub fn same_tuple(&self, other: &Platform) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && self.variant == other.variant
            && self.os_version == other.os_version
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.os)?;
        if !self.architecture.is_empty() {
            write!(f, "/{}", self.architecture)?;
        }
        if let Some(ref v) = self.variant {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = LayerstackError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Predicate over index entry platforms built from configured platform strings
#[derive(Debug, Clone, Default)]
pub struct PlatformMatcher {
    wanted: Vec<Platform>,
}

impl PlatformMatcher {
    pub fn new<S: AsRef<str>>(platforms: &[S]) -> Result<Self> {
        let wanted = platforms
            .iter()
            .map(|p| Platform::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { wanted })
    }

    /// Matches everything
    pub fn any() -> Self {
        Self::default()
    }

    pub fn wanted(&self) -> &[Platform] {
        &self.wanted
    }

    pub fn is_unrestricted(&self) -> bool {
        self.wanted.is_empty()
    }

    /// Configured platforms that none of `found` satisfies
    pub fn unmatched<'a>(&self, found: impl IntoIterator<Item = &'a Platform>) -> Vec<&Platform> {
        let found: Vec<&Platform> = found.into_iter().collect();
        self.wanted
            .iter()
            .filter(|w| !found.iter().any(|f| w.same_tuple(f)))
            .collect()
    }

    pub fn matches(&self, candidate: Option<&Platform>) -> bool {
        if self.wanted.is_empty() {
            return true;
        }
        match candidate {
            Some(c) => self.wanted.iter().any(|w| w.same_tuple(c)),
            None => false,
        }
    }
}
