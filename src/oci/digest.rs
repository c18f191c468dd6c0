use crate::error::{LayerstackError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Content digest in `algorithm:hex` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// sha256 digest of the given bytes
    pub fn sha256(data: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            hex: sha256_bytes(data),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let (algorithm, hex) = value.split_once(':').ok_or_else(|| {
            LayerstackError::InvalidReference {
                reference: value.to_string(),
                reason: "digest must be algorithm:hex".to_string(),
            }
        })?;
        let valid_hex = !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());
        if algorithm.is_empty() || !valid_hex {
            return Err(LayerstackError::InvalidReference {
                reference: value.to_string(),
                reason: "digest must be algorithm:hex".to_string(),
            });
        }
        if algorithm == "sha256" && hex.len() != 64 {
            return Err(LayerstackError::InvalidReference {
                reference: value.to_string(),
                reason: format!("sha256 digest has {} hex chars, expected 64", hex.len()),
            });
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_ascii_lowercase(),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Short form for log lines
    pub fn short(&self) -> &str {
        &self.hex[..12.min(self.hex.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = LayerstackError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
