use crate::error::{LayerstackError, Result};
use crate::oci::platform::Platform;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A complete, repeatable build: base, result tag, platforms and layers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Base image or index reference, empty for a synthetic empty base
    #[serde(default)]
    pub base: String,
    /// Result reference to push to
    pub tag: String,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub layers: Vec<LayerConfig>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayerConfig {
    #[serde(default)]
    pub layer_attributes: LayerAttributes,
    // exactly one of the following
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<LocalDirConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_file: Option<LocalFileConfig>,
}

/// A directory appended as-is with an optional path prefix, for example ./target/app to /app
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalDirConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_path: Option<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
    /// Numeric bytes, e.g. "1048576"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<String>,
}

/// A single file placed at an absolute path in the image
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalFileConfig {
    pub path: String,
    pub container_path: String,
}

/// Uniform metadata for layer entries
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LayerAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// Mode bits for files, between 0 and 0o777; overrides the mode policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    #[serde(default)]
    pub mode_policy: FileModePolicy,
}

/// How file modes are derived when no explicit `file_mode` is set
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FileModePolicy {
    /// 0644, or 0755 when the source has any executable bit
    #[default]
    Normalize,
    /// Source permission bits as-is
    Preserve,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl BuildConfig {
    /// Load a JSON build config
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: BuildConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configuration errors before any registry access
    pub fn validate(&self) -> Result<()> {
        if self.tag.trim().is_empty() {
            return Err(LayerstackError::InvalidConfig(
                "tag is required".to_string(),
            ));
        }
        for p in &self.platforms {
            Platform::parse(p)?;
        }
        for (i, layer) in self.layers.iter().enumerate() {
            match (&layer.local_dir, &layer.local_file) {
                (Some(_), Some(_)) => {
                    return Err(LayerstackError::InvalidConfig(format!(
                        "layer {} sets both localDir and localFile",
                        i
                    )))
                }
                (None, None) => {
                    return Err(LayerstackError::InvalidConfig(format!(
                        "layer {} has no layer builder config",
                        i
                    )))
                }
                (Some(dir), None) => {
                    if let Some(ref size) = dir.max_size {
                        parse_size(size)?;
                    }
                }
                (None, Some(_)) => {}
            }
            if let Some(mode) = layer.layer_attributes.file_mode {
                if mode > 0o777 {
                    return Err(LayerstackError::InvalidConfig(format!(
                        "layer {} fileMode {:o} is outside 0..=0777",
                        i, mode
                    )));
                }
            }
        }
        Ok(())
    }

    /// Env overrides as KEY=VALUE, skipping entries without a name
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .filter(|e| !e.name.is_empty())
            .map(|e| format!("{}={}", e.name, e.value))
            .collect()
    }
}

/// Parse a max size setting. Only numeric bytes are supported.
pub fn parse_size(value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        LayerstackError::InvalidConfig(format!(
            "maxSize only supports numeric bytes syntax at the moment, got: {}",
            value
        ))
    })
}
