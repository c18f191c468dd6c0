use crate::config::{parse_size, LocalDirConfig, LocalFileConfig};
use crate::error::{LayerstackError, Result};
use crate::source::IgnoreRules;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Maps a path relative to the layer source onto its path in the image
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContainerPath {
    #[default]
    AsIs,
    Prepend(String),
}

impl ContainerPath {
    /// Prefix must have a leading slash and no trailing slash
    pub fn prepend(prefix: &str) -> Result<Self> {
        if !prefix.starts_with('/') {
            return Err(LayerstackError::InvalidConfig(format!(
                "containerPath must have leading slash, got: {}",
                prefix
            )));
        }
        if prefix.len() > 1 && prefix.ends_with('/') {
            return Err(LayerstackError::InvalidConfig(format!(
                "containerPath should be a path without trailing slash, got: {}",
                prefix
            )));
        }
        if prefix == "/" {
            return Ok(Self::Prepend(String::new()));
        }
        Ok(Self::Prepend(prefix.to_string()))
    }

    pub fn map(&self, relative: &str) -> String {
        match self {
            Self::AsIs => relative.to_string(),
            Self::Prepend(prefix) if relative == "." => prefix.clone(),
            Self::Prepend(prefix) => format!("{}/{}", prefix, relative),
        }
    }
}

/// A directory whose regular files become one layer
pub struct LocalDir {
    pub path: PathBuf,
    pub container_path: ContainerPath,
    pub ignore: IgnoreRules,
    pub max_files: Option<usize>,
    pub max_size: Option<u64>,
}

impl LocalDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            container_path: ContainerPath::AsIs,
            ignore: IgnoreRules::empty(),
            max_files: None,
            max_size: None,
        }
    }

    pub fn from_config(config: &LocalDirConfig) -> Result<Self> {
        if config.path.is_empty() {
            return Err(LayerstackError::InvalidConfig(
                "path must be specified (use . for CWD)".to_string(),
            ));
        }
        let container_path = match config.container_path.as_deref() {
            Some(p) if !p.is_empty() => ContainerPath::prepend(p)?,
            _ => ContainerPath::AsIs,
        };
        let max_size = config.max_size.as_deref().map(parse_size).transpose()?;
        Ok(Self {
            path: PathBuf::from(&config.path),
            container_path,
            ignore: IgnoreRules::new(&config.ignore)?,
            max_files: config.max_files.filter(|n| *n > 0),
            max_size: max_size.filter(|n| *n > 0),
        })
    }
}

/// One file placed at an absolute path in the image
pub struct LocalFile {
    pub path: PathBuf,
    pub container_path: String,
}

impl LocalFile {
    pub fn from_config(config: &LocalFileConfig) -> Result<Self> {
        if config.path.is_empty() {
            return Err(LayerstackError::InvalidConfig(
                "localFile path must be specified".to_string(),
            ));
        }
        if config.container_path.is_empty() {
            return Err(LayerstackError::InvalidConfig(
                "localFile layer requires containerPath".to_string(),
            ));
        }
        // validates the same way a directory prefix is validated
        ContainerPath::prepend(&config.container_path)?;
        Ok(Self {
            path: PathBuf::from(&config.path),
            container_path: config.container_path.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEntry {
    File {
        content: Vec<u8>,
        /// Mode of the source file, None for content that never was a file
        source_mode: Option<u32>,
    },
    Symlink { target: String },
}

impl MapEntry {
    /// Content bytes, zero for symlinks
    pub fn size(&self) -> u64 {
        match self {
            Self::File { content, .. } => content.len() as u64,
            Self::Symlink { .. } => 0,
        }
    }
}

/// Staged filesystem subtree, iterated in lexicographic path order.
///
/// Keys are image paths with exactly one leading slash, so `x` and `/x`
/// name the same entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathContentMap {
    entries: BTreeMap<String, MapEntry>,
    total_size: u64,
}

impl PathContentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, content: Vec<u8>) {
        self.insert_entry(
            path.into(),
            MapEntry::File {
                content,
                source_mode: None,
            },
        );
    }

    pub fn insert_with_mode(&mut self, path: impl Into<String>, content: Vec<u8>, mode: u32) {
        self.insert_entry(
            path.into(),
            MapEntry::File {
                content,
                source_mode: Some(mode),
            },
        );
    }

    pub fn insert_symlink(&mut self, path: impl Into<String>, target: impl Into<String>) {
        self.insert_entry(
            path.into(),
            MapEntry::Symlink {
                target: target.into(),
            },
        );
    }

    fn insert_entry(&mut self, path: String, entry: MapEntry) {
        let key = format!("/{}", path.trim_start_matches('/'));
        self.total_size += entry.size();
        if let Some(old) = self.entries.insert(key, entry) {
            self.total_size -= old.size();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of content bytes
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MapEntry)> {
        self.entries.iter()
    }
}

impl FromIterator<(String, Vec<u8>)> for PathContentMap {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (path, content) in iter {
            map.insert(path, content);
        }
        map
    }
}
