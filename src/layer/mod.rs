//! Deterministic layer construction.
//!
//! Sources are staged into a [`PathContentMap`] and serialized as a gzip
//! compressed tar with sorted entries, epoch mtimes and uniform ownership,
//! so identical logical content always produces the same digest.

pub mod source;

pub use source::{ContainerPath, LocalDir, LocalFile, MapEntry, PathContentMap};

use crate::config::{FileModePolicy, LayerAttributes, LayerConfig};
use crate::constants::{
    DEFAULT_EXECUTABLE_MODE, DEFAULT_FILE_MODE, EXECUTABLE_MASK, PERMISSION_MASK, SYMLINK_MODE,
};
use crate::error::{LayerstackError, Result};
use crate::logging::{BuildEvent, BuildObserver};
use crate::oci::digest::Digest;
use crate::oci::manifest::Descriptor;
use crate::source::{walk_dir, walker::source_mode, SourceKind};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tar::{Builder, EntryType, Header};

/// A compressed layer blob and its identities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    blob: Vec<u8>,
    digest: Digest,
    diff_id: Digest,
}

impl Layer {
    /// Compress an uncompressed tar stream
    pub fn from_tar(tar: &[u8]) -> Result<Self> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(tar)?;
        let blob = encoder.finish()?;
        Ok(Self {
            digest: Digest::sha256(&blob),
            diff_id: Digest::sha256(tar),
            blob,
        })
    }

    /// Digest of the compressed blob
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Digest of the uncompressed tar
    pub fn diff_id(&self) -> &Digest {
        &self.diff_id
    }

    pub fn size(&self) -> u64 {
        self.blob.len() as u64
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Descriptor in the dialect the caller chose
    pub fn descriptor(&self, media_type: &str) -> Descriptor {
        Descriptor::new(media_type, self.digest.clone(), self.size())
    }
}

/// Mode written for a regular file entry
pub fn entry_mode(source_mode: Option<u32>, attributes: &LayerAttributes) -> u32 {
    if let Some(mode) = attributes.file_mode {
        return mode & PERMISSION_MASK;
    }
    match (source_mode, attributes.mode_policy) {
        (None, _) => DEFAULT_FILE_MODE,
        (Some(m), FileModePolicy::Preserve) => m & PERMISSION_MASK,
        (Some(m), FileModePolicy::Normalize) if m & EXECUTABLE_MASK != 0 => DEFAULT_EXECUTABLE_MODE,
        (Some(_), FileModePolicy::Normalize) => DEFAULT_FILE_MODE,
    }
}

/// Serialize a map as an uncompressed tar in path order
pub fn write_tar(map: &PathContentMap, attributes: &LayerAttributes) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    for (path, entry) in map.iter() {
        let mut header = Header::new_gnu();
        header.set_uid(u64::from(attributes.uid.unwrap_or(0)));
        header.set_gid(u64::from(attributes.gid.unwrap_or(0)));
        header.set_mtime(0);
        // archive entries are relative to the image root
        let name = path.trim_start_matches('/');
        match entry {
            MapEntry::File {
                content,
                source_mode,
            } => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(content.len() as u64);
                header.set_mode(entry_mode(*source_mode, attributes));
                builder.append_data(&mut header, name, content.as_slice())?;
            }
            MapEntry::Symlink { target } => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                header.set_mode(SYMLINK_MODE);
                builder.append_link(&mut header, name, target)?;
            }
        }
    }
    Ok(builder.into_inner()?)
}

/// Builds layers from configured sources, reporting to an observer
pub struct LayerBuilder {
    observer: Arc<dyn BuildObserver>,
}

impl LayerBuilder {
    pub fn new(observer: Arc<dyn BuildObserver>) -> Self {
        Self { observer }
    }

    pub fn from_config(&self, config: &LayerConfig) -> Result<Layer> {
        let attributes = &config.layer_attributes;
        match (&config.local_dir, &config.local_file) {
            (Some(dir), None) => self.from_dir(&LocalDir::from_config(dir)?, attributes),
            (None, Some(file)) => self.from_file(&LocalFile::from_config(file)?, attributes),
            _ => Err(LayerstackError::InvalidConfig(
                "layer needs exactly one of localDir and localFile".to_string(),
            )),
        }
    }

    /// Stage every retained file under the directory, enforcing limits as files are added
    pub fn from_dir(&self, dir: &LocalDir, attributes: &LayerAttributes) -> Result<Layer> {
        let source = dir.path.display().to_string();
        let files = walk_dir(&dir.path, &dir.ignore)?;

        let mut map = PathContentMap::new();
        let mut total: u64 = 0;
        for file in files {
            if let Some(max) = dir.max_files {
                if map.len() >= max {
                    return Err(LayerstackError::LimitExceeded {
                        what: "number of files",
                        actual: map.len() as u64 + 1,
                        limit: max as u64,
                    });
                }
            }
            total += file.size;
            if let Some(max) = dir.max_size {
                if total > max {
                    return Err(LayerstackError::LimitExceeded {
                        what: "accumulated file size",
                        actual: total,
                        limit: max,
                    });
                }
            }
            let to = dir.container_path.map(&file.relative);
            match file.kind {
                SourceKind::Symlink { ref target } if Path::new(target).is_absolute() => {
                    self.observer.on_event(BuildEvent::Warning {
                        message: format!(
                            "skipping symlink {} pointing outside the source tree: {}",
                            file.relative, target
                        ),
                    });
                }
                SourceKind::Symlink { ref target } => {
                    tracing::trace!(from = %file.relative, to = %to, target = %target, "added symlink");
                    map.insert_symlink(to, target.clone());
                }
                SourceKind::File => {
                    let content = fs::read(&file.absolute)?;
                    tracing::trace!(from = %file.relative, to = %to, size = content.len(), "added file");
                    map.insert_with_mode(to, content, file.mode);
                }
            }
        }

        if map.is_empty() {
            return Err(LayerstackError::EmptyLayer {
                source_path: source,
            });
        }
        self.build(&source, &map, attributes)
    }

    pub fn from_file(&self, file: &LocalFile, attributes: &LayerAttributes) -> Result<Layer> {
        let meta = fs::metadata(&file.path)?;
        if !meta.is_file() {
            return Err(LayerstackError::InvalidConfig(format!(
                "localFile must be a regular file: {}",
                file.path.display()
            )));
        }
        let content = fs::read(&file.path)?;
        let mut map = PathContentMap::new();
        map.insert_with_mode(file.container_path.clone(), content, source_mode(&meta));
        self.build(&file.path.display().to_string(), &map, attributes)
    }

    /// Layer from content that is already in memory
    pub fn from_map(&self, map: &PathContentMap, attributes: &LayerAttributes) -> Result<Layer> {
        if map.is_empty() {
            return Err(LayerstackError::EmptyLayer {
                source_path: "path content map".to_string(),
            });
        }
        self.build("path content map", map, attributes)
    }

    fn build(&self, source: &str, map: &PathContentMap, attributes: &LayerAttributes) -> Result<Layer> {
        let tar = write_tar(map, attributes)?;
        let layer = Layer::from_tar(&tar)?;
        self.observer.on_event(BuildEvent::LayerBuilt {
            source: source.to_string(),
            files: map.len(),
            bytes: map.total_size(),
            digest: layer.digest().to_string(),
        });
        Ok(layer)
    }
}
