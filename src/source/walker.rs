use crate::error::{LayerstackError, Result};
use crate::source::ignore::IgnoreRules;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    File,
    /// Link target exactly as stored on disk
    Symlink { target: String },
}

/// A regular file or symlink found under a layer source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Slash separated path relative to the walk root
    pub relative: String,
    pub absolute: PathBuf,
    pub kind: SourceKind,
    /// Unix mode bits of the source file
    pub mode: u32,
    /// Zero for symlinks
    pub size: u64,
}

impl SourceFile {
    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, SourceKind::Symlink { .. })
    }
}

/// Walk a directory and return all non-ignored regular files and symlinks.
///
/// Symlinks are not followed. Directories and special files are skipped. The
/// result is sorted by relative path so callers see the same order on every
/// filesystem.
pub fn walk_dir(root: &Path, ignore: &IgnoreRules) -> Result<Vec<SourceFile>> {
    let root_meta = std::fs::metadata(root)?;
    if !root_meta.is_dir() {
        return Err(LayerstackError::InvalidConfig(format!(
            "localDir configured for what looks like a file, use a localFile layer instead: {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let file_type = entry.file_type();
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }
        let relative = relative_slash_path(root, entry.path());
        if ignore.matches_or_parent_matches(&relative) {
            tracing::debug!(path = %relative, "ignored");
            continue;
        }
        let meta = entry.metadata()?;
        let (kind, size) = if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            let target = target.to_string_lossy().into_owned();
            (SourceKind::Symlink { target }, 0)
        } else {
            (SourceKind::File, meta.len())
        };
        files.push(SourceFile {
            relative,
            absolute: entry.path().to_path_buf(),
            kind,
            mode: source_mode(&meta),
            size,
        });
    }

    // explicit sort by path for OS-independent determinism
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

fn relative_slash_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
pub(crate) fn source_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
pub(crate) fn source_mode(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        crate::constants::DEFAULT_FILE_MODE
    }
}
