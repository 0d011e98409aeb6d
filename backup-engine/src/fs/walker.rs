//! Directory traversal of backup sources.
//!
//! Produces a sorted listing of everything under a source root, so archive
//! entry order is stable for a given tree.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Entries whose file name contains any of these are skipped (with their subtree)
    pub exclude_patterns: Vec<String>,
}

impl WalkOptions {
    pub fn excluding(patterns: &[String]) -> Self {
        Self {
            exclude_patterns: patterns.to_vec(),
        }
    }
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (0 for directories and symlinks)
    pub size: u64,

    pub is_dir: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        // symlink_metadata semantics: links are recorded, never resolved
        let metadata = entry.path().symlink_metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: if metadata.is_file() { metadata.len() } else { 0 },
            is_dir: metadata.is_dir(),
        })
    }
}

/// Walk a source tree and collect every entry below the root, directories
/// included, in sorted order.
///
/// # Example
/// ```no_run
/// use backup_engine::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let entries = walk_directory(Path::new("/srv/stack/config"), &WalkOptions::default()).unwrap();
/// println!("Found {} entries", entries.len());
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();

    let mut iter = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = iter.next() {
        let entry = entry?;

        if should_exclude(&entry, &options.exclude_patterns) {
            if entry.file_type().is_dir() {
                iter.skip_current_dir();
            }
            continue;
        }

        // Sockets are runtime artifacts and cannot be archived
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if entry.file_type().is_socket() {
                continue;
            }
        }

        entries.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(entries)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();

    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}
