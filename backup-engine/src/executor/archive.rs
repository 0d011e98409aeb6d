//! Archive Builder - packs one source into a compressed tarball inside a
//! backup set directory and records its checksum.
//!
//! Volume sources are first exported into a staging directory by the
//! `VolumeTransfer` collaborator and then packed exactly like a filesystem
//! source.

use crate::collab::VolumeTransfer;
use crate::config::{Config, SourceConfig};
use crate::fs::checksum::sha256_file;
use crate::fs::space::{available_space, is_out_of_space};
use crate::fs::walker::{walk_directory, FileInfo, WalkOptions};
use crate::models::{SourceEntry, SourceKind};
use crate::utils::errors::{BackupError, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const ARCHIVE_EXTENSION: &str = "tar.zst";

/// Deterministic archive file name for a source.
pub fn archive_filename(source_name: &str) -> String {
    let slug = slug(source_name);
    let base = if slug.is_empty() { "source" } else { slug.as_str() };
    format!("{}.{}", base, ARCHIVE_EXTENSION)
}

fn slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

pub struct ArchiveBuilder<'a> {
    volumes: &'a dyn VolumeTransfer,
    staging_root: PathBuf,
    compression_level: i32,
    reserve_bytes: u64,
}

impl<'a> ArchiveBuilder<'a> {
    pub fn new(config: &Config, volumes: &'a dyn VolumeTransfer) -> Self {
        Self {
            volumes,
            staging_root: config.storage.staging_path(),
            compression_level: config.archive.compression_level,
            reserve_bytes: config.storage.reserve_bytes,
        }
    }

    /// Archive `source` into `destination_dir`.
    pub fn build(&self, source: &SourceConfig, destination_dir: &Path) -> Result<SourceEntry> {
        match source.kind {
            SourceKind::FilesystemPath => {
                let root = source.path.as_deref().ok_or_else(|| BackupError::SourceUnavailable {
                    name: source.name.clone(),
                    reason: "no path configured".into(),
                })?;
                if !root.is_dir() {
                    return Err(BackupError::SourceUnavailable {
                        name: source.name.clone(),
                        reason: format!("{} does not exist or is not a directory", root.display()),
                    });
                }
                self.archive_tree(source, root, destination_dir)
            }
            SourceKind::ContainerVolume => {
                let staging = self.staging_dir(source)?;
                debug!(
                    source = %source.name,
                    volume = source.volume_name(),
                    staging = %staging.path().display(),
                    "Exporting volume"
                );
                self.volumes
                    .export_volume(source.volume_name(), staging.path())
                    .map_err(|e| BackupError::SourceUnavailable {
                        name: source.name.clone(),
                        reason: format!("volume export failed: {e:#}"),
                    })?;
                // Staging directory is removed when `staging` drops
                self.archive_tree(source, staging.path(), destination_dir)
            }
        }
    }

    fn staging_dir(&self, source: &SourceConfig) -> Result<tempfile::TempDir> {
        let write_failed = |error: io::Error| BackupError::ArchiveWriteFailed {
            name: source.name.clone(),
            error,
        };
        fs::create_dir_all(&self.staging_root).map_err(write_failed)?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", slug(&source.name)))
            .tempdir_in(&self.staging_root)
            .map_err(write_failed)
    }

    fn archive_tree(
        &self,
        source: &SourceConfig,
        root: &Path,
        destination_dir: &Path,
    ) -> Result<SourceEntry> {
        let entries = walk_directory(root, &WalkOptions::excluding(&source.exclude)).map_err(|e| {
            BackupError::SourceUnavailable {
                name: source.name.clone(),
                reason: format!("cannot read {}: {}", root.display(), e),
            }
        })?;

        let source_bytes: u64 = entries.iter().map(|e| e.size).sum();
        let required = source_bytes.saturating_add(self.reserve_bytes);
        let available = available_space(destination_dir).map_err(|error| {
            BackupError::ArchiveWriteFailed {
                name: source.name.clone(),
                error,
            }
        })?;
        if available < required {
            return Err(BackupError::InsufficientSpace {
                name: source.name.clone(),
                required,
                available,
            });
        }

        let filename = source.archive_filename();
        let archive_path = destination_dir.join(&filename);

        let written = write_and_digest(&entries, &archive_path, self.compression_level);
        let (size_bytes, checksum) = match written {
            Ok(result) => result,
            Err(error) => {
                if is_out_of_space(&error) {
                    return Err(BackupError::InsufficientSpace {
                        name: source.name.clone(),
                        required,
                        available: available_space(destination_dir).unwrap_or(0),
                    });
                }
                return Err(BackupError::ArchiveWriteFailed {
                    name: source.name.clone(),
                    error,
                });
            }
        };

        info!(
            source = %source.name,
            archive = %filename,
            entries = entries.len(),
            source_bytes,
            size_bytes,
            "Source archived"
        );

        Ok(SourceEntry {
            name: source.name.clone(),
            kind: source.kind,
            archive_filename: filename,
            checksum,
            size_bytes,
        })
    }
}

/// Write the archive and return its size and SHA-256. A partially written
/// archive is removed on failure.
fn write_and_digest(
    entries: &[FileInfo],
    archive_path: &Path,
    level: i32,
) -> io::Result<(u64, String)> {
    let written = write_archive(entries, archive_path, level)
        .and_then(|()| Ok((fs::metadata(archive_path)?.len(), sha256_file(archive_path)?)));
    if written.is_err() {
        let _ = fs::remove_file(archive_path);
    }
    written
}

/// Write `entries` (as produced by the walker) into a zstd-compressed tarball.
pub fn write_archive(entries: &[FileInfo], archive_path: &Path, level: i32) -> io::Result<()> {
    let file = File::create(archive_path)?;
    let mut encoder = zstd::stream::write::Encoder::new(BufWriter::new(file), level)?;
    encoder.include_checksum(true)?;

    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in entries {
        if entry.is_dir {
            builder.append_dir(&entry.relative_path, &entry.path)?;
        } else {
            builder.append_path_with_name(&entry.path, &entry.relative_path)?;
        }
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Extract an archive into `target_dir`, preserving permissions and mtimes.
pub fn unpack_archive(archive_path: &Path, target_dir: &Path) -> io::Result<()> {
    let decoder = zstd::stream::read::Decoder::new(File::open(archive_path)?)?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.unpack(target_dir)
}

/// Read every entry of an archive without extracting it and return the entry
/// count. Fails on any decompression or tar framing error.
pub fn inspect_archive(archive_path: &Path) -> io::Result<usize> {
    let decoder = zstd::stream::read::Decoder::new(File::open(archive_path)?)?;
    let mut archive = tar::Archive::new(decoder);

    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        io::copy(&mut entry, &mut io::sink())?;
        count += 1;
    }

    // Drain past the tar trailer so truncation at the end of the frame surfaces
    let mut decoder = archive.into_inner();
    io::copy(&mut decoder, &mut io::sink())?;

    Ok(count)
}
