//! Integrity Verifier - re-reads every archive of a backup set and checks it
//! against the manifest.
//!
//! Verification is read-only. It reports what it found and leaves status
//! transitions to the caller.

use super::archive::inspect_archive;
use super::manifest::{read_manifest, Manifest, MANIFEST_FILENAME};
use crate::fs::checksum::sha256_file;
use crate::models::{BackupStatus, SourceEntry};
use crate::utils::BackupError;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of checking one source archive.
#[derive(Debug)]
pub struct SourceCheck {
    pub name: String,
    pub archive_filename: String,
    /// Number of tar entries, when the archive could be listed
    pub entries: Option<usize>,
    pub error: Option<BackupError>,
}

impl SourceCheck {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct VerificationResult {
    pub set_dir: PathBuf,
    /// `None` when the manifest could not be loaded
    pub manifest: Option<Manifest>,
    pub checks: Vec<SourceCheck>,
    /// Problems with the set as a whole rather than one archive
    pub set_errors: Vec<BackupError>,
}

impl VerificationResult {
    /// Every check passed. Says nothing about the recorded status.
    pub fn passed(&self) -> bool {
        self.manifest.is_some()
            && self.set_errors.is_empty()
            && self.checks.iter().all(SourceCheck::passed)
    }

    pub fn recorded_status(&self) -> Option<BackupStatus> {
        self.manifest.as_ref().map(|m| m.backup_set.status)
    }

    /// Checks pass and the set was sealed as `verified`.
    pub fn is_restorable(&self) -> bool {
        self.passed() && self.recorded_status() == Some(BackupStatus::Verified)
    }

    pub fn errors(&self) -> impl Iterator<Item = &BackupError> {
        self.checks
            .iter()
            .filter_map(|c| c.error.as_ref())
            .chain(self.set_errors.iter())
    }

    pub fn first_error(&self) -> Option<&BackupError> {
        self.errors().next()
    }

    pub fn into_first_error(self) -> Option<BackupError> {
        self.checks
            .into_iter()
            .filter_map(|c| c.error)
            .chain(self.set_errors)
            .next()
    }
}

/// Verify the backup set stored in `set_dir`.
pub fn verify(set_dir: &Path) -> VerificationResult {
    let mut result = VerificationResult {
        set_dir: set_dir.to_path_buf(),
        manifest: None,
        checks: Vec::new(),
        set_errors: Vec::new(),
    };

    let manifest = match read_manifest(set_dir) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(
                set_dir = %set_dir.display(),
                error = %e,
                "Verification failed: manifest unusable"
            );
            result.set_errors.push(e);
            return result;
        }
    };

    let mut expected_files: HashSet<&str> = HashSet::new();
    for entry in &manifest.backup_set.sources {
        if !expected_files.insert(entry.archive_filename.as_str()) {
            result.set_errors.push(BackupError::ManifestCorrupt {
                path: set_dir.join(MANIFEST_FILENAME),
                reason: format!("archive {} listed twice", entry.archive_filename),
            });
        }
        result.checks.push(check_source(set_dir, entry));
    }

    match unexpected_entries(set_dir, &expected_files) {
        Ok(extra) => {
            for name in extra {
                result.set_errors.push(BackupError::ManifestCorrupt {
                    path: set_dir.join(&name),
                    reason: format!("unexpected entry {}", name),
                });
            }
        }
        Err(e) => result.set_errors.push(BackupError::ManifestCorrupt {
            path: set_dir.to_path_buf(),
            reason: format!("cannot list set directory: {}", e),
        }),
    }

    let set_id = manifest.backup_set.id.clone();
    result.manifest = Some(manifest);

    if result.passed() {
        info!(set_id = %set_id, sources = result.checks.len(), "Backup set verified");
    } else {
        for error in result.errors() {
            warn!(
                set_id = %set_id,
                source = error.source_name().unwrap_or("-"),
                error = %error,
                "Verification error"
            );
        }
    }

    result
}

fn check_source(set_dir: &Path, entry: &SourceEntry) -> SourceCheck {
    let mut check = SourceCheck {
        name: entry.name.clone(),
        archive_filename: entry.archive_filename.clone(),
        entries: None,
        error: None,
    };

    match check_archive(set_dir, entry) {
        Ok(count) => {
            debug!(source = %entry.name, entries = count, "Archive verified");
            check.entries = Some(count);
        }
        Err(e) => check.error = Some(e),
    }
    check
}

fn check_archive(set_dir: &Path, entry: &SourceEntry) -> Result<usize, BackupError> {
    let corrupt = |reason: String| BackupError::ArchiveCorrupt {
        source_name: entry.name.clone(),
        reason,
    };

    if !is_plain_file_name(&entry.archive_filename) {
        return Err(corrupt(format!(
            "archive filename {:?} is not a plain file name",
            entry.archive_filename
        )));
    }
    let path = set_dir.join(&entry.archive_filename);

    let metadata = match fs::symlink_metadata(&path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(corrupt("archive is not a regular file".into())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(corrupt("archive file missing".into()));
        }
        Err(e) => return Err(corrupt(format!("unreadable: {}", e))),
    };

    let actual = sha256_file(&path).map_err(|e| corrupt(format!("unreadable: {}", e)))?;
    if !actual.eq_ignore_ascii_case(&entry.checksum) {
        return Err(BackupError::ChecksumMismatch {
            source_name: entry.name.clone(),
            expected: entry.checksum.clone(),
            actual,
        });
    }
    if metadata.len() != entry.size_bytes {
        return Err(BackupError::ChecksumMismatch {
            source_name: entry.name.clone(),
            expected: format!("{} bytes", entry.size_bytes),
            actual: format!("{} bytes", metadata.len()),
        });
    }

    inspect_archive(&path).map_err(|e| corrupt(e.to_string()))
}

fn unexpected_entries(set_dir: &Path, expected: &HashSet<&str>) -> io::Result<Vec<String>> {
    let mut extra = Vec::new();
    for entry in fs::read_dir(set_dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name != MANIFEST_FILENAME && !expected.contains(name.as_str()) {
            extra.push(name);
        }
    }
    extra.sort();
    Ok(extra)
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}
