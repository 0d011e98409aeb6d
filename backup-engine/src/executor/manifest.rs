//! Manifest of a backup set.
//!
//! Serialized as `manifest.json` in each set directory. It is the single source
//! of truth for what a set contains; verification and restore read nothing
//! else. Writes go through a temp file and a rename so a crash never leaves a
//! partial manifest at the final path.

use crate::models::{BackupSet, BackupStatus};
use crate::utils::{current_host, BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const MANIFEST_FILENAME: &str = "manifest.json";
const MANIFEST_TMP_FILENAME: &str = ".manifest.json.tmp";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    #[serde(flatten)]
    pub backup_set: BackupSet,
    pub host: String,
    pub tool_version: String,
    pub duration_ms: u64,
}

impl Manifest {
    pub fn new(backup_set: BackupSet, duration: Duration) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            backup_set,
            host: current_host(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

pub fn manifest_path(set_dir: &Path) -> PathBuf {
    set_dir.join(MANIFEST_FILENAME)
}

/// Load and parse a set's manifest. Anything short of a well-formed manifest
/// at the final path is `ManifestCorrupt`.
pub fn read_manifest(set_dir: &Path) -> Result<Manifest> {
    let path = manifest_path(set_dir);
    let corrupt = |reason: String| BackupError::ManifestCorrupt {
        path: path.clone(),
        reason,
    };

    let content = match fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(corrupt("manifest missing".into()));
        }
        Err(e) => return Err(corrupt(format!("unreadable: {}", e))),
    };

    let manifest: Manifest =
        serde_json::from_slice(&content).map_err(|e| corrupt(format!("unparseable: {}", e)))?;

    if manifest.format_version > FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported format version {}",
            manifest.format_version
        )));
    }

    Ok(manifest)
}

/// Atomically write `manifest` into `set_dir`. A manifest already sealed as
/// `verified` is never replaced.
pub fn write_manifest(set_dir: &Path, manifest: &Manifest) -> Result<()> {
    let set_id = &manifest.backup_set.id;
    let write_failed = |error: io::Error| BackupError::ManifestWriteFailed {
        set_id: set_id.clone(),
        error,
    };

    if let Ok(existing) = read_manifest(set_dir) {
        if existing.backup_set.status == BackupStatus::Verified {
            return Err(write_failed(io::Error::other(
                "backup set is verified; its manifest is immutable",
            )));
        }
    }

    let staged = stage_manifest(set_dir, manifest).map_err(write_failed)?;
    let final_path = manifest_path(set_dir);
    fs::rename(&staged, &final_path).map_err(|e| {
        let _ = fs::remove_file(&staged);
        write_failed(e)
    })?;
    sync_dir(set_dir).map_err(write_failed)?;

    debug!(
        set_id = %set_id,
        status = %manifest.backup_set.status,
        path = %final_path.display(),
        "Manifest written"
    );
    Ok(())
}

/// First half of a manifest write: the fully synced temp file, not yet
/// visible at the final path.
pub(crate) fn stage_manifest(set_dir: &Path, manifest: &Manifest) -> io::Result<PathBuf> {
    let tmp_path = set_dir.join(MANIFEST_TMP_FILENAME);
    let json = serde_json::to_vec_pretty(manifest)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(&json)?;
    file.write_all(b"\n")?;
    file.sync_all()?;

    Ok(tmp_path)
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SourceEntry, SourceKind, Tier};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn sample_manifest(status: BackupStatus) -> Manifest {
        let created = Utc.with_ymd_and_hms(2026, 10, 1, 3, 0, 0).unwrap();
        let mut set = BackupSet::new("20261001T030000.000Z".into(), Tier::Daily, created);
        set.status = status;
        set.sources.push(SourceEntry {
            name: "config".into(),
            kind: SourceKind::FilesystemPath,
            archive_filename: "config.tar.zst".into(),
            checksum: "ab".repeat(32),
            size_bytes: 512,
        });
        Manifest::new(set, Duration::from_millis(1500))
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = sample_manifest(BackupStatus::InProgress);

        write_manifest(dir.path(), &manifest)?;

        assert!(!dir.path().join(MANIFEST_TMP_FILENAME).exists());
        let loaded = read_manifest(dir.path())?;
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.duration_ms, 1500);
        assert_eq!(loaded.tool_version, env!("CARGO_PKG_VERSION"));
        Ok(())
    }

    #[test]
    fn test_serialized_layout_is_flat() -> Result<()> {
        let dir = TempDir::new()?;
        write_manifest(dir.path(), &sample_manifest(BackupStatus::Verified))?;

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(manifest_path(dir.path()))?)?;
        assert_eq!(raw["id"], "20261001T030000.000Z");
        assert_eq!(raw["tier"], "daily");
        assert_eq!(raw["status"], "verified");
        assert_eq!(raw["created_at"], "2026-10-01T03:00:00Z");
        assert_eq!(raw["sources"][0]["kind"], "filesystem_path");
        assert!(raw.get("error").is_none());
        Ok(())
    }

    #[test]
    fn test_crash_before_rename_leaves_no_manifest() -> Result<()> {
        let dir = TempDir::new()?;

        stage_manifest(dir.path(), &sample_manifest(BackupStatus::InProgress))?;

        assert!(!manifest_path(dir.path()).exists());
        let err = read_manifest(dir.path()).unwrap_err();
        assert!(matches!(err, BackupError::ManifestCorrupt { ref reason, .. } if reason == "manifest missing"));
        Ok(())
    }

    #[test]
    fn test_verified_manifest_is_immutable() -> Result<()> {
        let dir = TempDir::new()?;
        write_manifest(dir.path(), &sample_manifest(BackupStatus::Verified))?;

        let err = write_manifest(dir.path(), &sample_manifest(BackupStatus::Failed)).unwrap_err();
        assert!(matches!(err, BackupError::ManifestWriteFailed { .. }));
        assert_eq!(read_manifest(dir.path())?.backup_set.status, BackupStatus::Verified);
        Ok(())
    }

    #[test]
    fn test_in_progress_manifest_can_be_sealed() -> Result<()> {
        let dir = TempDir::new()?;
        write_manifest(dir.path(), &sample_manifest(BackupStatus::InProgress))?;
        write_manifest(dir.path(), &sample_manifest(BackupStatus::Verified))?;
        assert_eq!(read_manifest(dir.path())?.backup_set.status, BackupStatus::Verified);
        Ok(())
    }

    #[test]
    fn test_garbage_manifest_is_corrupt() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(manifest_path(dir.path()), b"{\"id\": \"trunc")?;
        assert!(matches!(
            read_manifest(dir.path()),
            Err(BackupError::ManifestCorrupt { .. })
        ));
        Ok(())
    }
}
