//! On-disk layout of backup sets: `<backup_dir>/<tier>/<set_id>/`.
//!
//! Names starting with `.` (staging area, lock file, sets being pruned) are
//! never backup sets.

use crate::config::Config;
use crate::executor::manifest::{read_manifest, Manifest};
use crate::models::Tier;
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::debug;

/// Set ids are UTC capture timestamps with millisecond precision
pub const ID_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// A set directory found in a tier, with its manifest as far as it parses.
#[derive(Debug)]
pub struct StoredSet {
    pub id: String,
    pub dir: PathBuf,
    pub manifest: Result<Manifest>,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.storage.backup_dir)
    }

    pub fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.root.join(tier.as_str())
    }

    /// Claim a fresh set directory for a run starting at `now`. The id gets a
    /// `-N` suffix when another set of the tier already holds the timestamp.
    pub fn allocate(&self, tier: Tier, now: DateTime<Utc>) -> Result<(String, PathBuf)> {
        let tier_dir = self.tier_dir(tier);
        fs::create_dir_all(&tier_dir)?;

        let base = now.format(ID_FORMAT).to_string();
        let mut attempt: u32 = 0;
        loop {
            let id = if attempt == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, attempt)
            };
            let dir = tier_dir.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!(tier = %tier, set_id = %id, "Set directory allocated");
                    return Ok((id, dir));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// All sets of a tier, oldest id first. A tier never written to is empty.
    pub fn list(&self, tier: Tier) -> Result<Vec<StoredSet>> {
        let tier_dir = self.tier_dir(tier);
        let read_dir = match fs::read_dir(&tier_dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sets = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().into_owned();
            if id.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let manifest = read_manifest(&dir);
            sets.push(StoredSet { id, dir, manifest });
        }
        sets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sets)
    }

    /// Directory of set `id` in `tier`. Ids that are not plain directory
    /// names are rejected as not found.
    pub fn locate(&self, tier: Tier, id: &str) -> Result<PathBuf> {
        let not_found = || BackupError::BackupSetNotFound {
            tier,
            id: id.to_string(),
        };

        if !is_valid_id(id) {
            return Err(not_found());
        }
        let dir = self.tier_dir(tier).join(id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(not_found())
        }
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && !id.starts_with('.') && !id.contains(['/', '\\', '\0'])
}
