//! Retention Manager - deletes backup sets that have outlived their tier's
//! window.
//!
//! A set is removed by renaming it to a hidden `.pruning-<id>` directory and
//! then deleting that. A set is therefore either fully present or invisible;
//! hidden leftovers from an interrupted removal are swept on the next pass.

use crate::config::Config;
use crate::models::{BackupStatus, Tier};
use crate::store::BackupStore;
use crate::utils::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const PRUNING_PREFIX: &str = ".pruning-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub tier: Tier,
    pub max_age: Duration,
}

impl RetentionPolicy {
    /// Strictly older than the window. Sets dated in the future never expire.
    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - created_at).to_std() {
            Ok(age) => age > self.max_age,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneIssue {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    pub tier: Tier,
    pub pruned: Vec<String>,
    pub retained: usize,
    /// Sets never considered for deletion (in progress, unreadable manifest)
    pub skipped: Vec<PruneIssue>,
    /// Expired sets that could not be removed
    pub failed: Vec<PruneIssue>,
}

impl PruneReport {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            pruned: Vec::new(),
            retained: 0,
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }
}

pub struct RetentionManager {
    store: BackupStore,
}

impl RetentionManager {
    pub fn new(store: BackupStore) -> Self {
        Self { store }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(BackupStore::from_config(config))
    }

    pub fn prune(&self, policy: &RetentionPolicy) -> Result<PruneReport> {
        self.prune_at(policy, Utc::now())
    }

    /// Prune `policy.tier` as of `now`. Only listing the tier can fail the
    /// pass; every per-set problem lands in the report.
    pub fn prune_at(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<PruneReport> {
        let tier = policy.tier;
        let tier_dir = self.store.tier_dir(tier);
        let mut report = PruneReport::new(tier);

        sweep_leftovers(&tier_dir, &mut report);

        for set in self.store.list(tier)? {
            let manifest = match set.manifest {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(
                        tier = %tier,
                        set_id = %set.id,
                        error = %e,
                        "Skipping set with unreadable manifest"
                    );
                    report.skipped.push(PruneIssue {
                        id: set.id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let backup_set = manifest.backup_set;
            if backup_set.status == BackupStatus::InProgress {
                debug!(tier = %tier, set_id = %set.id, "Skipping in-progress set");
                report.skipped.push(PruneIssue {
                    id: set.id,
                    reason: "backup still in progress".into(),
                });
                continue;
            }

            if !policy.is_expired(backup_set.created_at, now) {
                report.retained += 1;
                continue;
            }

            match remove_set(&tier_dir, &set.id) {
                Ok(()) => {
                    info!(
                        tier = %tier,
                        set_id = %set.id,
                        created_at = %backup_set.created_at.to_rfc3339(),
                        status = %backup_set.status,
                        "Backup set pruned"
                    );
                    report.pruned.push(set.id);
                }
                Err(reason) => {
                    warn!(
                        tier = %tier,
                        set_id = %set.id,
                        reason = %reason,
                        "Failed to prune backup set"
                    );
                    report.failed.push(PruneIssue { id: set.id, reason });
                }
            }
        }

        info!(
            tier = %tier,
            pruned = report.pruned.len(),
            retained = report.retained,
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Retention pass finished"
        );
        Ok(report)
    }
}

/// Hide the set, then delete it. Once the rename succeeds the set is gone as
/// far as every reader is concerned, even if the delete fails.
fn remove_set(tier_dir: &Path, id: &str) -> std::result::Result<(), String> {
    let visible = tier_dir.join(id);
    let hidden = tier_dir.join(format!("{}{}", PRUNING_PREFIX, id));

    fs::rename(&visible, &hidden).map_err(|e| format!("rename failed, set untouched: {}", e))?;
    delete_hidden(&hidden)
}

/// The next pass sweeps whatever survives a failed delete.
fn delete_hidden(hidden: &Path) -> std::result::Result<(), String> {
    fs::remove_dir_all(hidden).map_err(|e| {
        let name = hidden.file_name().unwrap_or_default().to_string_lossy();
        format!("hidden as {}, removal failed: {}", name, e)
    })
}

fn sweep_leftovers(tier_dir: &Path, report: &mut PruneReport) {
    let Ok(read_dir) = fs::read_dir(tier_dir) else {
        return;
    };

    for entry in read_dir.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(id) = name.strip_prefix(PRUNING_PREFIX) else {
            continue;
        };
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => debug!(set_id = %id, "Removed leftover from interrupted prune"),
            Err(e) => report.failed.push(PruneIssue {
                id: id.to_string(),
                reason: format!("leftover {} not removed: {}", name, e),
            }),
        }
    }
}
