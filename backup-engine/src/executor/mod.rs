//! Backup executor - Orchestrates one full backup run.
//!
//! Sources are archived sequentially in declared order into a fresh set
//! directory. The manifest is written as `in_progress`, the set is verified,
//! and the manifest is then sealed with the final status. Retention for the
//! tier runs only after a verified run.

pub mod archive;
pub mod manifest;
pub mod verify;

use crate::collab::VolumeTransfer;
use crate::config::Config;
use crate::daemon::RunLock;
use crate::models::{BackupSet, BackupStatus, Tier};
use crate::retention::{PruneReport, RetentionManager};
use crate::store::BackupStore;
use crate::utils::{BackupError, Result};
use archive::ArchiveBuilder;
use chrono::{DateTime, Utc};
use manifest::{write_manifest, Manifest};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};
use verify::{verify, VerificationResult};

/// Outcome of a run that got as far as creating its set directory.
#[derive(Debug)]
pub struct BackupRun {
    pub backup_set: BackupSet,
    pub set_dir: PathBuf,
    /// Capture or manifest failure that stopped the run
    pub failure: Option<BackupError>,
    pub verification: Option<VerificationResult>,
    /// Present only when the set was verified and retention ran
    pub retention: Option<PruneReport>,
}

impl BackupRun {
    pub fn succeeded(&self) -> bool {
        self.backup_set.status == BackupStatus::Verified
    }

    /// The error that made the run fail, if any.
    pub fn error(&self) -> Option<&BackupError> {
        self.failure
            .as_ref()
            .or_else(|| self.verification.as_ref().and_then(|v| v.first_error()))
    }
}

pub struct BackupOrchestrator<'a> {
    config: &'a Config,
    volumes: &'a dyn VolumeTransfer,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(config: &'a Config, volumes: &'a dyn VolumeTransfer) -> Self {
        Self { config, volumes }
    }

    pub fn run(&self, tier: Tier) -> Result<BackupRun> {
        self.run_at(tier, Utc::now())
    }

    /// Run a backup of `tier` stamped with `now`. Errors are returned only
    /// when no set directory was created (lock held, storage unusable);
    /// everything after that is reported in the `BackupRun`.
    pub fn run_at(&self, tier: Tier, now: DateTime<Utc>) -> Result<BackupRun> {
        if self.config.sources.is_empty() {
            return Err(BackupError::Config("no sources configured".into()));
        }

        let lock_path = self.config.storage.lock_path();
        let _lock = RunLock::acquire(&lock_path, &format!("backup {}", tier))?;
        let started = Instant::now();

        let store = BackupStore::from_config(self.config);
        let (set_id, set_dir) = store.allocate(tier, now)?;
        let mut backup_set = BackupSet::new(set_id, tier, now);

        info!(
            tier = %tier,
            set_id = %backup_set.id,
            sources = self.config.sources.len(),
            "Starting backup"
        );

        let builder = ArchiveBuilder::new(self.config, self.volumes);
        for source in &self.config.sources {
            info!(
                tier = %tier,
                set_id = %backup_set.id,
                source = %source.name,
                kind = %source.kind,
                "Archiving source"
            );
            match builder.build(source, &set_dir) {
                Ok(entry) => backup_set.sources.push(entry),
                Err(e) => {
                    error!(
                        tier = %tier,
                        set_id = %backup_set.id,
                        source = %source.name,
                        error = %e,
                        "Source capture failed, aborting run"
                    );
                    return Ok(abort_run(backup_set, set_dir, e, started));
                }
            }
        }

        let manifest = Manifest::new(backup_set.clone(), started.elapsed());
        if let Err(e) = write_manifest(&set_dir, &manifest) {
            error!(
                tier = %tier,
                set_id = %backup_set.id,
                error = %e,
                "Manifest write failed, aborting run"
            );
            backup_set.mark_failed(e.to_string());
            return Ok(BackupRun {
                backup_set,
                set_dir,
                failure: Some(e),
                verification: None,
                retention: None,
            });
        }

        let verification = verify(&set_dir);
        match verification.first_error() {
            None => backup_set.status = BackupStatus::Verified,
            Some(e) => backup_set.mark_failed(e.to_string()),
        }

        let mut failure = None;
        let manifest = Manifest::new(backup_set.clone(), started.elapsed());
        if let Err(e) = write_manifest(&set_dir, &manifest) {
            // The on-disk manifest stays in_progress, so the set is never restored or pruned
            error!(
                tier = %tier,
                set_id = %backup_set.id,
                error = %e,
                "Failed to seal manifest"
            );
            backup_set.mark_failed(e.to_string());
            failure = Some(e);
        }

        if backup_set.status != BackupStatus::Verified {
            warn!(
                tier = %tier,
                set_id = %backup_set.id,
                error = backup_set.error.as_deref().unwrap_or("-"),
                "Backup failed"
            );
            return Ok(BackupRun {
                backup_set,
                set_dir,
                failure,
                verification: Some(verification),
                retention: None,
            });
        }

        info!(
            tier = %tier,
            set_id = %backup_set.id,
            sources = backup_set.sources.len(),
            total_bytes = backup_set.total_bytes(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Backup verified"
        );

        let policy = self.config.retention.policy(tier);
        let retention = match RetentionManager::new(store).prune_at(&policy, now) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(tier = %tier, error = %e, "Retention pass failed");
                None
            }
        };

        Ok(BackupRun {
            backup_set,
            set_dir,
            failure,
            verification: Some(verification),
            retention,
        })
    }
}

/// Seal a run whose capture failed. A manifest that cannot be written is
/// folded into the set's error so both problems reach the operator.
fn abort_run(
    mut backup_set: BackupSet,
    set_dir: PathBuf,
    error: BackupError,
    started: Instant,
) -> BackupRun {
    backup_set.mark_failed(error.to_string());
    if let Err(manifest_err) = seal(&set_dir, &backup_set, started) {
        backup_set.error = Some(format!("{}; manifest not written: {}", error, manifest_err));
    }
    BackupRun {
        backup_set,
        set_dir,
        failure: Some(error),
        verification: None,
        retention: None,
    }
}

/// Record a failed run's manifest. Without it the set directory holds
/// archives that retention skips as unreadable, so the error is handed back.
fn seal(set_dir: &Path, backup_set: &BackupSet, started: Instant) -> Result<()> {
    let manifest = Manifest::new(backup_set.clone(), started.elapsed());
    write_manifest(set_dir, &manifest).map_err(|e| {
        error!(
            set_id = %backup_set.id,
            error = %e,
            "Failed to record failed backup set"
        );
        e
    })
}
