//! Restore Engine - puts a verified backup set back in place.
//!
//! Nothing live is touched until the set has passed verification and every
//! recorded source has been matched to its configured target. After services
//! are stopped there is no rollback: a failed extraction leaves services
//! stopped and names the source that failed.

use crate::collab::{clear_directory, ServiceControl, VolumeTransfer};
use crate::config::{Config, SourceConfig};
use crate::daemon::RunLock;
use crate::executor::archive::unpack_archive;
use crate::executor::verify::verify;
use crate::models::{BackupStatus, SourceEntry, SourceKind, Tier};
use crate::store::BackupStore;
use crate::utils::{BackupError, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Selected,
    Verified,
    ServicesStopped,
    SourcesExtracted,
    ServicesRestarted,
    Complete,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStage::Selected => "selected",
            RestoreStage::Verified => "verified",
            RestoreStage::ServicesStopped => "services_stopped",
            RestoreStage::SourcesExtracted => "sources_extracted",
            RestoreStage::ServicesRestarted => "services_restarted",
            RestoreStage::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub set_id: String,
    pub tier: Tier,
    /// Restored source names, in manifest order
    pub sources: Vec<String>,
    pub stage: RestoreStage,
    pub duration: Duration,
}

/// Where one recorded source goes back to.
enum Target<'c> {
    Directory(&'c Path),
    Volume(&'c str),
}

pub struct RestoreEngine<'a> {
    config: &'a Config,
    services: &'a dyn ServiceControl,
    volumes: &'a dyn VolumeTransfer,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(
        config: &'a Config,
        services: &'a dyn ServiceControl,
        volumes: &'a dyn VolumeTransfer,
    ) -> Self {
        Self {
            config,
            services,
            volumes,
        }
    }

    pub fn restore(&self, set_id: &str, tier: Tier) -> Result<RestoreReport> {
        let _lock = RunLock::acquire(
            &self.config.storage.lock_path(),
            &format!("restore {}/{}", tier, set_id),
        )?;
        let started = Instant::now();
        let aborted = |reason: String| BackupError::RestoreAborted {
            set_id: set_id.to_string(),
            reason,
        };

        let set_dir = BackupStore::from_config(self.config).locate(tier, set_id)?;
        enter(set_id, RestoreStage::Selected);

        let verification = verify(&set_dir);
        if let Some(e) = verification.first_error() {
            return Err(aborted(format!("integrity failure: {}", e)));
        }
        let manifest = match verification.manifest {
            Some(manifest) => manifest,
            None => return Err(aborted("integrity failure: manifest unavailable".into())),
        };
        if manifest.backup_set.status != BackupStatus::Verified {
            return Err(aborted(format!(
                "integrity failure: backup set status is {}",
                manifest.backup_set.status
            )));
        }

        let mut plan = Vec::with_capacity(manifest.backup_set.sources.len());
        for entry in &manifest.backup_set.sources {
            let target = self.resolve_target(entry).map_err(aborted)?;
            plan.push((entry, target));
        }
        enter(set_id, RestoreStage::Verified);

        self.services
            .stop_services()
            .map_err(|e| aborted(format!("service stop failed: {e:#}")))?;
        enter(set_id, RestoreStage::ServicesStopped);

        let mut restored = Vec::with_capacity(plan.len());
        for (entry, target) in &plan {
            info!(set_id, source = %entry.name, kind = %entry.kind, "Restoring source");
            if let Err(reason) = self.extract(&set_dir, entry, target) {
                error!(
                    set_id,
                    source = %entry.name,
                    reason = %reason,
                    "Restore incomplete, services left stopped"
                );
                return Err(BackupError::RestoreIncomplete {
                    set_id: set_id.to_string(),
                    source_name: entry.name.clone(),
                    reason,
                });
            }
            restored.push(entry.name.clone());
        }
        enter(set_id, RestoreStage::SourcesExtracted);

        self.services
            .start_services()
            .map_err(|e| BackupError::ServicesNotRestarted {
                set_id: set_id.to_string(),
                reason: format!("{e:#}"),
            })?;
        enter(set_id, RestoreStage::ServicesRestarted);

        let duration = started.elapsed();
        info!(
            set_id,
            tier = %tier,
            sources = restored.len(),
            duration_ms = duration.as_millis() as u64,
            "Restore complete"
        );

        Ok(RestoreReport {
            set_id: set_id.to_string(),
            tier,
            sources: restored,
            stage: RestoreStage::Complete,
            duration,
        })
    }

    fn resolve_target(&self, entry: &SourceEntry) -> std::result::Result<Target<'a>, String> {
        let source: &'a SourceConfig = self
            .config
            .source(&entry.name)
            .ok_or_else(|| format!("source {} is not configured", entry.name))?;

        if source.kind != entry.kind {
            return Err(format!(
                "source {} is configured as {} but was backed up as {}",
                entry.name, source.kind, entry.kind
            ));
        }

        match entry.kind {
            SourceKind::FilesystemPath => source
                .path
                .as_deref()
                .map(Target::Directory)
                .ok_or_else(|| format!("source {} has no path configured", entry.name)),
            SourceKind::ContainerVolume => Ok(Target::Volume(source.volume_name())),
        }
    }

    fn extract(
        &self,
        set_dir: &Path,
        entry: &SourceEntry,
        target: &Target<'_>,
    ) -> std::result::Result<(), String> {
        let archive = set_dir.join(&entry.archive_filename);
        match target {
            Target::Directory(path) => {
                clear_directory(path)
                    .map_err(|e| format!("cannot clear {}: {}", path.display(), e))?;
                unpack_archive(&archive, path)
                    .map_err(|e| format!("extraction into {} failed: {}", path.display(), e))
            }
            Target::Volume(volume) => {
                let staging = self.staging_dir(&entry.name)?;
                unpack_archive(&archive, staging.path())
                    .map_err(|e| format!("extraction into staging failed: {}", e))?;
                self.volumes
                    .import_volume(volume, staging.path())
                    .map_err(|e| format!("volume import failed: {e:#}"))
            }
        }
    }

    fn staging_dir(&self, source_name: &str) -> std::result::Result<tempfile::TempDir, String> {
        let root: PathBuf = self.config.storage.staging_path();
        fs::create_dir_all(&root)
            .and_then(|()| {
                tempfile::Builder::new()
                    .prefix(&format!("restore-{}-", source_name))
                    .tempdir_in(&root)
            })
            .map_err(|e| format!("cannot create staging directory: {}", e))
    }
}

fn enter(set_id: &str, stage: RestoreStage) {
    info!(set_id, stage = %stage, "Restore stage reached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::BackupOrchestrator;
    use crate::test_support::{
        read_tree, test_config, test_volumes, volume_source, write_tree, ReadOnlyVolumes,
        RecordingServices,
    };
    use tempfile::TempDir;

    /// Seed live data, back it up, then scribble over the live copy.
    fn backed_up(root: &Path, config: &Config) -> anyhow::Result<String> {
        write_tree(
            &root.join("live/config"),
            &[("nginx.conf", "server {}"), ("app.env", "DEBUG=0"), ("tls/site.pem", "PEM")],
        )?;
        write_tree(&root.join("live/uploads"), &[("avatar.png", "PNG")])?;
        write_tree(&root.join("volumes/redis-data"), &[("dump.rdb", "REDIS0011")])?;

        let volumes = test_volumes(root);
        let run = BackupOrchestrator::new(config, &volumes).run(Tier::Daily)?;
        assert!(run.succeeded());
        Ok(run.backup_set.id)
    }

    fn scribble(root: &Path) -> std::io::Result<()> {
        fs::write(root.join("live/config/nginx.conf"), "broken")?;
        fs::remove_file(root.join("live/config/app.env"))?;
        fs::write(root.join("live/uploads/stray.tmp"), "junk")?;
        fs::write(root.join("volumes/redis-data/dump.rdb"), "EMPTY")
    }

    fn config_with_volume(root: &Path) -> Config {
        let mut config = test_config(root);
        config.sources.push(volume_source("redis-data"));
        config
    }

    #[test]
    fn test_restore_puts_everything_back() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let config = config_with_volume(root.path());
        let id = backed_up(root.path(), &config)?;
        let original_config = read_tree(&root.path().join("live/config"))?;
        let original_uploads = read_tree(&root.path().join("live/uploads"))?;
        scribble(root.path())?;

        let services = RecordingServices::default();
        let volumes = test_volumes(root.path());
        let report = RestoreEngine::new(&config, &services, &volumes).restore(&id, Tier::Daily)?;

        assert_eq!(report.stage, RestoreStage::Complete);
        assert_eq!(report.sources, vec!["config", "uploads", "redis-data"]);
        assert_eq!(services.calls(), vec!["stop", "start"]);
        assert_eq!(read_tree(&root.path().join("live/config"))?, original_config);
        assert_eq!(read_tree(&root.path().join("live/uploads"))?, original_uploads);
        assert_eq!(fs::read(volumes.volume_path("redis-data").join("dump.rdb"))?, b"REDIS0011");
        assert!(!config.storage.lock_path().exists());
        Ok(())
    }

    #[test]
    fn test_corrupted_set_aborts_before_touching_anything() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let config = test_config(root.path());
        let id = backed_up(root.path(), &config)?;
        scribble(root.path())?;
        let before = read_tree(&root.path().join("live"))?;

        let archive = root.path().join("backups/daily").join(&id).join("config.tar.zst");
        let mut bytes = fs::read(&archive)?;
        bytes[0] ^= 0x01;
        fs::write(&archive, &bytes)?;

        let services = RecordingServices::default();
        let volumes = test_volumes(root.path());
        let err = RestoreEngine::new(&config, &services, &volumes)
            .restore(&id, Tier::Daily)
            .unwrap_err();

        assert!(matches!(err, BackupError::RestoreAborted { ref reason, .. } if reason.starts_with("integrity failure")));
        assert!(services.calls().is_empty());
        assert_eq!(read_tree(&root.path().join("live"))?, before);
        Ok(())
    }

    #[test]
    fn test_failed_service_stop_aborts() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let config = test_config(root.path());
        let id = backed_up(root.path(), &config)?;
        scribble(root.path())?;
        let before = read_tree(&root.path().join("live"))?;

        let services = RecordingServices {
            fail_stop: true,
            ..Default::default()
        };
        let volumes = test_volumes(root.path());
        let err = RestoreEngine::new(&config, &services, &volumes)
            .restore(&id, Tier::Daily)
            .unwrap_err();

        assert!(matches!(err, BackupError::RestoreAborted { ref reason, .. } if reason.starts_with("service stop failed")));
        assert_eq!(services.calls(), vec!["stop"]);
        assert_eq!(read_tree(&root.path().join("live"))?, before);
        Ok(())
    }

    #[test]
    fn test_unknown_set_is_not_found() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let config = test_config(root.path());
        let services = RecordingServices::default();
        let volumes = test_volumes(root.path());

        let err = RestoreEngine::new(&config, &services, &volumes)
            .restore("20200101T000000.000Z", Tier::Monthly)
            .unwrap_err();
        assert!(matches!(err, BackupError::BackupSetNotFound { tier: Tier::Monthly, .. }));
        Ok(())
    }

    #[test]
    fn test_failed_set_is_refused() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let config = test_config(root.path());
        write_tree(&root.path().join("live/config"), &[("nginx.conf", "server {}")])?;
        let volumes = test_volumes(root.path());
        let run = BackupOrchestrator::new(&config, &volumes).run(Tier::Daily)?;
        assert!(!run.succeeded());

        let services = RecordingServices::default();
        let err = RestoreEngine::new(&config, &services, &volumes)
            .restore(&run.backup_set.id, Tier::Daily)
            .unwrap_err();
        assert!(matches!(err, BackupError::RestoreAborted { .. }));
        assert!(services.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_unconfigured_source_aborts() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let config = test_config(root.path());
        let id = backed_up(root.path(), &config)?;

        let mut shrunk = config.clone();
        shrunk.sources.truncate(1);
        let services = RecordingServices::default();
        let volumes = test_volumes(root.path());
        let err = RestoreEngine::new(&shrunk, &services, &volumes)
            .restore(&id, Tier::Daily)
            .unwrap_err();

        assert!(matches!(err, BackupError::RestoreAborted { ref reason, .. } if reason.contains("uploads")));
        assert!(services.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_import_leaves_services_stopped() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let config = config_with_volume(root.path());
        let id = backed_up(root.path(), &config)?;
        scribble(root.path())?;

        let services = RecordingServices::default();
        let volumes = ReadOnlyVolumes(test_volumes(root.path()));
        let err = RestoreEngine::new(&config, &services, &volumes)
            .restore(&id, Tier::Daily)
            .unwrap_err();

        assert!(matches!(
            err,
            BackupError::RestoreIncomplete { ref source_name, .. } if source_name == "redis-data"
        ));
        assert_eq!(services.calls(), vec!["stop"]);
        // Sources before the failing one were already restored
        assert_eq!(fs::read(root.path().join("live/config/nginx.conf"))?, b"server {}");
        assert!(!config.storage.lock_path().exists());
        Ok(())
    }

    #[test]
    fn test_failed_restart_is_reported_after_data_is_back() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let config = test_config(root.path());
        let id = backed_up(root.path(), &config)?;
        scribble(root.path())?;

        let services = RecordingServices {
            fail_start: true,
            ..Default::default()
        };
        let volumes = test_volumes(root.path());
        let err = RestoreEngine::new(&config, &services, &volumes)
            .restore(&id, Tier::Daily)
            .unwrap_err();

        assert!(matches!(err, BackupError::ServicesNotRestarted { .. }));
        assert_eq!(services.calls(), vec!["stop", "start"]);
        assert!(!root.path().join("live/uploads/stray.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_restore_is_excluded_by_run_lock() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let config = test_config(root.path());
        let id = backed_up(root.path(), &config)?;

        let _held = RunLock::acquire(&config.storage.lock_path(), "backup weekly")?;
        let services = RecordingServices::default();
        let volumes = test_volumes(root.path());
        let err = RestoreEngine::new(&config, &services, &volumes)
            .restore(&id, Tier::Daily)
            .unwrap_err();
        assert!(matches!(err, BackupError::AlreadyRunning { .. }));
        assert!(services.calls().is_empty());
        Ok(())
    }
}
