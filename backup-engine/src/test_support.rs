//! Fixtures shared by the unit tests.

use crate::collab::{DirectoryVolumes, ServiceControl, VolumeTransfer};
use crate::config::{Config, SourceConfig, VolumeDriver};
use crate::models::SourceKind;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Create `files` (relative path, content) under `root`. A trailing `/`
/// creates an empty directory.
pub(crate) fn write_tree(root: &Path, files: &[(&str, &str)]) -> io::Result<()> {
    fs::create_dir_all(root)?;
    for (rel, content) in files {
        let path = root.join(rel);
        if rel.ends_with('/') {
            fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }
    Ok(())
}

/// Snapshot of a tree: files map to their bytes, directories to `None`.
pub(crate) fn read_tree(root: &Path) -> io::Result<BTreeMap<PathBuf, Option<Vec<u8>>>> {
    let mut tree = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path()).to_path_buf();
        if entry.file_type().is_dir() {
            tree.insert(rel, None);
        } else {
            tree.insert(rel, Some(fs::read(entry.path())?));
        }
    }
    Ok(tree)
}

pub(crate) fn filesystem_source(name: &str, path: PathBuf) -> SourceConfig {
    SourceConfig {
        name: name.to_string(),
        kind: SourceKind::FilesystemPath,
        path: Some(path),
        volume: None,
        exclude: Vec::new(),
    }
}

pub(crate) fn volume_source(name: &str) -> SourceConfig {
    SourceConfig {
        name: name.to_string(),
        kind: SourceKind::ContainerVolume,
        path: None,
        volume: None,
        exclude: Vec::new(),
    }
}

/// Config rooted in `root`: backups under `root/backups`, live data under
/// `root/live/<name>`, directory volumes under `root/volumes`.
pub(crate) fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.backup_dir = root.join("backups");
    config.storage.reserve_bytes = 0;
    config.volumes.driver = VolumeDriver::Directory;
    config.volumes.directory_root = Some(root.join("volumes"));
    config.sources = vec![
        filesystem_source("config", root.join("live/config")),
        filesystem_source("uploads", root.join("live/uploads")),
    ];
    config
}

pub(crate) fn test_volumes(root: &Path) -> DirectoryVolumes {
    DirectoryVolumes::new(root.join("volumes"))
}

/// Records every call; can be told to fail either direction.
#[derive(Default)]
pub(crate) struct RecordingServices {
    pub calls: Mutex<Vec<&'static str>>,
    pub fail_stop: bool,
    pub fail_start: bool,
}

impl RecordingServices {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ServiceControl for RecordingServices {
    fn stop_services(&self) -> anyhow::Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push("stop");
        }
        if self.fail_stop {
            anyhow::bail!("compose stop exited with status 1");
        }
        Ok(())
    }

    fn start_services(&self) -> anyhow::Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push("start");
        }
        if self.fail_start {
            anyhow::bail!("compose start exited with status 1");
        }
        Ok(())
    }
}

/// Exports like `DirectoryVolumes` but refuses every import.
pub(crate) struct ReadOnlyVolumes(pub DirectoryVolumes);

impl VolumeTransfer for ReadOnlyVolumes {
    fn export_volume(&self, volume: &str, staging_dir: &Path) -> anyhow::Result<()> {
        self.0.export_volume(volume, staging_dir)
    }

    fn import_volume(&self, volume: &str, _staging_dir: &Path) -> anyhow::Result<()> {
        anyhow::bail!("volume {} is read-only", volume)
    }
}
