//! Narrow interfaces to the things the engine does not own: the running
//! services and the container volumes.
//!
//! The engine never talks to a container runtime itself. Runtime-specific
//! implementations live at the binary boundary; `DirectoryVolumes` covers
//! volumes that are plain host directories.

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Stops and starts the services that write to the backed-up sources.
pub trait ServiceControl {
    fn stop_services(&self) -> anyhow::Result<()>;
    fn start_services(&self) -> anyhow::Result<()>;
}

/// Moves a named volume's contents to and from a staging directory.
pub trait VolumeTransfer {
    /// Copy the full contents of `volume` into the (empty) `staging_dir`.
    fn export_volume(&self, volume: &str, staging_dir: &Path) -> anyhow::Result<()>;

    /// Replace the contents of `volume` with the contents of `staging_dir`.
    fn import_volume(&self, volume: &str, staging_dir: &Path) -> anyhow::Result<()>;
}

/// Service control for stacks with nothing to stop.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoServices;

impl ServiceControl for NoServices {
    fn stop_services(&self) -> anyhow::Result<()> {
        info!("No service control configured, nothing to stop");
        Ok(())
    }

    fn start_services(&self) -> anyhow::Result<()> {
        info!("No service control configured, nothing to start");
        Ok(())
    }
}

/// Volumes stored as `<root>/<volume>` directories.
#[derive(Debug, Clone)]
pub struct DirectoryVolumes {
    root: PathBuf,
}

impl DirectoryVolumes {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn volume_path(&self, volume: &str) -> PathBuf {
        self.root.join(volume)
    }
}

impl VolumeTransfer for DirectoryVolumes {
    fn export_volume(&self, volume: &str, staging_dir: &Path) -> anyhow::Result<()> {
        let src = self.volume_path(volume);
        if !src.is_dir() {
            anyhow::bail!("volume directory {} does not exist", src.display());
        }
        copy_tree(&src, staging_dir)
            .with_context(|| format!("copying volume {} to {}", volume, staging_dir.display()))
    }

    fn import_volume(&self, volume: &str, staging_dir: &Path) -> anyhow::Result<()> {
        let dest = self.volume_path(volume);
        clear_directory(&dest)
            .with_context(|| format!("clearing volume directory {}", dest.display()))?;
        copy_tree(staging_dir, &dest)
            .with_context(|| format!("copying {} into volume {}", staging_dir.display(), volume))
    }
}

/// Remove everything inside `dir`, keeping (or creating) the directory itself
/// so mount points survive.
pub fn clear_directory(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        return fs::create_dir_all(dir);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
