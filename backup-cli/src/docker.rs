//! Docker-backed collaborators: Compose service control and named-volume
//! transfer through a throwaway helper container.

use anyhow::Context;
use backup_engine::config::ServicesConfig;
use backup_engine::{ServiceControl, VolumeTransfer};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Stops and starts the stack with `docker compose`.
#[derive(Debug, Clone)]
pub struct ComposeServices {
    compose_file: PathBuf,
    project_name: Option<String>,
    services: Vec<String>,
}

impl ComposeServices {
    /// `None` when no compose file is configured.
    pub fn from_config(config: &ServicesConfig) -> Option<Self> {
        config.compose_file.as_ref().map(|file| Self {
            compose_file: file.clone(),
            project_name: config.project_name.clone(),
            services: config.services.clone(),
        })
    }

    fn command(&self, action: &str) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("compose").arg("-f").arg(&self.compose_file);
        if let Some(project) = &self.project_name {
            cmd.arg("-p").arg(project);
        }
        cmd.arg(action).args(&self.services);
        cmd
    }
}

impl ServiceControl for ComposeServices {
    fn stop_services(&self) -> anyhow::Result<()> {
        info!(compose_file = %self.compose_file.display(), "Stopping services");
        run(self.command("stop"))
    }

    fn start_services(&self) -> anyhow::Result<()> {
        info!(compose_file = %self.compose_file.display(), "Starting services");
        run(self.command("start"))
    }
}

/// Copies named volumes in and out with `docker run --rm`.
#[derive(Debug, Clone)]
pub struct DockerVolumes {
    helper_image: String,
}

impl DockerVolumes {
    pub fn new(helper_image: impl Into<String>) -> Self {
        Self {
            helper_image: helper_image.into(),
        }
    }

    fn inspect_command(&self, volume: &str) -> Command {
        let mut cmd = Command::new("docker");
        cmd.args(["volume", "inspect", volume]);
        cmd
    }

    fn export_command(&self, volume: &str, staging_dir: &Path) -> Command {
        self.helper_command(
            format!("{}:/volume:ro", volume),
            format!("{}:/staging", staging_dir.display()),
            "cp -a /volume/. /staging/",
        )
    }

    fn import_command(&self, volume: &str, staging_dir: &Path) -> Command {
        self.helper_command(
            format!("{}:/volume", volume),
            format!("{}:/staging:ro", staging_dir.display()),
            "find /volume -mindepth 1 -delete && cp -a /staging/. /volume/",
        )
    }

    fn helper_command(&self, volume_mount: String, staging_mount: String, script: &str) -> Command {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "-v"])
            .arg(volume_mount)
            .arg("-v")
            .arg(staging_mount)
            .arg(&self.helper_image)
            .args(["sh", "-c", script]);
        cmd
    }
}

impl VolumeTransfer for DockerVolumes {
    fn export_volume(&self, volume: &str, staging_dir: &Path) -> anyhow::Result<()> {
        // `docker run -v` would silently create a missing volume
        run(self.inspect_command(volume)).with_context(|| format!("volume {} not found", volume))?;
        run(self.export_command(volume, staging_dir))
            .with_context(|| format!("exporting volume {}", volume))
    }

    fn import_volume(&self, volume: &str, staging_dir: &Path) -> anyhow::Result<()> {
        run(self.import_command(volume, staging_dir))
            .with_context(|| format!("importing volume {}", volume))
    }
}

fn run(mut cmd: Command) -> anyhow::Result<()> {
    debug!(command = ?cmd, "Running");
    let output = cmd
        .output()
        .with_context(|| format!("failed to run {:?}", cmd.get_program()))?;

    if !output.status.success() {
        anyhow::bail!(
            "{:?} exited with {}: {}",
            cmd.get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
