//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`STACK_BACKUP_<SECTION>__<KEY>`). The resulting `Config` is passed
//! explicitly to every component; nothing reads the environment afterwards.

use crate::executor::archive::archive_filename;
use crate::models::{SourceKind, Tier};
use crate::retention::RetentionPolicy;
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "STACK_BACKUP";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub archive: ArchiveConfig,
    pub retention: RetentionConfig,
    pub services: ServicesConfig,
    pub volumes: VolumesConfig,
    pub log: LogConfig,
    /// Captured in declared order; restore replays the same order
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root holding `<tier>/<backup_set_id>/`
    pub backup_dir: PathBuf,

    /// Run lock location (default: `<backup_dir>/.stack-backup.lock`)
    pub lock_file: Option<PathBuf>,

    /// Scratch space for volume exports (default: `<backup_dir>/.staging`)
    pub staging_dir: Option<PathBuf>,

    /// Free space that must remain after archiving a source
    pub reserve_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Compression level (1-22 for zstd)
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Logical identifier, also the base of the archive file name
    pub name: String,

    pub kind: SourceKind,

    /// Directory for `filesystem_path` sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Container volume name (defaults to `name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,

    /// Entries whose file name contains any of these are skipped
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    #[serde(with = "duration_str")]
    pub daily: Duration,

    #[serde(with = "duration_str")]
    pub weekly: Duration,

    #[serde(with = "duration_str")]
    pub monthly: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Compose file of the stack; service control is a no-op without it
    pub compose_file: Option<PathBuf>,

    pub project_name: Option<String>,

    /// Services to stop during restore (empty = every service in the project)
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeDriver {
    /// Export/import through a throwaway helper container
    Docker,
    /// Volumes are plain directories under `directory_root`
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumesConfig {
    pub driver: VolumeDriver,

    /// Image used by the docker driver to copy volume contents
    pub helper_image: String,

    pub directory_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

// Default values
fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/stack-backup/backups")
}

fn default_reserve_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_compression_level() -> i32 {
    3
}

const DAY: u64 = 24 * 60 * 60;

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            lock_file: None,
            staging_dir: None,
            reserve_bytes: default_reserve_bytes(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: Duration::from_secs(7 * DAY),
            weekly: Duration::from_secs(28 * DAY),
            monthly: Duration::from_secs(365 * DAY),
        }
    }
}

impl Default for VolumesConfig {
    fn default() -> Self {
        Self {
            driver: VolumeDriver::Docker,
            helper_image: "alpine:3.20".to_string(),
            directory_root: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn lock_path(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.backup_dir.join(".stack-backup.lock"))
    }

    pub fn staging_path(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.backup_dir.join(".staging"))
    }
}

impl SourceConfig {
    pub fn volume_name(&self) -> &str {
        self.volume.as_deref().unwrap_or(&self.name)
    }

    pub fn archive_filename(&self) -> String {
        archive_filename(&self.name)
    }
}

impl RetentionConfig {
    pub fn window(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Daily => self.daily,
            Tier::Weekly => self.weekly,
            Tier::Monthly => self.monthly,
        }
    }

    pub fn policy(&self, tier: Tier) -> RetentionPolicy {
        RetentionPolicy {
            tier,
            max_age: self.window(tier),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BackupError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BackupError::Config(e.to_string()))
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=22).contains(&self.archive.compression_level) {
            return Err(BackupError::Config(format!(
                "archive.compression_level must be between 1 and 22, got {}",
                self.archive.compression_level
            )));
        }

        for tier in Tier::ALL {
            if self.retention.window(tier).is_zero() {
                return Err(BackupError::Config(format!(
                    "retention.{} must be greater than zero",
                    tier
                )));
            }
        }

        if self.sources.is_empty() {
            return Err(BackupError::Config("no sources configured".into()));
        }

        let mut names = HashSet::new();
        let mut archives = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(BackupError::Config("source with empty name".into()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(BackupError::Config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
            if !archives.insert(source.archive_filename()) {
                return Err(BackupError::Config(format!(
                    "source '{}' maps to an archive name already used by another source",
                    source.name
                )));
            }
            match source.kind {
                SourceKind::FilesystemPath if source.path.is_none() => {
                    return Err(BackupError::Config(format!(
                        "filesystem source '{}' has no path",
                        source.name
                    )));
                }
                SourceKind::ContainerVolume
                    if self.volumes.driver == VolumeDriver::Directory
                        && self.volumes.directory_root.is_none() =>
                {
                    return Err(BackupError::Config(format!(
                        "volume source '{}' needs volumes.directory_root with the directory driver",
                        source.name
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Durations written the humantime way ("7d", "4w", "36h")
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
