use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Retention category. Each tier is an independent namespace of backup sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier '{0}' (expected daily, weekly or monthly)")]
pub struct ParseTierError(String);

impl FromStr for Tier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Tier::Daily),
            "weekly" => Ok(Tier::Weekly),
            "monthly" => Ok(Tier::Monthly),
            _ => Err(ParseTierError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Verified,
    Failed,
    Pruned,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Verified => "verified",
            BackupStatus::Failed => "failed",
            BackupStatus::Pruned => "pruned",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    FilesystemPath,
    ContainerVolume,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::FilesystemPath => f.write_str("filesystem_path"),
            SourceKind::ContainerVolume => f.write_str("container_volume"),
        }
    }
}

/// Record of one archived source. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub kind: SourceKind,
    /// Relative to the backup set directory
    pub archive_filename: String,
    /// SHA-256 of the archive file, lowercase hex
    pub checksum: String,
    pub size_bytes: u64,
}

/// One backup run of every configured source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSet {
    pub id: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sources: Vec<SourceEntry>,
}

impl BackupSet {
    pub fn new(id: String, tier: Tier, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            tier,
            created_at,
            status: BackupStatus::InProgress,
            error: None,
            sources: Vec::new(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.sources.iter().map(|s| s.size_bytes).sum()
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = BackupStatus::Failed;
        if self.error.is_none() {
            self.error = Some(reason.into());
        }
    }
}
