//! Error taxonomy for the backup engine.
//!
//! Every variant names the source or backup set it concerns so operators know
//! exactly what to recover by hand.

use crate::models::Tier;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Source unavailable: {name}: {reason}")]
    SourceUnavailable { name: String, reason: String },

    #[error("Insufficient space for source {name}: {required} bytes required, {available} available")]
    InsufficientSpace {
        name: String,
        required: u64,
        available: u64,
    },

    #[error("Archive write failed for source {name}: {error}")]
    ArchiveWriteFailed {
        name: String,
        #[source]
        error: std::io::Error,
    },

    #[error("Manifest write failed for backup set {set_id}: {error}")]
    ManifestWriteFailed {
        set_id: String,
        #[source]
        error: std::io::Error,
    },

    #[error("Manifest corrupt at {}: {reason}", path.display())]
    ManifestCorrupt { path: PathBuf, reason: String },

    #[error("Checksum mismatch for source {source_name}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        source_name: String,
        expected: String,
        actual: String,
    },

    #[error("Archive corrupt for source {source_name}: {reason}")]
    ArchiveCorrupt { source_name: String, reason: String },

    #[error("Backup set not found: {tier}/{id}")]
    BackupSetNotFound { tier: Tier, id: String },

    #[error("Restore of {set_id} aborted: {reason}")]
    RestoreAborted { set_id: String, reason: String },

    #[error("Restore of {set_id} incomplete at source {source_name}: {reason} (services left stopped)")]
    RestoreIncomplete {
        set_id: String,
        source_name: String,
        reason: String,
    },

    #[error("Restore of {set_id} finished but services failed to restart: {reason}")]
    ServicesNotRestarted { set_id: String, reason: String },

    #[error("Another backup or restore is already running ({holder})")]
    AlreadyRunning { holder: String, stale: bool },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Name of the source this error is attributed to, if any.
    pub fn source_name(&self) -> Option<&str> {
        match self {
            BackupError::SourceUnavailable { name, .. }
            | BackupError::InsufficientSpace { name, .. }
            | BackupError::ArchiveWriteFailed { name, .. } => Some(name),
            BackupError::ChecksumMismatch { source_name, .. }
            | BackupError::ArchiveCorrupt { source_name, .. }
            | BackupError::RestoreIncomplete { source_name, .. } => Some(source_name),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
