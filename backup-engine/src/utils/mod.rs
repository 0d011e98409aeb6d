//! Utility modules for the backup engine.

pub mod errors;

pub use errors::{BackupError, Result};

/// Hostname recorded in manifests and run locks
pub fn current_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}
