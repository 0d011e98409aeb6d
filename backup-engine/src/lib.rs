//! Backup Engine Library
//!
//! Backup, retention and restore of a containerized stack's state: config
//! and content directories plus named container volumes, captured as
//! verified backup sets in daily, weekly and monthly tiers.

pub mod collab;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod models;
pub mod restore;
pub mod retention;
pub mod store;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use collab::{DirectoryVolumes, NoServices, ServiceControl, VolumeTransfer};
pub use config::Config;
pub use executor::verify::{verify, VerificationResult};
pub use executor::{BackupOrchestrator, BackupRun};
pub use models::{BackupSet, BackupStatus, SourceEntry, SourceKind, Tier};
pub use restore::{RestoreEngine, RestoreReport};
pub use retention::{PruneReport, RetentionManager, RetentionPolicy};
pub use store::BackupStore;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
