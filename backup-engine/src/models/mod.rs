pub mod backup_set;

pub use backup_set::{BackupSet, BackupStatus, ParseTierError, SourceEntry, SourceKind, Tier};
