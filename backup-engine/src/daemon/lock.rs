//! Run-level lock shared by backup and restore runs.
//!
//! Only one run may touch the backup tree at a time. The lock is a file created
//! with `create_new`, so acquisition is atomic. It records its holder so a lock
//! left behind by a killed run can be inspected and cleared by an operator;
//! stale locks are never removed automatically.

use crate::utils::{current_host, BackupError, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub host: String,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current(operation: &str) -> Self {
        Self {
            pid: std::process::id(),
            host: current_host(),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{} by pid {} on {} since {}",
            self.operation,
            self.pid,
            self.host,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Snapshot of an existing lock file
#[derive(Debug, Clone)]
pub struct LockState {
    pub path: PathBuf,
    /// None when the file is empty or unreadable (holder still writing it, or damaged)
    pub info: Option<LockInfo>,
    pub holder_alive: bool,
}

impl LockState {
    pub fn is_stale(&self) -> bool {
        !self.holder_alive
    }

    pub fn describe(&self) -> String {
        match &self.info {
            Some(info) if self.holder_alive => info.describe(),
            Some(info) => format!("stale lock: {}, holder no longer running", info.describe()),
            None => format!("unreadable lock file {}", self.path.display()),
        }
    }
}

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    info: LockInfo,
}

impl RunLock {
    /// Take the lock or fail with `AlreadyRunning`. Never waits.
    pub fn acquire(path: &Path, operation: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let info = LockInfo::current(operation);

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                if let Err(e) = write_info(&mut file, &info) {
                    let _ = fs::remove_file(path);
                    return Err(e.into());
                }
                info!(lock = %path.display(), operation, "Run lock acquired");
                Ok(Self {
                    path: path.to_path_buf(),
                    info,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let state = Self::inspect(path)?.unwrap_or_else(|| LockState {
                    path: path.to_path_buf(),
                    info: None,
                    holder_alive: true,
                });
                warn!(lock = %path.display(), holder = %state.describe(), "Run lock is held");
                Err(BackupError::AlreadyRunning {
                    holder: state.describe(),
                    stale: state.is_stale(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the lock file without touching it. `None` when no lock exists.
    pub fn inspect(path: &Path) -> Result<Option<LockState>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let info: Option<LockInfo> = serde_json::from_str(content.trim()).ok();
        let holder_alive = info.as_ref().map(holder_alive).unwrap_or(true);

        Ok(Some(LockState {
            path: path.to_path_buf(),
            info,
            holder_alive,
        }))
    }

    /// Remove a lock left by a crashed run. A live holder's lock is only
    /// removed with `force`. Returns false when there was no lock.
    pub fn clear(path: &Path, force: bool) -> Result<bool> {
        let Some(state) = Self::inspect(path)? else {
            return Ok(false);
        };

        if state.holder_alive && !force {
            return Err(BackupError::AlreadyRunning {
                holder: state.describe(),
                stale: false,
            });
        }

        match fs::remove_file(path) {
            Ok(()) => {
                warn!(
                    lock = %path.display(),
                    holder = %state.describe(),
                    force,
                    "Run lock cleared"
                );
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Leave the file alone if it was force-cleared and re-taken by someone else
        match Self::inspect(&self.path) {
            Ok(Some(state)) if state.info.as_ref() == Some(&self.info) => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(lock = %self.path.display(), "Failed to release run lock: {}", e);
                } else {
                    debug!(lock = %self.path.display(), "Run lock released");
                }
            }
            _ => {}
        }
    }
}

fn write_info(file: &mut fs::File, info: &LockInfo) -> io::Result<()> {
    serde_json::to_writer(&mut *file, info)?;
    file.write_all(b"\n")?;
    file.sync_all()
}

fn holder_alive(info: &LockInfo) -> bool {
    if info.host != current_host() {
        // Can't check a process on another machine
        return true;
    }
    process_alive(info.pid)
}

fn process_alive(pid: u32) -> bool {
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return false,
    };

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: exists but owned by someone else
        Err(_) => true,
    }
}
