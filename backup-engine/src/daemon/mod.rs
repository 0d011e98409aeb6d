//! Process-level coordination between concurrent invocations.

pub mod lock;

pub use lock::{LockInfo, LockState, RunLock};
