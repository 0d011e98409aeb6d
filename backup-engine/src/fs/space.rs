//! Free-space queries for archive destinations.

use nix::sys::statvfs::statvfs;
use std::io;
use std::path::Path;

/// Bytes available to unprivileged writers on the filesystem holding `path`.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let stat = statvfs(path).map_err(io::Error::from)?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
}

/// True when the error is the kernel reporting a full disk.
pub fn is_out_of_space(error: &io::Error) -> bool {
    error.raw_os_error() == Some(nix::libc::ENOSPC)
}
