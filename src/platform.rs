//! Free-disk-space query backing the façade's `free_disk_space_limit`.
//!
//! A minimal Unix implementation via `statvfs`; other platforms report
//! unlimited free space, disabling the enforcement loop.

use std::path::Path;

#[cfg(unix)]
pub fn free_bytes(path: &Path) -> u64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64),
        Err(_) => u64::MAX,
    }
}

#[cfg(not(unix))]
pub fn free_bytes(_path: &Path) -> u64 {
    u64::MAX
}
