//! Disk Space Module
//!
//! Free/total disk probing behind a trait so the file tier's reclaim loop can
//! be exercised under synthetic disk pressure in tests.

use crate::{CacheError, Result};
use std::path::Path;
use std::sync::Mutex;

/// Disk capacity probe used by the file cache.
pub trait DiskSpace: Send + Sync {
    /// Bytes available to the current user on the volume holding `path`.
    fn available_space(&self, path: &Path) -> Result<u64>;

    /// Total bytes on the volume holding `path`.
    fn total_space(&self, path: &Path) -> Result<u64>;

    /// Size in bytes of the file at `path`.
    fn file_size(&self, path: &Path) -> Result<u64>;
}

/// Production probe backed by the operating system.
#[derive(Debug, Default)]
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn available_space(&self, path: &Path) -> Result<u64> {
        fs2::available_space(path).map_err(|e| {
            CacheError::IoError(format!("available_space probe failed: path={:?}, error={}", path, e))
        })
    }

    fn total_space(&self, path: &Path) -> Result<u64> {
        fs2::total_space(path).map_err(|e| {
            CacheError::IoError(format!("total_space probe failed: path={:?}, error={}", path, e))
        })
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}

/// Probe with settable free/total numbers, for tests.
pub struct FixedDiskSpace {
    free: Mutex<u64>,
    total: u64,
}

impl FixedDiskSpace {
    pub fn new(free: u64, total: u64) -> Self {
        Self {
            free: Mutex::new(free),
            total,
        }
    }

    pub fn set_free(&self, free: u64) {
        *self.free.lock().unwrap() = free;
    }
}

impl DiskSpace for FixedDiskSpace {
    fn available_space(&self, _path: &Path) -> Result<u64> {
        Ok(*self.free.lock().unwrap())
    }

    fn total_space(&self, _path: &Path) -> Result<u64> {
        Ok(self.total)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}
