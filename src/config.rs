//! Configuration Module
//!
//! Options controlling the cache tiers. All fields carry defaults so a
//! zero-config construction works; `validate()` catches the handful of
//! values that would silently disable a tier or starve a loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sentinel accepted in `file_directory` meaning the system temp directory.
pub const TEMP_DIR_SENTINEL: &str = "%temp%";

/// Sentinel substring in a key-change notification requesting a full local
/// purge.
pub const FLUSH_ALL_SENTINEL: &str = "__flushall__";

fn default_key_prefix() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "app".to_string())
}

fn default_max_memory_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_file_directory() -> String {
    TEMP_DIR_SENTINEL.to_string()
}

fn default_free_space_threshold_pct() -> u8 {
    15
}

fn default_serializer_tag() -> String {
    "json-lz4".to_string()
}

fn default_reclaim_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> Duration {
    Duration::from_secs(5)
}

fn default_spinlock_slots() -> usize {
    512
}

fn default_supervisor_interval() -> Duration {
    Duration::from_secs(10)
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
    /// First segment of every formatted key. May be empty to share keys
    /// across services.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Memory-tier size cap in bytes.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,

    /// Connection string for the distributed tier. Empty disables L3; the
    /// concrete store client is constructed by the caller from this value.
    #[serde(default)]
    pub distributed_endpoint: String,

    /// Root for the file tier, or `%temp%` for the system temp directory.
    /// Empty disables L2.
    #[serde(default = "default_file_directory")]
    pub file_directory: String,

    /// Free-space percentage below which the file tier starts reclaiming.
    #[serde(default = "default_free_space_threshold_pct")]
    pub file_free_space_threshold_pct: u8,

    /// Serializer tag embedded into every formatted key.
    #[serde(default = "default_serializer_tag")]
    pub serializer_tag: String,

    /// How often the file tier checks free space.
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval: Duration,

    /// Consecutive distributed-tier failures that open the breaker.
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// How long the breaker stays open.
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown: Duration,

    /// Slot count for the key-sharded spinlock.
    #[serde(default = "default_spinlock_slots")]
    pub spinlock_slots: usize,

    /// How often the key-change subscription supervisor checks its pump.
    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            max_memory_bytes: default_max_memory_bytes(),
            distributed_endpoint: String::new(),
            file_directory: default_file_directory(),
            file_free_space_threshold_pct: default_free_space_threshold_pct(),
            serializer_tag: default_serializer_tag(),
            reclaim_interval: default_reclaim_interval(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown: default_breaker_cooldown(),
            spinlock_slots: default_spinlock_slots(),
            supervisor_interval: default_supervisor_interval(),
        }
    }
}

impl CacheOptions {
    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_memory_bytes == 0 {
            return Err("max_memory_bytes must be greater than zero".to_string());
        }

        if self.file_free_space_threshold_pct == 0 || self.file_free_space_threshold_pct > 100 {
            return Err(format!(
                "file_free_space_threshold_pct must be between 1 and 100, got {}",
                self.file_free_space_threshold_pct
            ));
        }

        if self.spinlock_slots == 0 {
            return Err("spinlock_slots must be greater than zero".to_string());
        }

        if self.breaker_failure_threshold == 0 {
            return Err("breaker_failure_threshold must be greater than zero".to_string());
        }

        if self.reclaim_interval.is_zero() {
            return Err("reclaim_interval must be greater than zero".to_string());
        }

        Ok(())
    }

    /// True when the file tier is configured.
    pub fn file_tier_enabled(&self) -> bool {
        !self.file_directory.is_empty()
    }
}
