//! File Cache Module
//!
//! Persistent second tier. Each entry is one file named by a BLAKE2b-128
//! digest of the formatted key, holding a fixed little-endian header
//! (absolute expiry in 100 ns ticks, payload length) followed by the
//! payload bytes. The tier is an opportunistic accelerator: every I/O or
//! decode problem is contained as a miss, an unreadable file is deleted on
//! sight, and a background loop deletes entries whenever the volume runs
//! low on free space.

use crate::cache_types::{value_as_bytes, CacheParameters, FileCacheItem};
use crate::clock::Clock;
use crate::config::TEMP_DIR_SENTINEL;
use crate::disk_space::DiskSpace;
use crate::key_lock::KeyLock;
use crate::serializer::Serializer;
use crate::{CacheError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Header bytes: i64 expiry ticks + i32 payload length.
const HEADER_LEN: usize = 12;

/// Subdirectory name under `<base>/<app_name>/`.
const CACHE_DIR_NAME: &str = "FileCache";

/// Characters rejected in configured paths.
const INVALID_PATH_CHARS: [char; 7] = ['<', '>', '|', '*', '?', '"', '\0'];

/// Retries for the remove-and-recreate cycle in `clear()`.
const CLEAR_ATTEMPTS: u32 = 10;

/// Write input: raw payload bytes, or a value to be serialized.
pub enum FilePayload<'a, T> {
    Raw(&'a [u8]),
    Value(&'a T),
}

/// Configuration for the file tier.
#[derive(Debug, Clone)]
pub struct FileCacheConfig {
    /// Base directory, or the `%temp%` sentinel.
    pub directory: String,
    /// Application segment inserted under the base directory.
    pub app_name: String,
    /// Free-space percentage below which reclaim kicks in.
    pub free_space_threshold_pct: u8,
    /// How often the reclaim loop probes free space.
    pub reclaim_interval: Duration,
    /// Slot count for the per-key spinlock.
    pub spinlock_slots: usize,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            directory: TEMP_DIR_SENTINEL.to_string(),
            app_name: "app".to_string(),
            free_space_threshold_pct: 15,
            reclaim_interval: Duration::from_secs(10),
            spinlock_slots: crate::key_lock::DEFAULT_SLOTS,
        }
    }
}

/// TTL and size bounded persistent cache tier.
pub struct FileCache<S: Serializer> {
    root: PathBuf,
    serializer: Arc<S>,
    clock: Arc<dyn Clock>,
    key_lock: KeyLock,
    directory_locked: Arc<AtomicBool>,
    shutdown: CancellationToken,
    reclaim_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Serializer> FileCache<S> {
    /// Create the tier and start its free-space reclaim loop.
    ///
    /// Must be called from within a tokio runtime. Fails when the
    /// configured path contains invalid characters or cannot be created.
    pub fn new(
        config: FileCacheConfig,
        serializer: Arc<S>,
        clock: Arc<dyn Clock>,
        disk_space: Arc<dyn DiskSpace>,
    ) -> Result<Self> {
        let root = Self::resolve_root(&config.directory, &config.app_name)?;
        std::fs::create_dir_all(&root)?;
        info!("file cache initialized: root={:?}", root);

        let key_lock = KeyLock::new(config.spinlock_slots);
        let directory_locked = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let threshold = (config.free_space_threshold_pct as f64 / 100.0).clamp(0.0, 1.0);
        let reclaim_task = tokio::spawn(reclaim_loop(
            root.clone(),
            disk_space,
            key_lock.clone(),
            threshold,
            config.reclaim_interval,
            shutdown.clone(),
        ));

        Ok(Self {
            root,
            serializer,
            clock,
            key_lock,
            directory_locked,
            shutdown,
            reclaim_task: Mutex::new(Some(reclaim_task)),
        })
    }

    fn resolve_root(directory: &str, app_name: &str) -> Result<PathBuf> {
        if directory.is_empty() {
            return Err(CacheError::ConfigError(
                "file cache directory is empty".to_string(),
            ));
        }
        if directory.contains(&INVALID_PATH_CHARS[..])
            || app_name.contains(&INVALID_PATH_CHARS[..])
            || app_name.contains(&['/', '\\'][..])
        {
            return Err(CacheError::ConfigError(format!(
                "invalid characters in file cache path: directory={:?}, app_name={:?}",
                directory, app_name
            )));
        }

        let base = if directory.eq_ignore_ascii_case(TEMP_DIR_SENTINEL) {
            std::env::temp_dir()
        } else {
            PathBuf::from(directory)
        };
        Ok(base.join(app_name).join(CACHE_DIR_NAME))
    }

    /// Root directory holding the cache files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hashed filename for a formatted key.
    pub fn file_name_for(key: &str) -> String {
        let mut hasher = Blake2b::<U16>::new();
        hasher.update(key.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    fn path_for(&self, key: &str) -> (PathBuf, String) {
        let name = Self::file_name_for(key);
        (self.root.join(&name), name)
    }

    async fn wait_directory_unlocked(&self) {
        while self.directory_locked.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Read a value. Expired or unreadable files are deleted and reported
    /// as a miss; corruption never propagates to the caller.
    pub async fn get<T>(&self, key: &str) -> Option<FileCacheItem<T>>
    where
        T: DeserializeOwned + Any + Send,
    {
        self.wait_directory_unlocked().await;
        let (path, file_name) = self.path_for(key);
        let _guard = self.key_lock.lock(&file_name).await;

        match self.read_record::<T>(&path).await {
            Ok(item) => item,
            Err(e) => {
                error!(
                    "file cache read failed: method=get, key={}, type={}, error={}",
                    key,
                    std::any::type_name::<T>(),
                    e
                );
                if let Err(del) = tokio::fs::remove_file(&path).await {
                    if del.kind() != std::io::ErrorKind::NotFound {
                        debug!("file cache purge failed: path={:?}, error={}", path, del);
                    }
                }
                None
            }
        }
    }

    async fn read_record<T>(&self, path: &Path) -> Result<Option<FileCacheItem<T>>>
    where
        T: DeserializeOwned + Any + Send,
    {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if data.len() < HEADER_LEN {
            return Err(CacheError::CorruptFile(format!(
                "record shorter than header: len={}",
                data.len()
            )));
        }

        let expires_ticks = i64::from_le_bytes(data[0..8].try_into().unwrap_or_default());
        let payload_len = i32::from_le_bytes(data[8..12].try_into().unwrap_or_default());
        if payload_len < 0 || data.len() - HEADER_LEN != payload_len as usize {
            return Err(CacheError::CorruptFile(format!(
                "payload length mismatch: header={}, actual={}",
                payload_len,
                data.len() - HEADER_LEN
            )));
        }

        let now_ticks = system_time_to_ticks(self.clock.now());
        if now_ticks >= expires_ticks {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("expired file removal failed: path={:?}, error={}", path, e);
                }
            }
            return Ok(None);
        }

        let payload = &data[HEADER_LEN..];
        let value: T = crate::cache_types::decode_value(self.serializer.as_ref(), payload)?;

        Ok(Some(FileCacheItem {
            expires: ticks_to_system_time(expires_ticks),
            value,
            size: payload_len as u32,
        }))
    }

    /// Write a value or raw payload bytes.
    ///
    /// I/O failures are logged and swallowed (the tier degrades to a miss);
    /// serialization failures surface to the caller.
    pub async fn set<T>(
        &self,
        key: &str,
        payload: FilePayload<'_, T>,
        params: &CacheParameters,
    ) -> Result<()>
    where
        T: Serialize + Any,
    {
        self.wait_directory_unlocked().await;

        let owned;
        let bytes: &[u8] = match payload {
            FilePayload::Raw(bytes) => bytes,
            FilePayload::Value(value) => match value_as_bytes(value) {
                Some(bytes) => bytes,
                None => {
                    owned = self.serializer.serialize(value)?;
                    &owned
                }
            },
        };

        let expires = self.clock.now() + params.duration;
        let mut record = Vec::with_capacity(HEADER_LEN + bytes.len());
        record.extend_from_slice(&system_time_to_ticks(expires).to_le_bytes());
        record.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
        record.extend_from_slice(bytes);

        let (path, file_name) = self.path_for(key);
        let _guard = self.key_lock.lock(&file_name).await;
        if let Err(e) = tokio::fs::write(&path, &record).await {
            error!(
                "file cache write failed: method=set, key={}, path={:?}, error={}",
                key, path, e
            );
        }
        Ok(())
    }

    /// Write already-serialized payload bytes.
    pub async fn set_raw(&self, key: &str, bytes: &[u8], params: &CacheParameters) {
        // Raw writes cannot hit the serializer, so the result is always Ok.
        let _ = self
            .set::<Vec<u8>>(key, FilePayload::Raw(bytes), params)
            .await;
    }

    /// Delete the entry for `key` if present.
    pub async fn remove(&self, key: &str) {
        self.wait_directory_unlocked().await;
        let (path, file_name) = self.path_for(key);
        let _guard = self.key_lock.lock(&file_name).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(
                    "file cache remove failed: method=remove, key={}, path={:?}, error={}",
                    key, path, e
                );
            }
        }
    }

    /// Remove and recreate the whole cache directory.
    ///
    /// Readers and writers spin on the directory lock while this runs.
    pub async fn clear(&self) {
        self.directory_locked.store(true, Ordering::Release);
        info!("file cache clear started: root={:?}", self.root);

        for attempt in 1..=CLEAR_ATTEMPTS {
            let removed = match tokio::fs::remove_dir_all(&self.root).await {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                Err(e) => {
                    warn!(
                        "file cache clear attempt {} failed to remove directory: {}",
                        attempt, e
                    );
                    false
                }
            };

            if removed {
                match tokio::fs::create_dir_all(&self.root).await {
                    Ok(()) => {
                        info!("file cache cleared: root={:?}", self.root);
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "file cache clear attempt {} failed to recreate directory: {}",
                            attempt, e
                        );
                    }
                }
            }

            if attempt < CLEAR_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(1)).await;
            } else {
                error!("file cache clear gave up after {} attempts", CLEAR_ATTEMPTS);
            }
        }

        self.directory_locked.store(false, Ordering::Release);
    }

    /// Stop the background reclaim loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.reclaim_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl<S: Serializer> Drop for FileCache<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.reclaim_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Background loop deleting cache files while the volume is under the
/// free-space threshold.
async fn reclaim_loop(
    root: PathBuf,
    disk_space: Arc<dyn DiskSpace>,
    key_lock: KeyLock,
    threshold: f64,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so construction is cheap.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = reclaim_pass(&root, disk_space.as_ref(), &key_lock, threshold).await {
            warn!("file cache reclaim pass failed: {}", e);
        }
    }
    debug!("file cache reclaim loop stopped: root={:?}", root);
}

async fn reclaim_pass(
    root: &Path,
    disk_space: &dyn DiskSpace,
    key_lock: &KeyLock,
    threshold: f64,
) -> Result<()> {
    loop {
        let total = disk_space.total_space(root)?;
        if total == 0 {
            return Ok(());
        }
        let free = disk_space.available_space(root)?;
        if free as f64 / total as f64 >= threshold {
            return Ok(());
        }

        info!(
            "file cache reclaiming space: free={}, total={}, threshold={:.2}",
            free, total, threshold
        );

        let mut reclaimed: u64 = 0;
        let mut deleted_any = false;
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();

            {
                let _guard = key_lock.lock(&file_name).await;
                let size = disk_space.file_size(&path).unwrap_or(0);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        reclaimed += size;
                        deleted_any = true;
                        debug!("file cache reclaimed: path={:?}, size={}", path, size);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!("file cache reclaim delete failed: path={:?}, error={}", path, e);
                    }
                }
            }

            if (free + reclaimed) as f64 / total as f64 >= threshold {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        if !deleted_any {
            return Ok(());
        }
    }
}

/// 100 ns ticks since the Unix epoch (UTC).
pub fn system_time_to_ticks(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_nanos() / 100).min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

/// Inverse of [`system_time_to_ticks`].
pub fn ticks_to_system_time(ticks: i64) -> SystemTime {
    if ticks <= 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::from_nanos(ticks as u64 * 100)
}
