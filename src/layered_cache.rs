//! Layered Cache Module
//!
//! Coordinates the three tiers behind one typed key/value interface:
//! read-through across memory, disk, and the distributed store;
//! write-through with a single serialization; stampede protection via
//! single-flight collapsing; and cross-process invalidation driven by the
//! distributed store's key-change notifications.
//!
//! `get` deliberately does not promote lower-tier hits into memory; only
//! `set` and `get_or_create` populate the memory tier, because those
//! callers have declared intent to cache (and supplied size accounting).

use crate::cache_types::{
    decode_value, encode_value, format_key, reject_interface_type, CacheParameters, Cacheable,
    GetOrCreateContext, SharedValue, DEFAULT_DURATION,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheOptions, FLUSH_ALL_SENTINEL};
use crate::disk_space::{DiskSpace, SystemDiskSpace};
use crate::distributed_cache::{DistributedCache, DistributedLock};
use crate::file_cache::{FileCache, FileCacheConfig};
use crate::memory_cache::MemoryCache;
use crate::serializer::{JsonLz4Serializer, Serializer};
use crate::single_flight::{FlightRole, SingleFlight};
use crate::store::Store;
use crate::ttl_jitter::jitter;
use crate::{CacheError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Three-tier cache façade.
pub struct LayeredCache<S: Serializer = JsonLz4Serializer> {
    options: CacheOptions,
    serializer: Arc<S>,
    clock: Arc<dyn Clock>,
    memory: Arc<MemoryCache>,
    file: Option<Arc<FileCache<S>>>,
    distributed: Option<Arc<DistributedCache>>,
    flights: SingleFlight,
    invalidation_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl LayeredCache<JsonLz4Serializer> {
    /// Build a cache with the stock JSON+LZ4 codec and system clock/disk
    /// probes. Must be called within a tokio runtime.
    pub async fn new(options: CacheOptions, store: Option<Arc<dyn Store>>) -> Result<Self> {
        Self::with_parts(
            options,
            store,
            JsonLz4Serializer,
            Arc::new(SystemClock),
            Arc::new(SystemDiskSpace),
        )
        .await
    }
}

impl<S: Serializer> LayeredCache<S> {
    /// Build a cache with explicit codec, clock, and disk probes.
    pub async fn with_parts(
        options: CacheOptions,
        store: Option<Arc<dyn Store>>,
        serializer: S,
        clock: Arc<dyn Clock>,
        disk_space: Arc<dyn DiskSpace>,
    ) -> Result<Self> {
        options
            .validate()
            .map_err(CacheError::ConfigError)?;

        let serializer = Arc::new(serializer);
        let memory = Arc::new(MemoryCache::new(options.max_memory_bytes, clock.clone()));

        let file = if options.file_tier_enabled() {
            let config = FileCacheConfig {
                directory: options.file_directory.clone(),
                app_name: if options.key_prefix.is_empty() {
                    "shared".to_string()
                } else {
                    options.key_prefix.clone()
                },
                free_space_threshold_pct: options.file_free_space_threshold_pct,
                reclaim_interval: options.reclaim_interval,
                spinlock_slots: options.spinlock_slots,
            };
            Some(Arc::new(FileCache::new(
                config,
                serializer.clone(),
                clock.clone(),
                disk_space,
            )?))
        } else {
            debug!("file tier disabled: empty file_directory");
            None
        };

        let distributed = match store {
            Some(store) => Some(
                DistributedCache::new(
                    store,
                    &options.key_prefix,
                    options.breaker_failure_threshold,
                    options.breaker_cooldown,
                    options.supervisor_interval,
                    clock.clone(),
                )
                .await,
            ),
            None => {
                debug!("distributed tier disabled: no store supplied");
                None
            }
        };

        let cache = Self {
            options,
            serializer,
            clock,
            memory,
            file,
            distributed,
            flights: SingleFlight::new(),
            invalidation_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        };
        cache.spawn_invalidation_task();
        Ok(cache)
    }

    /// The canonical cross-tier key for a user key of type `T`.
    pub fn format_key<T: 'static>(&self, key: &str) -> String {
        format_key::<T, S>(&self.options.key_prefix, self.serializer.as_ref(), key)
    }

    /// Direct memory-tier peek by user key, without touching LRU order.
    pub fn memory_contains<T: 'static>(&self, key: &str) -> bool {
        self.memory.contains(&self.format_key::<T>(key))
    }

    /// Memory-tier statistics.
    pub fn memory_stats(&self) -> crate::memory_cache::MemoryCacheStats {
        self.memory.stats()
    }

    /// Read through the tiers. Lower-tier hits are returned as-is without
    /// promotion; distributed-tier errors degrade to a miss.
    pub async fn get<T: Cacheable>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        let formatted = self.format_key::<T>(key);

        if let Some(value) = self.memory.get::<T>(&formatted) {
            return Ok(Some(value));
        }

        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled(format!("get cancelled: key={}", key)));
        }

        if let Some(file) = &self.file {
            if let Some(item) = file.get::<T>(&formatted).await {
                return Ok(Some(item.value));
            }
        }

        if let Some(distributed) = &self.distributed {
            match distributed.get(&formatted).await {
                Ok(item) if item.has_value() => {
                    let bytes = item.bytes.unwrap_or_default();
                    match decode_value::<S, T>(self.serializer.as_ref(), &bytes) {
                        Ok(value) => return Ok(Some(value)),
                        Err(e) => {
                            error!(
                                "distributed value decode failed: method=get, key={}, type={}, error={}",
                                key,
                                std::any::type_name::<T>(),
                                e
                            );
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        "distributed tier unavailable: method=get, key={}, type={}, error={}",
                        key,
                        std::any::type_name::<T>(),
                        e
                    );
                }
            }
        }

        Ok(None)
    }

    /// Write through every tier. Serialization happens exactly once; the
    /// distributed write may fail without failing the call.
    pub async fn set<T: Cacheable>(
        &self,
        key: &str,
        value: T,
        params: CacheParameters,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled(format!("set cancelled: key={}", key)));
        }

        let formatted = self.format_key::<T>(key);
        let params = params.normalized();
        let bytes = encode_value(self.serializer.as_ref(), &value)?;
        let duration = jitter(params.duration);

        self.memory
            .set(&formatted, Arc::new(value), params.size, duration);

        let tier_params = CacheParameters {
            duration,
            size: params.size,
        };
        if let Some(file) = &self.file {
            file.set_raw(&formatted, &bytes, &tier_params).await;
        }

        if let Some(distributed) = &self.distributed {
            if let Err(e) = distributed.set(&formatted, &bytes, duration).await {
                error!(
                    "distributed tier write failed: method=set, key={}, type={}, error={}",
                    key,
                    std::any::type_name::<T>(),
                    e
                );
            }
        }

        Ok(())
    }

    /// Remove a key from every tier. Distributed deletion errors propagate:
    /// a hidden failed delete would let the value resurrect through
    /// read-through.
    pub async fn delete<T: Cacheable>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled(format!(
                "delete cancelled: key={}",
                key
            )));
        }

        let formatted = self.format_key::<T>(key);
        self.memory.remove(&formatted);
        if let Some(file) = &self.file {
            file.remove(&formatted).await;
        }
        if let Some(distributed) = &self.distributed {
            distributed.delete(&formatted).await?;
        }
        Ok(())
    }

    /// Read through the tiers, running `factory` on a full miss — at most
    /// once per key regardless of concurrency. Lower-tier hits are promoted
    /// into the memory tier. `None` results and factory errors are never
    /// cached; a failing factory purges the key everywhere and rethrows to
    /// every collapsed waiter.
    pub async fn get_or_create<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        state: Option<SharedValue>,
        cancel: &CancellationToken,
    ) -> Result<Option<T>>
    where
        T: Cacheable,
        F: FnOnce(GetOrCreateContext) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        reject_interface_type::<T>()?;
        let formatted = self.format_key::<T>(key);

        // Fast path: a memory hit never enters the collapser.
        if let Some(value) = self.memory.get::<T>(&formatted) {
            return Ok(Some(value));
        }

        match self.flights.join(&formatted) {
            FlightRole::Follower(mut receiver) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(CacheError::Cancelled(format!(
                        "get_or_create wait cancelled: key={}",
                        key
                    ))),
                    result = receiver.recv() => match result {
                        Ok(Ok(Some(shared))) => match shared.downcast_ref::<T>() {
                            Some(value) => Ok(Some(value.clone())),
                            None => Err(CacheError::InternalError(format!(
                                "collapsed value type mismatch: key={}, expected={}",
                                key,
                                std::any::type_name::<T>()
                            ))),
                        },
                        Ok(Ok(None)) => Ok(None),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(CacheError::Cancelled(format!(
                            "in-flight load abandoned: key={}",
                            key
                        ))),
                    },
                }
            }
            FlightRole::Leader(guard) => {
                let result = self
                    .load_or_create(&formatted, factory, state, cancel)
                    .await;
                match &result {
                    Ok(value) => guard.complete(Ok(value
                        .as_ref()
                        .map(|v| Arc::new(v.clone()) as SharedValue))),
                    Err(e) => guard.complete(Err(e.clone())),
                }
                result
            }
        }
    }

    /// Leader-side body of `get_or_create`: check the lower tiers, then run
    /// the factory and write through.
    async fn load_or_create<T, F, Fut>(
        &self,
        formatted: &str,
        factory: F,
        state: Option<SharedValue>,
        cancel: &CancellationToken,
    ) -> Result<Option<T>>
    where
        T: Cacheable,
        F: FnOnce(GetOrCreateContext) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let ctx = GetOrCreateContext::new(formatted, state, cancel.clone());

        if let Some(file) = &self.file {
            if let Some(item) = file.get::<T>(formatted).await {
                // Doubled to cover serialization overhead once promoted.
                ctx.set_size(item.size.saturating_mul(2));
                if let Ok(remaining) = item.expires.duration_since(self.clock.now()) {
                    if !remaining.is_zero() {
                        ctx.set_duration(remaining);
                    }
                }
                self.promote(formatted, &item.value, &ctx);
                return Ok(Some(item.value));
            }
        }

        if let Some(distributed) = &self.distributed {
            match distributed.get(formatted).await {
                Ok(item) if item.has_value() => {
                    let bytes = item.bytes.unwrap_or_default();
                    match decode_value::<S, T>(self.serializer.as_ref(), &bytes) {
                        Ok(value) => {
                            ctx.set_size((bytes.len() as u32).saturating_mul(2));
                            ctx.set_duration(item.expiry.unwrap_or(DEFAULT_DURATION));
                            self.promote(formatted, &value, &ctx);
                            return Ok(Some(value));
                        }
                        Err(e) => {
                            error!(
                                "distributed value decode failed: method=get_or_create, key={}, type={}, error={}",
                                formatted,
                                std::any::type_name::<T>(),
                                e
                            );
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        "distributed tier unavailable: method=get_or_create, key={}, type={}, error={}",
                        formatted,
                        std::any::type_name::<T>(),
                        e
                    );
                }
            }
        }

        let created = match factory(ctx.clone()).await {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "factory failed, purging key from all tiers: key={}, error={}",
                    formatted, e
                );
                self.purge_all_tiers(formatted).await;
                return Err(e);
            }
        };

        let Some(value) = created else {
            // Null results are never cached.
            return Ok(None);
        };

        let bytes = match encode_value(self.serializer.as_ref(), &value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "serialization failed, purging key from all tiers: key={}, error={}",
                    formatted, e
                );
                self.purge_all_tiers(formatted).await;
                return Err(e);
            }
        };

        let params = ctx.parameters().normalized();
        let duration = jitter(params.duration);
        self.memory
            .set(formatted, Arc::new(value.clone()), params.size, duration);

        let tier_params = CacheParameters {
            duration,
            size: params.size,
        };
        if let Some(file) = &self.file {
            file.set_raw(formatted, &bytes, &tier_params).await;
        }
        if let Some(distributed) = &self.distributed {
            if let Err(e) = distributed.set(formatted, &bytes, duration).await {
                error!(
                    "distributed tier write failed: method=get_or_create, key={}, error={}",
                    formatted, e
                );
            }
        }

        Ok(Some(value))
    }

    /// Promote a lower-tier hit into the memory tier using the context's
    /// (possibly factory-adjusted) parameters.
    ///
    /// The duration here is the source tier's remaining TTL, so it is used
    /// as-is: stretching it would let the promoted entry outlive the tier
    /// it came from. Jitter is only drawn when a fresh TTL is established.
    fn promote<T: Cacheable>(&self, formatted: &str, value: &T, ctx: &GetOrCreateContext) {
        let params = ctx.parameters().normalized();
        self.memory
            .set(formatted, Arc::new(value.clone()), params.size, params.duration);
    }

    async fn purge_all_tiers(&self, formatted: &str) {
        self.memory.remove(formatted);
        if let Some(file) = &self.file {
            file.remove(formatted).await;
        }
        if let Some(distributed) = &self.distributed {
            if let Err(e) = distributed.delete(formatted).await {
                error!(
                    "best-effort distributed purge failed: key={}, error={}",
                    formatted, e
                );
            }
        }
    }

    /// Acquire a distributed lock. Returns `None` when no distributed tier
    /// is configured or the lock could not be taken within `timeout`.
    pub async fn try_acquire_lock(
        &self,
        key: &str,
        hold: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<DistributedLock>> {
        match &self.distributed {
            Some(distributed) => distributed.try_lock(key, hold, timeout, cancel).await,
            None => Ok(None),
        }
    }

    fn spawn_invalidation_task(&self) {
        let Some(distributed) = &self.distributed else {
            return;
        };
        let mut receiver = distributed.subscribe_key_changed();
        let memory = Arc::clone(&self.memory);
        let file = self.file.clone();
        let prefix_marker = format!("{}:", self.options.key_prefix);
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                let key = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(key) => key,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("invalidation stream lagged, {} notifications dropped", skipped);
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                };

                if key.contains(FLUSH_ALL_SENTINEL) {
                    info!("flush-all notification received, purging local tiers");
                    memory.compact(1.0);
                    if let Some(file) = file.clone() {
                        // Clearing the directory can take a while; keep the
                        // handler responsive.
                        tokio::spawn(async move { file.clear().await });
                    }
                } else if key.starts_with(&prefix_marker) {
                    debug!("invalidation notification: key={}", key);
                    memory.remove(&key);
                    if let Some(file) = &file {
                        file.remove(&key).await;
                    }
                }
            }
            debug!("invalidation task stopped");
        });
        *self.invalidation_task.lock().unwrap() = Some(task);
    }

    /// Stop the background tasks owned by this cache: the invalidation
    /// subscription, the file tier's reclaim loop, and the distributed
    /// tier's subscription supervisor.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.invalidation_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(file) = &self.file {
            file.shutdown();
        }
        if let Some(distributed) = &self.distributed {
            distributed.shutdown();
        }
        info!("layered cache shut down");
    }
}
