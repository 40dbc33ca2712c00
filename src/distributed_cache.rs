//! Distributed Cache Module
//!
//! Adapter around the external distributed store. Every store call runs
//! through a circuit breaker so a dead backend fails fast instead of
//! stalling the read path; replica failures trigger a reconnect and one
//! retry; key-change notifications are pumped onto a local broadcast
//! channel, with a supervisor task that re-subscribes whenever the pump
//! dies. Distributed locks hand out scoped guards keyed by a random token.

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::FLUSH_ALL_SENTINEL;
use crate::store::{strip_keyspace_envelope, Store};
use crate::cache_types::DistributedItem;
use crate::{CacheError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use tracing::{debug, error, info, warn};

/// Capacity of the local key-change broadcast channel.
const KEY_CHANGED_CAPACITY: usize = 256;

/// Delay between distributed-lock acquisition attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Error-message fragment identifying a recoverable replica failure.
const REPLICA_ERROR_FRAGMENT: &str = "replica";

/// Circuit-breaker-guarded view of the distributed store with key-change
/// notifications.
pub struct DistributedCache {
    store: Arc<dyn Store>,
    breaker: CircuitBreaker,
    key_changed: broadcast::Sender<String>,
    key_prefix: String,
    clock: Arc<dyn Clock>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    /// Serialises reconfigure + resubscribe transitions.
    reconnect_gate: tokio::sync::Mutex<()>,
}

impl DistributedCache {
    /// Wrap a store, subscribe to its key-change notifications, and start
    /// the subscription supervisor. Must be called within a tokio runtime.
    pub async fn new(
        store: Arc<dyn Store>,
        key_prefix: &str,
        breaker_failure_threshold: u32,
        breaker_cooldown: Duration,
        supervisor_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (key_changed, _) = broadcast::channel(KEY_CHANGED_CAPACITY);
        let adapter = Arc::new(Self {
            store,
            breaker: CircuitBreaker::new(breaker_failure_threshold, breaker_cooldown, clock.clone()),
            key_changed,
            key_prefix: key_prefix.to_string(),
            clock,
            pump_task: Mutex::new(None),
            supervisor_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
            reconnect_gate: tokio::sync::Mutex::new(()),
        });

        if let Err(e) = adapter.resubscribe().await {
            warn!("initial key-change subscription failed: {}", e);
        }
        adapter.spawn_supervisor(Arc::downgrade(&adapter), supervisor_interval);
        adapter
    }

    /// Receiver of changed-key notifications (envelope already stripped).
    pub fn subscribe_key_changed(&self) -> broadcast::Receiver<String> {
        self.key_changed.subscribe()
    }

    /// True while the breaker is rejecting calls.
    pub fn is_broken(&self) -> bool {
        self.breaker.is_open()
    }

    fn subscription_patterns(&self) -> Vec<String> {
        vec![
            format!("__keyspace@*__:{}:*", self.key_prefix),
            format!("{}*", FLUSH_ALL_SENTINEL),
        ]
    }

    /// (Re-)establish the key-change subscription and restart the pump.
    async fn resubscribe(&self) -> Result<()> {
        let patterns = self.subscription_patterns();
        let mut receiver = self.store.subscribe(&patterns).await?;
        info!("key-change subscription established: patterns={:?}", patterns);

        let key_changed = self.key_changed.clone();
        let shutdown = self.shutdown.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(raw) => {
                            let key = strip_keyspace_envelope(&raw).to_string();
                            debug!("key-change notification: key={}", key);
                            let _ = key_changed.send(key);
                        }
                        None => {
                            debug!("key-change stream closed");
                            break;
                        }
                    }
                }
            }
        });

        let mut slot = self.pump_task.lock().unwrap();
        if let Some(old) = slot.replace(pump) {
            old.abort();
        }
        Ok(())
    }

    fn pump_is_dead(&self) -> bool {
        match self.pump_task.lock().unwrap().as_ref() {
            Some(task) => task.is_finished(),
            None => true,
        }
    }

    fn spawn_supervisor(&self, weak: std::sync::Weak<Self>, interval: Duration) {
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(adapter) = weak.upgrade() else { break };
                if adapter.pump_is_dead() {
                    info!("key-change pump is down, re-subscribing");
                    if let Err(e) = adapter.resubscribe().await {
                        warn!("key-change re-subscription failed: {}", e);
                    }
                }
            }
        });
        *self.supervisor_task.lock().unwrap() = Some(task);
    }

    fn is_replica_error(error: &CacheError) -> bool {
        error.to_string().to_ascii_lowercase().contains(REPLICA_ERROR_FRAGMENT)
    }

    /// Reconnect after a replica failure and re-establish the subscription.
    async fn heal(&self) {
        let _gate = self.reconnect_gate.lock().await;
        warn!("replica failure detected, reconfiguring store connection");
        if let Err(e) = self.store.reconfigure().await {
            error!("store reconfigure failed: {}", e);
            return;
        }
        if let Err(e) = self.resubscribe().await {
            warn!("re-subscription after reconfigure failed: {}", e);
        }
    }

    fn record<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<DistributedItem> {
        self.breaker.check()?;
        let result = match self.store.get(key).await {
            Err(e) if Self::is_replica_error(&e) => {
                self.heal().await;
                self.store.get(key).await
            }
            other => other,
        };
        self.record(&result);
        result
    }

    pub async fn set(&self, key: &str, bytes: &[u8], expiry: Duration) -> Result<()> {
        self.breaker.check()?;
        let result = match self.store.set(key, bytes, expiry).await {
            Err(e) if Self::is_replica_error(&e) => {
                self.heal().await;
                self.store.set(key, bytes, expiry).await
            }
            other => other,
        };
        self.record(&result);
        result
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.breaker.check()?;
        let result = match self.store.delete(key).await {
            Err(e) if Self::is_replica_error(&e) => {
                self.heal().await;
                self.store.delete(key).await
            }
            other => other,
        };
        self.record(&result);
        result
    }

    /// Acquire a distributed lock, retrying until `timeout`.
    ///
    /// `timeout` of zero means a single attempt. Returns `None` when the
    /// lock could not be taken in time.
    pub async fn try_lock(
        &self,
        key: &str,
        hold: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<DistributedLock>> {
        let token = Uuid::new_v4().to_string();
        let deadline = self.clock.now() + timeout;

        loop {
            self.breaker.check()?;
            let attempt = self.store.try_lock(key, &token, hold).await;
            self.record(&attempt);
            match attempt {
                Ok(true) => {
                    debug!("distributed lock acquired: key={}", key);
                    return Ok(Some(DistributedLock {
                        store: Arc::clone(&self.store),
                        key: key.to_string(),
                        token,
                        released: false,
                    }));
                }
                Ok(false) => {}
                Err(e) => return Err(e),
            }

            if timeout.is_zero() || self.clock.now() + LOCK_RETRY_DELAY > deadline {
                warn!(
                    "distributed lock timed out: key={}, timeout={:?}",
                    key, timeout
                );
                return Ok(None);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CacheError::Cancelled(format!(
                        "lock acquisition cancelled: key={}",
                        key
                    )));
                }
                _ = self.clock.sleep(LOCK_RETRY_DELAY) => {}
            }
        }
    }

    /// Stop the pump and supervisor tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.pump_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.supervisor_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for DistributedCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Scoped distributed lock; releasing publishes the token so unlock is
/// idempotent.
pub struct DistributedLock {
    store: Arc<dyn Store>,
    key: String,
    token: String,
    released: bool,
}

impl DistributedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock explicitly.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.unlock(&self.key, &self.token).await
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best-effort asynchronous unlock when the guard is dropped without
        // an explicit release.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let key = std::mem::take(&mut self.key);
            let token = std::mem::take(&mut self.token);
            handle.spawn(async move {
                if let Err(e) = store.unlock(&key, &token).await {
                    warn!("distributed lock release failed: key={}, error={}", key, e);
                }
            });
        }
    }
}
