//! Store Module
//!
//! Seam to the external distributed store: typed operations over GET / SET /
//! DELETE / TRY-LOCK plus a key-change event stream delivered in the store's
//! keyspace-notification envelope. The concrete network client lives outside
//! this crate; an in-memory backend is provided for tests.

use crate::cache_types::DistributedItem;
use crate::clock::Clock;
use crate::{CacheError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// Distributed key/value backend with key-change notifications.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a value and its remaining TTL.
    async fn get(&self, key: &str) -> Result<DistributedItem>;

    /// Write a value with an absolute TTL.
    async fn set(&self, key: &str, bytes: &[u8], expiry: Duration) -> Result<()>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically take the named lock with `token`, holding it for `hold`.
    /// Returns false when the lock is already taken.
    async fn try_lock(&self, key: &str, token: &str, hold: Duration) -> Result<bool>;

    /// Release the named lock if `token` still owns it (idempotent).
    async fn unlock(&self, key: &str, token: &str) -> Result<()>;

    /// Subscribe to key-change notifications matching the given patterns.
    /// Notifications arrive wrapped in the keyspace envelope.
    async fn subscribe(&self, patterns: &[String]) -> Result<mpsc::UnboundedReceiver<String>>;

    /// Re-establish the connection after a replica failure.
    async fn reconfigure(&self) -> Result<()>;
}

/// Strip the `__keyspace@<db>__:` envelope from an inbound notification,
/// returning the raw changed key. Notifications without the envelope are
/// passed through unchanged.
pub fn strip_keyspace_envelope(raw: &str) -> &str {
    if let Some(rest) = raw.strip_prefix("__keyspace@") {
        if let Some(idx) = rest.find("__:") {
            return &rest[idx + 3..];
        }
    }
    raw
}

/// Simple `*` glob match, the shape used by keyspace-notification
/// subscription patterns.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == value;
    }

    let first = segments[0];
    if !value.starts_with(first) {
        return false;
    }
    let mut rest = &value[first.len()..];

    let last = segments[segments.len() - 1];
    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }

    last.is_empty() || rest.ends_with(last)
}

struct StoredValue {
    bytes: Vec<u8>,
    expires_at: SystemTime,
}

struct StoredLock {
    token: String,
    expires_at: SystemTime,
}

#[derive(Default)]
struct FailurePlan {
    remaining: u32,
    message: String,
}

/// In-memory store backend (for tests).
///
/// Supports TTL-aware values, token locks, pattern subscriptions, manual
/// event publication, and scripted failures so breaker and self-heal paths
/// can be exercised without a real backend.
pub struct InMemoryStore {
    values: Mutex<HashMap<String, StoredValue>>,
    locks: Mutex<HashMap<String, StoredLock>>,
    subscribers: Mutex<Vec<(Vec<String>, mpsc::UnboundedSender<String>)>>,
    failure_plan: Mutex<FailurePlan>,
    clock: Arc<dyn Clock>,
    get_calls: AtomicU64,
    set_calls: AtomicU64,
    delete_calls: AtomicU64,
    reconfigure_calls: AtomicU64,
    subscribe_calls: AtomicU64,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            failure_plan: Mutex::new(FailurePlan::default()),
            clock,
            get_calls: AtomicU64::new(0),
            set_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            reconfigure_calls: AtomicU64::new(0),
            subscribe_calls: AtomicU64::new(0),
        }
    }

    /// Script the next `count` data operations to fail with `message`.
    pub fn fail_next(&self, count: u32, message: &str) {
        let mut plan = self.failure_plan.lock().unwrap();
        plan.remaining = count;
        plan.message = message.to_string();
    }

    /// Publish a raw (already enveloped) notification to matching
    /// subscribers.
    pub fn publish_event(&self, raw: &str) {
        let stripped = strip_keyspace_envelope(raw);
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|(patterns, tx)| {
            let matched = patterns
                .iter()
                .any(|p| pattern_matches(p, raw) || pattern_matches(p, stripped));
            if matched {
                tx.send(raw.to_string()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    /// Drop every live subscription, simulating a lost connection.
    pub fn drop_subscriptions(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> u64 {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn reconfigure_calls(&self) -> u64 {
        self.reconfigure_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.values
            .lock()
            .unwrap()
            .get(key)
            .map(|v| now < v.expires_at)
            .unwrap_or(false)
    }

    fn inject_failure(&self) -> Result<()> {
        let mut plan = self.failure_plan.lock().unwrap();
        if plan.remaining > 0 {
            plan.remaining -= 1;
            return Err(CacheError::StoreError(plan.message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> Result<DistributedItem> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.inject_failure()?;
        let now = self.clock.now();
        let mut values = self.values.lock().unwrap();
        match values.get(key) {
            Some(stored) if now < stored.expires_at => {
                let remaining = stored
                    .expires_at
                    .duration_since(now)
                    .unwrap_or(Duration::ZERO);
                Ok(DistributedItem::with_value(stored.bytes.clone(), remaining))
            }
            Some(_) => {
                values.remove(key);
                Ok(DistributedItem::empty())
            }
            None => Ok(DistributedItem::empty()),
        }
    }

    async fn set(&self, key: &str, bytes: &[u8], expiry: Duration) -> Result<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.inject_failure()?;
        let expires_at = self.clock.now() + expiry;
        self.values.lock().unwrap().insert(
            key.to_string(),
            StoredValue {
                bytes: bytes.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.inject_failure()?;
        self.values.lock().unwrap().remove(key);
        Ok(())
    }

    async fn try_lock(&self, key: &str, token: &str, hold: Duration) -> Result<bool> {
        self.inject_failure()?;
        let now = self.clock.now();
        let mut locks = self.locks.lock().unwrap();
        match locks.get(key) {
            Some(existing) if now < existing.expires_at && existing.token != token => Ok(false),
            _ => {
                locks.insert(
                    key.to_string(),
                    StoredLock {
                        token: token.to_string(),
                        expires_at: now + hold,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if let Some(existing) = locks.get(key) {
            if existing.token == token {
                locks.remove(key);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<mpsc::UnboundedReceiver<String>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .push((patterns.to_vec(), tx));
        Ok(rx)
    }

    async fn reconfigure(&self) -> Result<()> {
        self.reconfigure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
