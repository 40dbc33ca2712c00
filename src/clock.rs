//! Clock Module
//!
//! Small time capability behind a trait so every TTL comparison and timed
//! wait in the cache can be driven deterministically in tests.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;

/// Time source used by all cache tiers.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time (UTC).
    fn now(&self) -> SystemTime;

    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the system time and the tokio timer.
#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually advanced clock for tests.
///
/// `sleep` parks the caller until `advance` has moved the clock past the
/// requested deadline, so timed loops can be stepped without real waiting.
pub struct ManualClock {
    now: Mutex<SystemTime>,
    advanced: Notify,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
            advanced: Notify::new(),
        }
    }

    /// Move the clock forward and wake pending sleepers.
    pub fn advance(&self, delta: Duration) {
        {
            let mut now = self.now.lock().unwrap();
            *now += delta;
        }
        self.advanced.notify_waiters();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        loop {
            if self.now() >= deadline {
                return;
            }
            // Wake on advance, with a short polling fallback so a
            // notification raced between the deadline check and the await
            // cannot park the sleeper forever.
            tokio::select! {
                _ = self.advanced.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(5)) => {}
            }
        }
    }
}
