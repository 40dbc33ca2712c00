//! Key Lock Module
//!
//! Per-key mutual exclusion by hashed slot. A fixed array of atomic slots is
//! shared by all keys; acquiring spins on a compare-and-swap with an
//! escalating back-off, so hot keys yield quickly and cold contention does
//! not burn CPU. Distinct keys may collide on a slot; that only serialises
//! them, it never breaks exclusion.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default number of lock slots.
pub const DEFAULT_SLOTS: usize = 512;

/// Attempts that merely yield before the back-off starts sleeping.
const YIELD_ATTEMPTS: u32 = 10;

/// Attempts below this sleep ~1 ms; at or above, ~20 ms.
const SHORT_SLEEP_ATTEMPTS: u32 = 50;

/// Key-sharded spinlock.
#[derive(Clone)]
pub struct KeyLock {
    slots: Arc<Vec<AtomicU32>>,
}

impl KeyLock {
    pub fn new(slot_count: usize) -> Self {
        let count = slot_count.max(1);
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || AtomicU32::new(0));
        Self {
            slots: Arc::new(slots),
        }
    }

    fn slot_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.slots.len() as u64) as usize
    }

    /// Acquire the slot for `key`, spinning with escalating back-off.
    pub async fn lock(&self, key: &str) -> KeyLockGuard {
        let slot = self.slot_for(key);
        let mut attempt: u32 = 0;
        loop {
            if self.slots[slot]
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return KeyLockGuard {
                    slots: Arc::clone(&self.slots),
                    slot,
                };
            }
            attempt += 1;
            if attempt < YIELD_ATTEMPTS {
                tokio::task::yield_now().await;
            } else if attempt < SHORT_SLEEP_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(1)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

impl Default for KeyLock {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS)
    }
}

/// Scoped guard; dropping it releases the slot on every exit path.
pub struct KeyLockGuard {
    slots: Arc<Vec<AtomicU32>>,
    slot: usize,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.slots[self.slot].store(0, Ordering::Release);
    }
}
