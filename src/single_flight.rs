//! Single Flight Module
//!
//! Collapses concurrent loads for the same key onto one execution. The first
//! caller becomes the leader and runs the load; later callers subscribe to a
//! broadcast channel and observe the leader's result (value or error). The
//! flight map is separate from the value tiers, so a flight key can never
//! satisfy a first-class cache read.

use crate::cache_types::SharedValue;
use crate::{CacheError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Shared outcome of one collapsed load.
pub type FlightResult = Result<Option<SharedValue>>;

/// One completion message per flight.
const FLIGHT_CHANNEL_CAPACITY: usize = 1;

/// Role assigned to a caller joining a flight.
pub enum FlightRole {
    /// First caller for this key; must run the load and complete the guard.
    Leader(FlightGuard),
    /// A load is already in flight; await its broadcast result.
    Follower(broadcast::Receiver<FlightResult>),
}

/// Deduplicates concurrent loads per key.
#[derive(Clone, Default)]
pub struct SingleFlight {
    pending: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, becoming leader or follower atomically.
    pub fn join(&self, key: &str) -> FlightRole {
        match self.pending.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(FLIGHT_CHANNEL_CAPACITY);
                vacant.insert(tx.clone());
                FlightRole::Leader(FlightGuard {
                    key: key.to_string(),
                    sender: tx,
                    pending: Arc::clone(&self.pending),
                    completed: false,
                })
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                FlightRole::Follower(occupied.get().subscribe())
            }
        }
    }

    /// Number of loads currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }
}

/// Leader-side handle for a flight.
///
/// Completion removes the flight entry before broadcasting, so a caller
/// arriving afterwards starts a fresh load instead of observing a settled
/// channel. Dropping the guard without completing poisons the flight with a
/// `Cancelled` error so followers never hang.
pub struct FlightGuard {
    key: String,
    sender: broadcast::Sender<FlightResult>,
    pending: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
    completed: bool,
}

impl FlightGuard {
    /// Publish the shared result to every follower and retire the flight.
    pub fn complete(mut self, result: FlightResult) {
        self.completed = true;
        self.pending.remove(&self.key);
        if self.sender.send(result).is_err() {
            debug!("flight completed with no followers: key={}", self.key);
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.pending.remove(&self.key);
            let _ = self.sender.send(Err(CacheError::Cancelled(
                "load abandoned before completion".to_string(),
            )));
        }
    }
}
