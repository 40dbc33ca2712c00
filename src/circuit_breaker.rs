//! Circuit Breaker Module
//!
//! Small state machine isolating the distributed tier: after a run of
//! consecutive failures the breaker opens and calls fail fast instead of
//! waiting on a dead backend. After a cool-down one probe call is admitted;
//! its outcome decides whether the breaker closes again.

use crate::clock::Clock;
use crate::{CacheError, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Consecutive failures that open the breaker.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// How long the breaker stays open before admitting a probe.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { until: SystemTime },
    HalfOpen,
}

pub struct CircuitBreaker {
    state: Mutex<State>,
    failure_threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::Closed { failures: 0 }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            clock,
        }
    }

    /// Gate a call: `Ok` admits it, `Err(BreakerOpen)` fails fast.
    ///
    /// An expired open window flips to half-open and admits the probe.
    pub fn check(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { until } => {
                if self.clock.now() >= until {
                    *state = State::HalfOpen;
                    info!("circuit breaker half-open, admitting probe call");
                    Ok(())
                } else {
                    Err(CacheError::BreakerOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, State::Closed { failures: 0 }) {
            *state = State::Closed { failures: 0 };
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    let until = self.clock.now() + self.cooldown;
                    *state = State::Open { until };
                    warn!(
                        "circuit breaker opened after {} consecutive failures, cooldown={:?}",
                        failures, self.cooldown
                    );
                } else {
                    *state = State::Closed { failures };
                }
            }
            State::HalfOpen => {
                let until = self.clock.now() + self.cooldown;
                *state = State::Open { until };
                warn!("circuit breaker probe failed, re-opening");
            }
            State::Open { .. } => {}
        }
    }

    /// True while calls would fail fast.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap();
        match *state {
            State::Open { until } => self.clock.now() < until,
            _ => false,
        }
    }
}
