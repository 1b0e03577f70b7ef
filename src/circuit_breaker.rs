// =============================================================================
// circuit_breaker.rs - DON'T KICK THE STORE WHILE IT'S DOWN
// =============================================================================
//
// The remote store sits behind a breaker. When upserts keep failing at the
// transport level (the project is paused, the pooler is saturated, the network
// went away) there is no point sending every worker's batch into the void.
//
//   Closed  { failures }   upserts flow; transport failures in a row are counted
//   Open    { since }      upserts are refused until the cooldown has passed
//   HalfOpen { successes } upserts flow again; enough of them succeeding closes
//                          the breaker, any failure reopens it
//
// A refused upsert is not a silent drop. The sink counts it as a failed
// attempt, so a batch that only ever meets an open breaker still ends up in
// the failure log.
// =============================================================================

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

/// Coarse state, for logs and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

impl Phase {
    fn coarse(&self) -> CircuitState {
        match self {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

struct Inner {
    phase: Phase,
    trips: u64,
}

pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
    trip_after: u32,
    cooldown: Duration,
    close_after: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, trip_after: u32, cooldown: Duration, close_after: u32) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                phase: Phase::Closed { failures: 0 },
                trips: 0,
            }),
            trip_after: trip_after.max(1),
            cooldown,
            close_after: close_after.max(1),
        }
    }

    /// May an upsert go out now? Once the cooldown has passed an open
    /// breaker goes half-open and lets it through.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        let phase = inner.phase;
        match phase {
            Phase::Closed { .. } | Phase::HalfOpen { .. } => true,
            Phase::Open { since } if since.elapsed() >= self.cooldown => {
                info!(breaker = %self.name, "Cooldown over, letting a trial upsert through");
                inner.phase = Phase::HalfOpen { successes: 0 };
                true
            }
            Phase::Open { .. } => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let phase = inner.phase;
        inner.phase = match phase {
            Phase::HalfOpen { successes } if successes + 1 >= self.close_after => {
                info!(breaker = %self.name, "Store is answering again, breaker closed");
                Phase::Closed { failures: 0 }
            }
            Phase::HalfOpen { successes } => Phase::HalfOpen { successes: successes + 1 },
            Phase::Closed { .. } => Phase::Closed { failures: 0 },
            open @ Phase::Open { .. } => open,
        };
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let phase = inner.phase;
        let next = match phase {
            Phase::Closed { failures } if failures + 1 >= self.trip_after => {
                warn!(
                    breaker = %self.name,
                    failures = failures + 1,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Breaker open, refusing upserts"
                );
                inner.trips += 1;
                Phase::Open { since: Instant::now() }
            }
            Phase::Closed { failures } => Phase::Closed { failures: failures + 1 },
            Phase::HalfOpen { .. } => {
                warn!(breaker = %self.name, "Trial upsert failed, breaker open again");
                inner.trips += 1;
                Phase::Open { since: Instant::now() }
            }
            Phase::Open { .. } => Phase::Open { since: Instant::now() },
        };
        inner.phase = next;
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().phase.coarse()
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.phase.coarse(),
            failure_count: match inner.phase {
                Phase::Closed { failures } => failures,
                _ => 0,
            },
            total_trips: inner.trips,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_trips: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("store", 3, Duration::from_secs(60), 1);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 2);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
        assert_eq!(breaker.snapshot().total_trips, 1);
    }

    #[test]
    fn test_a_success_forgets_earlier_failures() {
        let breaker = CircuitBreaker::new("store", 2, Duration::from_secs(60), 1);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_closes_after_enough_successes() {
        let breaker = CircuitBreaker::new("store", 1, Duration::ZERO, 2);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("store", 1, Duration::ZERO, 1);
        breaker.record_failure();
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().total_trips, 2);
    }
}
