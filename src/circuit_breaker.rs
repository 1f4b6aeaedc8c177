//! Circuit breaker guarding background production

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Breaker state
///
/// # Examples
///
/// ```
/// use esox_prefetchpool::{BreakerState, ProductionBreaker};
/// use std::time::Duration;
///
/// let breaker = ProductionBreaker::new(3, Duration::from_secs(60));
/// assert_eq!(breaker.state(), BreakerState::Closed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Factory calls run normally
    Closed,

    /// Factory calls are skipped
    Open,

    /// One trial call is allowed to decide whether to close again
    HalfOpen,
}

#[derive(Debug)]
enum Phase {
    Closed { consecutive_failures: usize },
    Open { since: Instant },
    HalfOpen,
}

/// Suppresses factory calls after repeated consecutive failures.
///
/// A failed background construction is already absorbed by the coordinator;
/// the breaker only stops the pool from burning background time on a
/// factory that keeps failing. Suppressed units behave like any other
/// aborted unit: no counter moves.
///
/// # Examples
///
/// ```
/// use esox_prefetchpool::ProductionBreaker;
/// use std::time::Duration;
///
/// let breaker = ProductionBreaker::new(2, Duration::from_secs(60));
/// breaker.record_failure();
/// breaker.record_failure();
///
/// assert!(!breaker.allow_attempt());
/// ```
#[derive(Debug)]
pub struct ProductionBreaker {
    phase: Mutex<Phase>,
    failure_threshold: usize,
    timeout: Duration,
}

impl ProductionBreaker {
    pub fn new(failure_threshold: usize, timeout: Duration) -> Self {
        Self {
            phase: Mutex::new(Phase::Closed { consecutive_failures: 0 }),
            failure_threshold: failure_threshold.max(1),
            timeout,
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.phase.lock() {
            Phase::Closed { .. } => BreakerState::Closed,
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Whether a unit may call the factory now.
    ///
    /// Once the timeout has passed an open breaker lets exactly one trial
    /// through; concurrent units keep being suppressed until it resolves.
    pub fn allow_attempt(&self) -> bool {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Closed { .. } => true,
            Phase::Open { since } if since.elapsed() >= self.timeout => {
                *phase = Phase::HalfOpen;
                true
            }
            Phase::Open { .. } | Phase::HalfOpen => false,
        }
    }

    pub fn record_success(&self) {
        *self.phase.lock() = Phase::Closed { consecutive_failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut phase = self.phase.lock();
        let next = match *phase {
            Phase::Closed { consecutive_failures } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    Phase::Open { since: Instant::now() }
                } else {
                    Phase::Closed { consecutive_failures: failures }
                }
            }
            Phase::HalfOpen | Phase::Open { .. } => Phase::Open { since: Instant::now() },
        };
        *phase = next;
    }
}

impl Default for ProductionBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}
