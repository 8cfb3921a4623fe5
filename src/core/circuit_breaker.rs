//! Per-upstream circuit breaker.
//!
//! Three states: `Closed` (normal operation), `Open` (requests denied until
//! the reset timeout elapses) and `HalfOpen` (exactly one probe allowed
//! through). All mutation goes through a single mutex; the breaker is shared
//! across every request task that targets its upstream.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Failure-counting health gate for a single upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a request may go out right now.
    ///
    /// In `Open`, the first caller after the reset timeout moves the breaker
    /// to `HalfOpen` and becomes the single probe; concurrent callers keep
    /// being denied until the probe's outcome is reported.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let expired = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.reset_timeout);
                if expired {
                    inner.state = BreakerState::HalfOpen;
                    return true;
                }
                false
            }
            BreakerState::HalfOpen => false,
        }
    }

    /// Report a successful call: reset the failure counter and close.
    pub fn on_success(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Report a failed call. A failure during the `HalfOpen` probe re-opens
    /// immediately; in `Closed`, crossing the threshold opens the breaker.
    pub fn on_failure(&self) {
        let mut inner = self.lock();

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.max_failures {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            // A failure reported while already open (a call admitted before
            // the transition) keeps the breaker open with its original
            // opened_at.
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A panic while holding this lock poisons a single small struct and
        // means the process is already unwinding.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
