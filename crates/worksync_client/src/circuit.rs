//! Circuit breaker.
//!
//! - **Closed**: calls pass through; consecutive transient failures are
//!   counted and reaching the threshold opens the circuit.
//! - **Open**: calls fail immediately with [`SyncError::CircuitOpen`] carrying
//!   the remaining cooldown. The operation is never invoked.
//! - **HalfOpen**: entered lazily once the cooldown has elapsed. Exactly one
//!   trial call is admitted; success closes the circuit, failure reopens it
//!   with a longer cooldown.
//!
//! Only transient failures count. A terminal error such as a version conflict
//! proves the server is reachable and is recorded as a success.

use crate::config::BreakerConfig;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are short-circuited.
    Open,
    /// One trial call is allowed.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
}

/// Thread-safe circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown,
                trial_in_flight: false,
            }),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        Self::refresh(&mut inner);
        inner.state
    }

    /// Returns the remaining cooldown while open.
    pub fn retry_after(&self) -> Option<Duration> {
        let mut inner = self.inner.lock();
        Self::refresh(&mut inner);
        match inner.state {
            CircuitState::Open => Some(Self::remaining(&inner)),
            _ => None,
        }
    }

    /// Returns the number of consecutive failures recorded while closed.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Forces the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.cooldown = self.config.cooldown;
        inner.trial_in_flight = false;
    }

    /// Runs `operation` unless the circuit is open.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let permit = self.acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.succeed(),
            // The caller gave up; that says nothing about the server.
            Err(SyncError::Cancelled) => drop(permit),
            Err(e) if e.is_transient() => permit.fail(),
            Err(_) => permit.succeed(),
        }
        result
    }

    fn acquire(&self) -> SyncResult<Permit<'_>> {
        let mut inner = self.inner.lock();
        Self::refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::Open => Err(SyncError::CircuitOpen {
                retry_after: Self::remaining(&inner),
            }),
            CircuitState::HalfOpen if inner.trial_in_flight => Err(SyncError::CircuitOpen {
                retry_after: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                debug!("circuit half-open, admitting trial call");
                Ok(Permit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
        }
    }

    fn refresh(inner: &mut Inner) {
        if inner.state == CircuitState::Open && Self::remaining(inner).is_zero() {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }

    fn remaining(inner: &Inner) -> Duration {
        match inner.opened_at {
            Some(opened_at) => inner.cooldown.saturating_sub(opened_at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.cooldown = self.config.cooldown;
            inner.trial_in_flight = false;
            info!("trial call succeeded, circuit closed");
        }
        if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.cooldown = self.config.next_cooldown(inner.cooldown);
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
            warn!(cooldown = ?inner.cooldown, "trial call failed, circuit reopened");
            return;
        }
        if inner.state != CircuitState::Closed {
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.cooldown = self.config.cooldown;
            warn!(
                failures = inner.consecutive_failures,
                cooldown = ?inner.cooldown,
                "failure threshold reached, circuit opened"
            );
        }
    }
}

/// Admission for one call. A trial permit dropped without an outcome frees
/// the trial slot and leaves the circuit half-open.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}
