//! Retry policy with exponential backoff.

use crate::config::RetryConfig;
use crate::context::RequestContext;
use crate::error::{SyncError, SyncResult};
use std::future::Future;
use tracing::{debug, warn};

/// Retries transient failures with exponential backoff.
///
/// Terminal errors propagate on first occurrence without consuming another
/// attempt. Cancellation of the context, during the operation or during a
/// backoff wait, returns [`SyncError::Cancelled`] immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation`, passing the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, ctx: &RequestContext, mut operation: F) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if ctx.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = ctx.cancellation().cancelled() => return Err(SyncError::Cancelled),
                result = operation(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                warn!(
                    correlation_id = %ctx.correlation_id(),
                    attempts = attempt,
                    error = %error,
                    "giving up after transient failures"
                );
                return Err(error);
            }

            let delay = self.config.delay_for_attempt(attempt);
            debug!(
                correlation_id = %ctx.correlation_id(),
                attempt,
                ?delay,
                error = %error,
                "transient failure, backing off"
            );

            tokio::select! {
                biased;
                _ = ctx.cancellation().cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::new(max_attempts)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(100))
                .with_backoff_multiplier(2.0),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_grow_and_cap() {
        let policy = policy(5);
        let ctx = RequestContext::new();
        let started = Mutex::new(Vec::new());

        let result: SyncResult<()> = policy
            .execute(&ctx, |_| {
                started.lock().push(Instant::now());
                async { Err(SyncError::connection_failure("refused")) }
            })
            .await;
        assert!(matches!(result, Err(SyncError::ConnectionFailure { .. })));

        let started = started.into_inner();
        assert_eq!(started.len(), 5);
        let gaps: Vec<_> = started.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [10, 20, 40, 80].map(Duration::from_millis);
        for (gap, expected) in gaps.iter().zip(expected) {
            // The paused clock wakes timers on millisecond ticks.
            assert!(*gap >= expected, "{gap:?} < {expected:?}");
            assert!(*gap < expected + Duration::from_millis(2), "{gap:?}");
            assert!(*gap <= Duration::from_millis(100) + Duration::from_millis(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_is_not_retried() {
        let policy = policy(5);
        let ctx = RequestContext::new();
        let calls = AtomicU32::new(0);

        let result: SyncResult<()> = policy
            .execute(&ctx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::Validation("title is required".into())) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let policy = policy(3);
        let ctx = RequestContext::new();

        let result = policy
            .execute(&ctx, |attempt| async move {
                if attempt < 3 {
                    Err(SyncError::from(std::io::Error::other("reset")))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let policy = RetryPolicy::new(RetryConfig::new(5).with_initial_delay(Duration::from_secs(1)));
        let ctx = RequestContext::new();
        let calls = AtomicU32::new(0);

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });

        let result: SyncResult<()> = policy
            .execute(&ctx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::connection_failure("refused")) }
            })
            .await;

        assert_eq!(result, Err(SyncError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_operation_propagates() {
        let policy = policy(5);
        let ctx = RequestContext::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });

        let result: SyncResult<()> = policy
            .execute(&ctx, |_| std::future::pending())
            .await;
        assert_eq!(result, Err(SyncError::Cancelled));
    }
}
