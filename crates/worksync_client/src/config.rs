//! Configuration for the sync client.

use rand::Rng;
use std::time::Duration;
use worksync_protocol::{Credentials, DEFAULT_MAX_FRAME_LEN};

/// Configuration for a [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Credentials presented on every (re)authentication.
    pub credentials: Credentials,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Circuit breaker configuration.
    pub breaker: BreakerConfig,
    /// Maximum frame body length.
    pub max_frame_len: usize,
    /// Depth of the outbound frame queue feeding the writer.
    pub outbound_queue_depth: usize,
}

impl ClientConfig {
    /// Creates a configuration for the given credentials.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            outbound_queue_depth: 64,
        }
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit breaker configuration.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Sets the maximum frame length.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Sets the outbound queue depth.
    pub fn with_outbound_queue_depth(mut self, depth: usize) -> Self {
        self.outbound_queue_depth = depth.max(1);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(Credentials::new("anonymous", Vec::new()))
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Delay to wait after `attempt` failed attempts.
    ///
    /// `min(initial_delay * backoff_multiplier^(attempt - 1), max_delay)`;
    /// zero for attempt 0. Jitter never pushes the delay past `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let max_nanos = self.max_delay.as_nanos() as f64;
        let base_nanos = (self.initial_delay.as_nanos() as f64 * factor).min(max_nanos);

        let nanos = if self.add_jitter {
            let jittered = base_nanos * (1.0 + 0.25 * rand::thread_rng().gen::<f64>());
            jittered.min(max_nanos)
        } else {
            base_nanos
        };
        Duration::from_nanos(nanos as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Cooldown before the first half-open trial.
    pub cooldown: Duration,
    /// Cooldown growth after each failed trial.
    pub cooldown_multiplier: f64,
    /// Upper bound for the cooldown.
    pub max_cooldown: Duration,
}

impl BreakerConfig {
    /// Creates a configuration with the given threshold.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown: Duration::from_secs(1),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(60),
        }
    }

    /// Sets the initial cooldown.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the cooldown multiplier.
    pub fn with_cooldown_multiplier(mut self, multiplier: f64) -> Self {
        self.cooldown_multiplier = multiplier;
        self
    }

    /// Sets the maximum cooldown.
    pub fn with_max_cooldown(mut self, max: Duration) -> Self {
        self.max_cooldown = max;
        self
    }

    pub(crate) fn next_cooldown(&self, current: Duration) -> Duration {
        let grown = current.as_secs_f64() * self.cooldown_multiplier.max(1.0);
        Duration::from_secs_f64(grown.min(self.max_cooldown.as_secs_f64()))
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::new(Credentials::new("ada", b"token".to_vec()))
            .with_request_timeout(Duration::from_secs(5))
            .with_outbound_queue_depth(0);

        assert_eq!(config.credentials.subject, "ada");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.outbound_queue_depth, 1);
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(80));
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(true);

        for _ in 0..100 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn jitter_never_exceeds_max_delay() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_jitter(true);

        for _ in 0..200 {
            assert!(config.delay_for_attempt(5) <= Duration::from_millis(100));
            assert!(config.delay_for_attempt(4) >= Duration::from_millis(80));
        }
    }

    #[test]
    fn breaker_cooldown_growth_is_capped() {
        let config = BreakerConfig::new(3)
            .with_cooldown(Duration::from_secs(1))
            .with_max_cooldown(Duration::from_secs(3));

        let second = config.next_cooldown(config.cooldown);
        assert_eq!(second, Duration::from_secs(2));
        assert_eq!(config.next_cooldown(second), Duration::from_secs(3));
    }

    proptest! {
        #[test]
        fn backoff_grows_by_multiplier_until_capped(
            initial_ms in 1u64..500,
            max_ms in 1u64..10_000,
            multiplier in 1.0f64..4.0,
            attempt in 1u32..20,
        ) {
            let config = RetryConfig::new(attempt + 1)
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_max_delay(Duration::from_millis(max_ms))
                .with_backoff_multiplier(multiplier);

            let current = config.delay_for_attempt(attempt);
            let next = config.delay_for_attempt(attempt + 1);
            let max = Duration::from_millis(max_ms);

            prop_assert!(current <= max);
            prop_assert!(next <= max);
            prop_assert!(next >= current);
            if next < max {
                // Nanosecond truncation loses at most a couple of nanoseconds.
                let scaled = current.as_nanos() as f64 * multiplier;
                prop_assert!(next.as_nanos() as f64 + 2.0 >= scaled);
            }
        }
    }
}
