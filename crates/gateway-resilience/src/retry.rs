//! Retry policy with exponential backoff.
//!
//! Only network and timeout class failures are retried; validation and
//! authentication failures return immediately.

use gateway_core::GatewayError;
use rand::Rng;
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Jitter factor (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Backoff used by queue workers between whole-request attempts
    #[must_use]
    pub fn queue_worker() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

/// Retry policy implementation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy with the given configuration
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Total attempts allowed
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Calculate delay after a failed attempt (0-indexed)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as f64;
        let delay = base * self.config.multiplier.powi(attempt.min(31) as i32);
        let delay = delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = delay * self.config.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Check if an error is retryable
    #[must_use]
    pub fn is_retryable(&self, error: &GatewayError) -> bool {
        error.is_retryable()
    }

    /// Whether another attempt may follow a failed `attempt` (0-indexed)
    #[must_use]
    pub fn should_retry(&self, attempt: u32, error: &GatewayError) -> bool {
        attempt + 1 < self.max_attempts() && self.is_retryable(error)
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Builder for retry policy
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set total attempts
    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    /// Set base delay
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set max delay
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    /// Set jitter factor
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Build the policy
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy::new(self.config)
    }
}
