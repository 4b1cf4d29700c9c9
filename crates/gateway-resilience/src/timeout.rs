//! Request timeouts.
//!
//! Three independent bounds: the wait for a backend's first chunk, the whole
//! request, and the time a queued request may go without hearing from a
//! worker. The keep-alive interval lives here as well since it is measured
//! against the same idle periods.

use gateway_core::{GatewayError, TimeoutStage};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Timeout configuration
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Maximum wait for the first chunk of a backend stream
    pub first_chunk: Duration,
    /// Maximum duration of a whole request
    pub total: Duration,
    /// Maximum silence from the queue before a queued request fails
    pub queue_wait: Duration,
    /// Idle period after which a keep-alive is sent
    pub keepalive: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            first_chunk: Duration::from_secs(10),
            total: Duration::from_secs(300),
            queue_wait: Duration::from_secs(30),
            keepalive: Duration::from_secs(15),
        }
    }
}

impl TimeoutConfig {
    /// Create a new configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the first-chunk timeout
    #[must_use]
    pub fn with_first_chunk(mut self, timeout: Duration) -> Self {
        self.first_chunk = timeout;
        self
    }

    /// Set the total request timeout
    #[must_use]
    pub fn with_total(mut self, timeout: Duration) -> Self {
        self.total = timeout;
        self
    }

    /// Set the queue wait timeout
    #[must_use]
    pub fn with_queue_wait(mut self, timeout: Duration) -> Self {
        self.queue_wait = timeout;
        self
    }

    /// Set the keep-alive interval
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }
}

/// Applies the configured bounds to futures
#[derive(Debug, Clone, Default)]
pub struct TimeoutManager {
    config: TimeoutConfig,
}

impl TimeoutManager {
    /// Create a new manager
    #[must_use]
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Deadline for a request started at `started`
    #[must_use]
    pub fn total_deadline(&self, started: Instant) -> Instant {
        started + self.config.total
    }

    /// Run `fut` under the first-chunk bound
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` with stage `FirstChunk` on expiry
    pub async fn first_chunk<F, T>(&self, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.config.first_chunk, fut)
            .await
            .map_err(|_| GatewayError::timeout(TimeoutStage::FirstChunk, self.config.first_chunk))
    }

    /// Run `fut` until `deadline`
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` with stage `Total` on expiry
    pub async fn until<F, T>(&self, deadline: Instant, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| GatewayError::timeout(TimeoutStage::Total, self.config.total))
    }
}
