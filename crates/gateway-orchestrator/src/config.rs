//! Orchestrator configuration.

use gateway_resilience::TimeoutConfig;

/// Per-request pipeline configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Events buffered between the pipeline and a slow client
    pub event_buffer: usize,
    /// Divert requests to the queue when the pool is full; otherwise reject
    pub queue_failover: bool,
    /// First-chunk, total, queue-wait and keep-alive bounds
    pub timeouts: TimeoutConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            event_buffer: 64,
            queue_failover: true,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Create a new configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client event buffer
    #[must_use]
    pub fn with_event_buffer(mut self, buffer: usize) -> Self {
        self.event_buffer = buffer;
        self
    }

    /// Enable or disable queue failover
    #[must_use]
    pub fn with_queue_failover(mut self, enabled: bool) -> Self {
        self.queue_failover = enabled;
        self
    }

    /// Set the timeouts
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }
}
