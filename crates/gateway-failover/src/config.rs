//! Failover configuration.

use gateway_resilience::RetryConfig;
use std::time::Duration;

/// Queue failover configuration shared by producer and workers
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Queue name (prefixed by the key space)
    pub queue_name: String,
    /// Worker tasks per instance
    pub workers: usize,
    /// Messages read per poll
    pub read_batch: usize,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// How long a read message stays invisible before redelivery
    pub visibility_timeout: Duration,
    /// Chunks per published batch
    pub chunk_batch_size: usize,
    /// Maximum time a chunk waits for its batch to fill
    pub chunk_flush_interval: Duration,
    /// Backoff between whole-request attempts by a worker
    pub retry: RetryConfig,
    /// How long a worker waits for an admission slot
    pub admission_wait: Duration,
    /// Deliveries after which a message is failed without processing
    pub max_deliveries: u32,
    /// Interval between worker heartbeats on the result channel
    pub heartbeat_interval: Duration,
    /// How long the producer waits without hearing from a worker
    pub queue_wait: Duration,
    /// Idle period after which the producer emits a keep-alive
    pub keepalive: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            queue_name: "requests".to_string(),
            workers: 4,
            read_batch: 4,
            poll_interval: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(330),
            chunk_batch_size: 5,
            chunk_flush_interval: Duration::from_millis(50),
            retry: RetryConfig::queue_worker(),
            admission_wait: Duration::from_secs(30),
            max_deliveries: 5,
            heartbeat_interval: Duration::from_secs(5),
            queue_wait: Duration::from_secs(30),
            keepalive: Duration::from_secs(15),
        }
    }
}

impl FailoverConfig {
    /// Create a new configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue name
    #[must_use]
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Set the worker count
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the messages read per poll
    #[must_use]
    pub fn with_read_batch(mut self, batch: usize) -> Self {
        self.read_batch = batch;
        self
    }

    /// Set the empty-queue poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the visibility timeout
    #[must_use]
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set chunk batching
    #[must_use]
    pub fn with_chunk_batching(mut self, size: usize, flush_interval: Duration) -> Self {
        self.chunk_batch_size = size;
        self.chunk_flush_interval = flush_interval;
        self
    }

    /// Set the worker retry backoff
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the admission wait
    #[must_use]
    pub fn with_admission_wait(mut self, wait: Duration) -> Self {
        self.admission_wait = wait;
        self
    }

    /// Set the delivery limit
    #[must_use]
    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max;
        self
    }

    /// Set the heartbeat interval
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the producer's queue wait
    #[must_use]
    pub fn with_queue_wait(mut self, wait: Duration) -> Self {
        self.queue_wait = wait;
        self
    }

    /// Set the producer's keep-alive interval
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }
}
