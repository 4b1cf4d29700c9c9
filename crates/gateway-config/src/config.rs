//! Configuration schema.
//!
//! Every section is optional in the file; missing fields take the defaults
//! below. Durations are written in humantime form (`"30s"`, `"150ms"`).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use validator::Validate;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GatewayConfig {
    /// Instance identity and key namespace
    #[serde(default)]
    #[validate(nested)]
    pub node: NodeConfig,

    /// Response cache
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheSettings,

    /// Per-identity rate limiting
    #[serde(default)]
    #[validate(nested)]
    pub rate_limit: RateLimitSettings,

    /// Admission pool
    #[serde(default)]
    #[validate(nested)]
    pub pool: PoolSettings,

    /// Per-backend circuit breakers
    #[serde(default)]
    #[validate(nested)]
    pub breaker: BreakerSettings,

    /// Backend call retries
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,

    /// Queue failover
    #[serde(default)]
    #[validate(nested)]
    pub queue: QueueSettings,

    /// Request timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Registered backends
    #[serde(default = "default_providers")]
    #[validate(nested)]
    pub providers: Vec<ProviderSettings>,

    /// Logging
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            cache: CacheSettings::default(),
            rate_limit: RateLimitSettings::default(),
            pool: PoolSettings::default(),
            breaker: BreakerSettings::default(),
            retry: RetrySettings::default(),
            queue: QueueSettings::default(),
            timeouts: TimeoutSettings::default(),
            providers: default_providers(),
            logging: LoggingSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Validate field ranges and cross-field constraints
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first problem found
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.providers.iter().all(|p| !p.enabled) {
            return Err(ConfigError::Invalid(
                "at least one enabled provider is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
        }

        if self.pool.per_identity_capacity > self.pool.global_capacity {
            return Err(ConfigError::Invalid(format!(
                "pool.per_identity_capacity ({}) exceeds pool.global_capacity ({})",
                self.pool.per_identity_capacity, self.pool.global_capacity
            )));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(
                "retry.base_delay must not exceed retry.max_delay".to_string(),
            ));
        }

        if self.queue.backoff_base > self.queue.backoff_max {
            return Err(ConfigError::Invalid(
                "queue.backoff_base must not exceed queue.backoff_max".to_string(),
            ));
        }

        let t = &self.timeouts;
        if t.first_chunk.is_zero() || t.total.is_zero() || t.queue_wait.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if t.first_chunk > t.total {
            return Err(ConfigError::Invalid(
                "timeouts.first_chunk must not exceed timeouts.total".to_string(),
            ));
        }

        for tier in [&self.rate_limit.authenticated, &self.rate_limit.anonymous] {
            if tier.window.is_zero() {
                return Err(ConfigError::Invalid(
                    "rate limit windows must be non-zero".to_string(),
                ));
            }
        }

        if self.pool.slot_ttl.is_zero() || self.pool.reconcile_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "pool.slot_ttl and pool.reconcile_interval must be non-zero".to_string(),
            ));
        }

        if self.breaker.recovery_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "breaker.recovery_timeout must be non-zero".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be pretty, compact or json, got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Providers that are switched on, in declaration order
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderSettings> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

/// Instance identity
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
    /// Instance id used in logs; generated at startup when absent
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Prefix for every shared store key
    #[serde(default = "default_key_prefix")]
    #[validate(length(min = 1, max = 64))]
    pub key_prefix: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            key_prefix: default_key_prefix(),
        }
    }
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheSettings {
    /// Serve and store responses in the cache
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local tier capacity in entries
    #[serde(default = "default_local_capacity")]
    #[validate(range(min = 1))]
    pub local_capacity: usize,

    /// Upper bound on how long a local entry lives
    #[serde(default = "default_local_ttl", with = "humantime_serde")]
    pub local_ttl: Duration,

    /// Shared tier response TTL
    #[serde(default = "default_response_ttl", with = "humantime_serde")]
    pub response_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            local_capacity: default_local_capacity(),
            local_ttl: default_local_ttl(),
            response_ttl: default_response_ttl(),
        }
    }
}

/// Limit for one identity tier
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TierLimit {
    /// Requests admitted per window
    #[validate(range(min = 1))]
    pub limit: u64,

    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// Rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RateLimitSettings {
    /// Enforce rate limits
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum time between reconciliations with the shared counter
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_interval: Duration,

    /// Fraction of the limit at which every request reconciles
    #[serde(default = "default_high_water_ratio")]
    #[validate(range(min = 0.01, max = 1.0))]
    pub high_water_ratio: f64,

    /// Local windows idle this long are dropped
    #[serde(default = "default_idle_eviction", with = "humantime_serde")]
    pub idle_eviction: Duration,

    /// Authenticated tier
    #[serde(default = "default_authenticated_tier")]
    #[validate(nested)]
    pub authenticated: TierLimit,

    /// Anonymous tier
    #[serde(default = "default_anonymous_tier")]
    #[validate(nested)]
    pub anonymous: TierLimit,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval: default_sync_interval(),
            high_water_ratio: default_high_water_ratio(),
            idle_eviction: default_idle_eviction(),
            authenticated: default_authenticated_tier(),
            anonymous: default_anonymous_tier(),
        }
    }
}

/// Admission pool settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PoolSettings {
    /// Concurrent requests across all instances
    #[serde(default = "default_global_capacity")]
    #[validate(range(min = 1))]
    pub global_capacity: u64,

    /// Concurrent requests per identity
    #[serde(default = "default_per_identity_capacity")]
    #[validate(range(min = 1))]
    pub per_identity_capacity: u64,

    /// Registered request ids expire after this long
    #[serde(default = "default_slot_ttl", with = "humantime_serde")]
    pub slot_ttl: Duration,

    /// How often shared admission counters are recomputed from live slots
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            global_capacity: default_global_capacity(),
            per_identity_capacity: default_per_identity_capacity(),
            slot_ttl: default_slot_ttl(),
            reconcile_interval: default_reconcile_interval(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BreakerSettings {
    /// Consecutive failures that open a breaker
    #[serde(default = "default_failure_threshold")]
    #[validate(range(min = 1))]
    pub failure_threshold: u32,

    /// Time an open breaker rejects calls before allowing a probe
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Failure counters reset after this long without a new failure
    #[serde(default = "default_failure_ttl", with = "humantime_serde")]
    pub failure_ttl: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            failure_ttl: default_failure_ttl(),
        }
    }
}

/// Backend retry settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetrySettings {
    /// Attempts per backend, including the first
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_retry_base", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Delay cap
    #[serde(default = "default_retry_max", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Jitter as a fraction of the delay
    #[serde(default = "default_jitter")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_retry_base(),
            max_delay: default_retry_max(),
            jitter: default_jitter(),
        }
    }
}

/// Queue failover settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QueueSettings {
    /// Divert pool-exhausted requests to the queue instead of rejecting them
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Queue name
    #[serde(default = "default_queue_name")]
    #[validate(length(min = 1))]
    pub name: String,

    /// Consumer workers started by this instance
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Messages read per poll
    #[serde(default = "default_read_batch")]
    #[validate(range(min = 1))]
    pub read_batch: usize,

    /// Sleep between polls of an empty queue
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long a read message stays hidden from other workers
    #[serde(default = "default_visibility_timeout", with = "humantime_serde")]
    pub visibility_timeout: Duration,

    /// Chunks per published batch
    #[serde(default = "default_chunk_batch_size")]
    #[validate(range(min = 1))]
    pub chunk_batch_size: usize,

    /// Maximum time a partial batch waits before it is published
    #[serde(default = "default_chunk_flush_interval", with = "humantime_serde")]
    pub chunk_flush_interval: Duration,

    /// Worker retry backoff base
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Worker retry backoff cap
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Worker attempts per message
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// How long a worker waits for an admission slot
    #[serde(default = "default_admission_wait", with = "humantime_serde")]
    pub admission_wait: Duration,

    /// Deliveries after which a message is failed instead of processed
    #[serde(default = "default_max_deliveries")]
    #[validate(range(min = 1))]
    pub max_deliveries: u32,

    /// Interval between worker heartbeats on the result channel
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_queue_name(),
            workers: default_workers(),
            read_batch: default_read_batch(),
            poll_interval: default_poll_interval(),
            visibility_timeout: default_visibility_timeout(),
            chunk_batch_size: default_chunk_batch_size(),
            chunk_flush_interval: default_chunk_flush_interval(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            max_attempts: default_max_attempts(),
            admission_wait: default_admission_wait(),
            max_deliveries: default_max_deliveries(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

/// Request timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Bound on the wait for a backend's first chunk
    #[serde(default = "default_first_chunk", with = "humantime_serde")]
    pub first_chunk: Duration,

    /// Bound on a whole request
    #[serde(default = "default_total", with = "humantime_serde")]
    pub total: Duration,

    /// Bound on queue inactivity
    #[serde(default = "default_queue_wait", with = "humantime_serde")]
    pub queue_wait: Duration,

    /// Idle time before a keep-alive event is sent
    #[serde(default = "default_keepalive", with = "humantime_serde")]
    pub keepalive: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            first_chunk: default_first_chunk(),
            total: default_total(),
            queue_wait: default_queue_wait(),
            keepalive: default_keepalive(),
        }
    }
}

/// Backend implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Built-in generator for local runs and load tests
    Synthetic,
}

/// A registered backend
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProviderSettings {
    /// Unique backend id
    #[validate(length(min = 1, max = 64))]
    pub id: String,

    /// Implementation
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    /// Lower values are tried first
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Whether the backend is registered at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Models this backend serves; empty means any
    #[serde(default)]
    pub models: Vec<String>,

    /// Settings for the synthetic backend
    #[serde(default)]
    #[validate(nested)]
    pub synthetic: SyntheticSettings,
}

impl ProviderSettings {
    /// Synthetic backend with default settings
    pub fn synthetic(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            kind: ProviderKind::Synthetic,
            priority,
            enabled: true,
            models: Vec::new(),
            synthetic: SyntheticSettings::default(),
        }
    }
}

/// Synthetic backend behaviour
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SyntheticSettings {
    /// Delay between chunks
    #[serde(default = "default_chunk_delay", with = "humantime_serde")]
    pub chunk_delay: Duration,

    /// Words per chunk
    #[serde(default = "default_words_per_chunk")]
    #[validate(range(min = 1))]
    pub words_per_chunk: usize,

    /// Probability that opening a stream fails with a network error
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub failure_rate: f64,
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            chunk_delay: default_chunk_delay(),
            words_per_chunk: default_words_per_chunk(),
            failure_rate: 0.0,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default level filter; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    "stream-gateway".to_string()
}

fn default_local_capacity() -> usize {
    1000
}

fn default_local_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_response_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_high_water_ratio() -> f64 {
    0.8
}

fn default_idle_eviction() -> Duration {
    Duration::from_secs(300)
}

fn default_authenticated_tier() -> TierLimit {
    TierLimit {
        limit: 60,
        window: Duration::from_secs(60),
    }
}

fn default_anonymous_tier() -> TierLimit {
    TierLimit {
        limit: 10,
        window: Duration::from_secs(60),
    }
}

fn default_global_capacity() -> u64 {
    100
}

fn default_per_identity_capacity() -> u64 {
    5
}

fn default_slot_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_failure_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_max() -> Duration {
    Duration::from_secs(10)
}

fn default_jitter() -> f64 {
    0.25
}

fn default_queue_name() -> String {
    "requests".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_read_batch() -> usize {
    4
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_visibility_timeout() -> Duration {
    Duration::from_secs(330)
}

fn default_chunk_batch_size() -> usize {
    5
}

fn default_chunk_flush_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(100)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(5)
}

fn default_admission_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_first_chunk() -> Duration {
    Duration::from_secs(10)
}

fn default_total() -> Duration {
    Duration::from_secs(300)
}

fn default_queue_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_keepalive() -> Duration {
    Duration::from_secs(15)
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Synthetic
}

fn default_priority() -> u32 {
    100
}

fn default_providers() -> Vec<ProviderSettings> {
    vec![ProviderSettings::synthetic("synthetic", 1)]
}

fn default_chunk_delay() -> Duration {
    Duration::from_millis(20)
}

fn default_words_per_chunk() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
