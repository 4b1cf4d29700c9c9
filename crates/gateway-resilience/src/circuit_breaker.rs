//! Per-backend circuit breakers with shared state.
//!
//! Every instance sees the same two records per backend: a consecutive
//! failure counter and, while the breaker is open, the timestamp at which it
//! opened. Half-open is never stored. Once the recovery timeout has elapsed
//! the next caller claims the probe by swapping the open timestamp for the
//! current time with compare-and-set, so one call per recovery window goes
//! through across the whole fleet; its outcome closes the breaker or re-arms
//! the timestamp.
//!
//! A shared store that cannot be reached is treated as closed.

use dashmap::DashMap;
use gateway_core::GatewayError;
use gateway_store::{KeySpace, SharedStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Recovery timeout elapsed, the next caller is the probe
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before letting a probe through
    pub recovery_timeout: Duration,
    /// Idle lifetime of the failure counter
    pub failure_ttl: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            failure_ttl: Duration::from_secs(600),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the recovery timeout
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set the failure counter lifetime
    #[must_use]
    pub fn with_failure_ttl(mut self, ttl: Duration) -> Self {
        self.failure_ttl = ttl;
        self
    }
}

/// Snapshot of one backend's breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    /// Backend identifier
    pub backend_id: String,
    /// Current state
    pub status: CircuitState,
    /// Consecutive failures recorded while closed
    pub consecutive_failures: u64,
    /// When the breaker opened (or was last re-armed), epoch milliseconds
    pub opened_at_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct BreakerCounters {
    allowed: AtomicU64,
    rejected: AtomicU64,
    probes: AtomicU64,
    opened: AtomicU64,
    store_errors: AtomicU64,
}

/// Statistics for one backend as observed by this instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    /// Calls allowed through
    pub allowed: u64,
    /// Calls rejected while open
    pub rejected: u64,
    /// Half-open probes claimed by this instance
    pub probes: u64,
    /// Times this instance opened the breaker
    pub opened: u64,
    /// Store errors absorbed by failing open
    pub store_errors: u64,
}

/// Circuit breakers for every backend, keyed by backend id
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    counters: DashMap<String, BreakerCounters>,
}

impl CircuitBreakerManager {
    /// Create a new manager
    pub fn new(config: CircuitBreakerConfig, store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        Self {
            config,
            store,
            keys,
            counters: DashMap::new(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn bump(&self, backend: &str, pick: impl Fn(&BreakerCounters) -> &AtomicU64) {
        let entry = self.counters.entry(backend.to_string()).or_default();
        pick(entry.value()).fetch_add(1, Ordering::Relaxed);
    }

    /// Whether a call to `backend` may proceed
    ///
    /// When the recovery timeout has elapsed, the caller that wins the
    /// compare-and-set on the open timestamp is the half-open probe and must
    /// report its outcome with [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub async fn should_allow(&self, backend: &str) -> bool {
        let opened_key = self.keys.breaker_opened_at(backend);
        let raw = match self.store.get(&opened_key).await {
            Ok(None) => {
                self.bump(backend, |c| &c.allowed);
                return true;
            }
            Ok(Some(raw)) => raw,
            Err(e) => {
                warn!(backend = %backend, error = %e, "Breaker state unavailable, failing open");
                self.bump(backend, |c| &c.store_errors);
                self.bump(backend, |c| &c.allowed);
                return true;
            }
        };

        let opened_at = raw.parse::<i64>().unwrap_or(0);
        let now = epoch_ms();
        if now.saturating_sub(opened_at) < millis(self.config.recovery_timeout) {
            debug!(backend = %backend, "Circuit open, rejecting");
            self.bump(backend, |c| &c.rejected);
            return false;
        }

        match self
            .store
            .compare_and_set(&opened_key, Some(&raw), &now.to_string(), None)
            .await
        {
            Ok(true) => {
                info!(backend = %backend, "Circuit breaker half-open, probing");
                self.bump(backend, |c| &c.probes);
                self.bump(backend, |c| &c.allowed);
                true
            }
            Ok(false) => {
                debug!(backend = %backend, "Probe already claimed, rejecting");
                self.bump(backend, |c| &c.rejected);
                false
            }
            Err(e) => {
                warn!(backend = %backend, error = %e, "Breaker state unavailable, failing open");
                self.bump(backend, |c| &c.store_errors);
                self.bump(backend, |c| &c.allowed);
                true
            }
        }
    }

    /// Check if `backend` allows requests
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitBreakerOpen` if the circuit is open
    pub async fn check(&self, backend: &str) -> Result<(), GatewayError> {
        if self.should_allow(backend).await {
            Ok(())
        } else {
            Err(GatewayError::circuit_breaker_open(backend))
        }
    }

    /// Record a successful call; closes the breaker
    pub async fn record_success(&self, backend: &str) {
        if let Err(e) = self.store.delete(&self.keys.breaker_failures(backend)).await {
            warn!(backend = %backend, error = %e, "Failed to reset breaker failures");
            self.bump(backend, |c| &c.store_errors);
            return;
        }
        match self.store.delete(&self.keys.breaker_opened_at(backend)).await {
            Ok(true) => info!(backend = %backend, "Circuit breaker closed"),
            Ok(false) => {}
            Err(e) => {
                warn!(backend = %backend, error = %e, "Failed to close breaker");
                self.bump(backend, |c| &c.store_errors);
            }
        }
    }

    /// Record a failed call; opens the breaker at the threshold and re-arms
    /// an open breaker
    pub async fn record_failure(&self, backend: &str) {
        let opened_key = self.keys.breaker_opened_at(backend);
        match self.store.get(&opened_key).await {
            Ok(Some(_)) => {
                // Probe failed: restart the recovery timeout
                match self.store.set(&opened_key, &epoch_ms().to_string(), None).await {
                    Ok(()) => warn!(backend = %backend, "Probe failed, circuit breaker re-opened"),
                    Err(e) => {
                        warn!(backend = %backend, error = %e, "Failed to re-open breaker");
                        self.bump(backend, |c| &c.store_errors);
                    }
                }
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(backend = %backend, error = %e, "Breaker state unavailable, failure not recorded");
                self.bump(backend, |c| &c.store_errors);
                return;
            }
        }

        let failures = match self
            .store
            .incr_by(
                &self.keys.breaker_failures(backend),
                1,
                Some(self.config.failure_ttl),
            )
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(backend = %backend, error = %e, "Failed to record breaker failure");
                self.bump(backend, |c| &c.store_errors);
                return;
            }
        };

        debug!(backend = %backend, failures, "Recorded backend failure");
        if failures < i64::from(self.config.failure_threshold) {
            return;
        }

        match self
            .store
            .compare_and_set(&opened_key, None, &epoch_ms().to_string(), None)
            .await
        {
            Ok(true) => {
                warn!(
                    backend = %backend,
                    failures,
                    recovery_timeout = ?self.config.recovery_timeout,
                    "Circuit breaker opened"
                );
                self.bump(backend, |c| &c.opened);
            }
            // Another caller opened it first
            Ok(false) => {}
            Err(e) => {
                warn!(backend = %backend, error = %e, "Failed to open breaker");
                self.bump(backend, |c| &c.store_errors);
            }
        }
    }

    /// Current state of `backend`; closed when the store cannot be read
    pub async fn get_state(&self, backend: &str) -> BreakerState {
        let closed = BreakerState {
            backend_id: backend.to_string(),
            status: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at_ms: None,
        };

        let opened_at = match self.store.get(&self.keys.breaker_opened_at(backend)).await {
            Ok(value) => value.map(|raw| raw.parse::<i64>().unwrap_or(0)),
            Err(_) => return closed,
        };
        let failures = match self.store.get(&self.keys.breaker_failures(backend)).await {
            Ok(value) => value
                .and_then(|raw| raw.parse::<i64>().ok())
                .map_or(0, |n| n.max(0) as u64),
            Err(_) => return closed,
        };

        let status = match opened_at {
            None => CircuitState::Closed,
            Some(at) if epoch_ms().saturating_sub(at) < millis(self.config.recovery_timeout) => {
                CircuitState::Open
            }
            Some(_) => CircuitState::HalfOpen,
        };

        BreakerState {
            status,
            consecutive_failures: failures,
            opened_at_ms: opened_at,
            ..closed
        }
    }

    /// Reset `backend` to closed
    ///
    /// # Errors
    /// Returns `GatewayError::StoreUnavailable` if the store cannot be reached
    pub async fn reset(&self, backend: &str) -> Result<(), GatewayError> {
        self.store
            .delete(&self.keys.breaker_failures(backend))
            .await
            .map_err(|e| GatewayError::store_unavailable(e.to_string()))?;
        self.store
            .delete(&self.keys.breaker_opened_at(backend))
            .await
            .map_err(|e| GatewayError::store_unavailable(e.to_string()))?;
        info!(backend = %backend, "Circuit breaker reset");
        Ok(())
    }

    /// Force `backend` open (for manual intervention)
    ///
    /// # Errors
    /// Returns `GatewayError::StoreUnavailable` if the store cannot be reached
    pub async fn force_open(&self, backend: &str) -> Result<(), GatewayError> {
        self.store
            .set(
                &self.keys.breaker_opened_at(backend),
                &epoch_ms().to_string(),
                None,
            )
            .await
            .map_err(|e| GatewayError::store_unavailable(e.to_string()))?;
        warn!(backend = %backend, "Circuit breaker forced open");
        Ok(())
    }

    /// Statistics for `backend` as seen by this instance
    #[must_use]
    pub fn stats(&self, backend: &str) -> CircuitBreakerStats {
        self.counters
            .get(backend)
            .map(|c| CircuitBreakerStats {
                allowed: c.allowed.load(Ordering::Relaxed),
                rejected: c.rejected.load(Ordering::Relaxed),
                probes: c.probes.load(Ordering::Relaxed),
                opened: c.opened.load(Ordering::Relaxed),
                store_errors: c.store_errors.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("config", &self.config)
            .field("backends", &self.counters.len())
            .finish_non_exhaustive()
    }
}

fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
