//! Distributed per-identity rate limiting.
//!
//! Each instance keeps a local window per identity and answers most checks
//! from memory. It reconciles with the shared counter when the last sync is
//! older than `sync_interval`, when the estimated total has reached the
//! high-water mark, or when it holds more unsynced admits than the margin
//! above that mark. Windows are aligned to the epoch
//! (`window_id = now / window`) so every instance addresses the same shared
//! key for the same window.
//!
//! Worst-case overshoot per window: each instance holds at most the margin
//! of admits unseen by the others, i.e. roughly
//! `instances * (1 - high_water_ratio) * limit`. A single instance is exact.

use gateway_core::{GatewayError, IdentityTier};
use gateway_store::{KeySpace, SharedStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Limit for one identity space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Requests admitted per window
    pub limit: u64,
    /// Window length
    pub window: Duration,
}

impl RateLimit {
    /// Create a limit
    #[must_use]
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Whether limits are enforced
    pub enabled: bool,
    /// Maximum time between reconciliations
    pub sync_interval: Duration,
    /// Fraction of the limit at which every check reconciles
    pub high_water_ratio: f64,
    /// Idle windows older than this are purged
    pub idle_eviction: Duration,
    /// How often the janitor runs
    pub janitor_interval: Duration,
    /// Authenticated tier limit
    pub authenticated: RateLimit,
    /// Anonymous tier limit
    pub anonymous: RateLimit,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval: Duration::from_secs(1),
            high_water_ratio: 0.8,
            idle_eviction: Duration::from_secs(300),
            janitor_interval: Duration::from_secs(60),
            authenticated: RateLimit::new(60, Duration::from_secs(60)),
            anonymous: RateLimit::new(10, Duration::from_secs(60)),
        }
    }
}

impl RateLimiterConfig {
    /// Limit configured for a tier
    #[must_use]
    pub fn limit_for(&self, tier: IdentityTier) -> RateLimit {
        match tier {
            IdentityTier::Authenticated => self.authenticated,
            IdentityTier::Anonymous => self.anonymous,
        }
    }

    /// Set the authenticated tier limit
    #[must_use]
    pub fn with_authenticated(mut self, limit: RateLimit) -> Self {
        self.authenticated = limit;
        self
    }

    /// Set the anonymous tier limit
    #[must_use]
    pub fn with_anonymous(mut self, limit: RateLimit) -> Self {
        self.anonymous = limit;
        self
    }

    /// Set the sync interval
    #[must_use]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Best-effort remaining requests in the window
    pub remaining: u64,
    /// Limit that was applied
    pub limit: u64,
    /// Time until the window ends
    pub retry_after: Duration,
}

impl RateDecision {
    /// Convert a rejection into a gateway error
    ///
    /// # Errors
    /// Returns `RateLimitExceeded` when the request was not admitted
    pub fn into_result(self, identity: &str) -> Result<Self, GatewayError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(GatewayError::RateLimitExceeded {
                identity: identity.to_string(),
                limit: self.limit,
                retry_after: self.retry_after,
            })
        }
    }
}

#[derive(Debug)]
struct RateWindow {
    window_id: u64,
    local_count: u64,
    shared_count_at_last_sync: u64,
    last_sync: Option<Instant>,
    sync_in_flight: bool,
    last_seen: Instant,
}

impl RateWindow {
    fn new(window_id: u64) -> Self {
        Self {
            window_id,
            local_count: 0,
            shared_count_at_last_sync: 0,
            last_sync: None,
            sync_in_flight: false,
            last_seen: Instant::now(),
        }
    }

    fn estimated_total(&self) -> u64 {
        self.shared_count_at_last_sync + self.local_count
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, Default)]
pub struct RateLimiterStats {
    /// Requests admitted
    pub allowed: u64,
    /// Requests rejected
    pub rejected: u64,
    /// Reconciliations with the shared counter
    pub syncs: u64,
    /// Reconciliations that failed and fell back to local-only enforcement
    pub sync_failures: u64,
    /// Windows currently tracked
    pub tracked_windows: usize,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    rejected: AtomicU64,
    syncs: AtomicU64,
    sync_failures: AtomicU64,
}

/// Distributed rate limiter
pub struct RateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    windows: Mutex<HashMap<(IdentityTier, String), RateWindow>>,
    counters: Counters,
}

impl RateLimiter {
    /// Create a rate limiter
    pub fn new(config: RateLimiterConfig, store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        Self {
            config,
            store,
            keys,
            windows: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Check and consume one request using the tier's configured limit
    pub async fn check_tier(&self, tier: IdentityTier, identity: &str) -> RateDecision {
        let limit = self.config.limit_for(tier);
        self.consume(tier, identity, limit).await
    }

    /// Check and consume one request against an explicit limit
    pub async fn check_and_consume(
        &self,
        identity: &str,
        limit: u64,
        window: Duration,
    ) -> RateDecision {
        self.consume(IdentityTier::Authenticated, identity, RateLimit::new(limit, window))
            .await
    }

    async fn consume(&self, tier: IdentityTier, identity: &str, limit: RateLimit) -> RateDecision {
        let window_ms = (limit.window.as_millis() as u64).max(1);
        let now_ms = epoch_ms();
        let window_id = now_ms / window_ms;
        let retry_after = Duration::from_millis((window_id + 1) * window_ms - now_ms);

        if !self.config.enabled {
            return RateDecision {
                allowed: true,
                remaining: limit.limit,
                limit: limit.limit,
                retry_after,
            };
        }

        let map_key = (tier, identity.to_string());
        let high_water = ((limit.limit as f64) * self.config.high_water_ratio).ceil() as u64;
        // Unsynced admits an instance may hold before it must push them
        let margin = limit.limit.saturating_sub(high_water).max(1);

        // Decide under the lock whether this call reconciles; never await while holding it
        let pending = {
            let mut windows = self.windows.lock();
            let window = windows
                .entry(map_key.clone())
                .or_insert_with(|| RateWindow::new(window_id));
            if window.window_id != window_id {
                *window = RateWindow::new(window_id);
            }
            window.last_seen = Instant::now();

            let due = window
                .last_sync
                .map_or(true, |at| at.elapsed() >= self.config.sync_interval);
            let near_limit = window.estimated_total() >= high_water;
            let unsynced = window.local_count >= margin;

            if !window.sync_in_flight && (due || near_limit || unsynced) {
                window.sync_in_flight = true;
                Some(window.local_count)
            } else {
                None
            }
        };

        if let Some(pending) = pending {
            self.sync(&map_key, tier, identity, window_id, pending, limit.window)
                .await;
        }

        let mut windows = self.windows.lock();
        let window = windows
            .entry(map_key)
            .or_insert_with(|| RateWindow::new(window_id));
        if window.window_id != window_id {
            *window = RateWindow::new(window_id);
        }

        let total = window.estimated_total();
        if total >= limit.limit {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                identity = %identity,
                tier = %tier,
                total,
                limit = limit.limit,
                "Rate limit exceeded"
            );
            return RateDecision {
                allowed: false,
                remaining: 0,
                limit: limit.limit,
                retry_after,
            };
        }

        window.local_count += 1;
        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        RateDecision {
            allowed: true,
            remaining: limit.limit.saturating_sub(total + 1),
            limit: limit.limit,
            retry_after,
        }
    }

    /// Push `pending` local admits and learn the shared total in one atomic step
    async fn sync(
        &self,
        map_key: &(IdentityTier, String),
        tier: IdentityTier,
        identity: &str,
        window_id: u64,
        pending: u64,
        window: Duration,
    ) {
        let key = self.keys.rate(tier.as_str(), identity, window_id);
        let result = self
            .store
            .incr_by(&key, pending as i64, Some(window * 2))
            .await;

        let mut windows = self.windows.lock();
        let Some(state) = windows.get_mut(map_key) else {
            return;
        };
        state.sync_in_flight = false;
        state.last_sync = Some(Instant::now());

        if state.window_id != window_id {
            // Window rolled over while the sync was in flight
            return;
        }

        match result {
            Ok(shared) => {
                self.counters.syncs.fetch_add(1, Ordering::Relaxed);
                state.shared_count_at_last_sync = shared.max(0) as u64;
                state.local_count = state.local_count.saturating_sub(pending);
            }
            Err(e) => {
                self.counters.sync_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    identity = %identity,
                    error = %e,
                    "Rate limit sync failed, enforcing locally"
                );
            }
        }
    }

    /// Drop windows idle for longer than `idle_eviction`; returns how many were removed
    pub fn purge_idle(&self) -> usize {
        let idle = self.config.idle_eviction;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| w.sync_in_flight || w.last_seen.elapsed() < idle);
        before - windows.len()
    }

    /// Run `purge_idle` periodically until cancelled
    pub fn spawn_janitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.config.janitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                interval_secs = limiter.config.janitor_interval.as_secs(),
                "Rate limit janitor started"
            );

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Rate limit janitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = limiter.purge_idle();
                        if purged > 0 {
                            debug!(purged, "Purged idle rate windows");
                        }
                    }
                }
            }
        })
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            syncs: self.counters.syncs.load(Ordering::Relaxed),
            sync_failures: self.counters.sync_failures.load(Ordering::Relaxed),
            tracked_windows: self.windows.lock().len(),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn epoch_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
