//! Distributed admission pool.
//!
//! Limits in-flight requests globally and per identity using two shared
//! counters plus one `active` record per request id. Acquire registers the
//! record with compare-and-set before touching any counter, so a request id
//! is charged at most once across the fleet; a second holder of the same id
//! (a redelivered queue message) rides along uncharged. Counters are then
//! incremented and checked, rolling back on rejection. Release deletes the
//! record only if it still carries the holder's token and decrements only
//! when that delete succeeded.
//!
//! Records expire after the slot TTL. The counters do not, so a reconciler
//! periodically recomputes them from the live records; that is what returns
//! the capacity of a crashed instance.
//!
//! When the shared store cannot be reached the pool admits against
//! process-local counters; each instance then polices its own share.

use gateway_core::GatewayError;
use gateway_store::{KeySpace, SharedStore};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum in-flight requests across all instances
    pub global_capacity: u64,
    /// Maximum in-flight requests per identity
    pub per_identity_capacity: u64,
    /// Lifetime of a request's `active` record
    pub slot_ttl: Duration,
    /// How often the reconciler recomputes the shared counters
    pub reconcile_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            global_capacity: 100,
            per_identity_capacity: 5,
            slot_ttl: Duration::from_secs(600),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global cap
    #[must_use]
    pub fn with_global_capacity(mut self, capacity: u64) -> Self {
        self.global_capacity = capacity;
        self
    }

    /// Set the per-identity cap
    #[must_use]
    pub fn with_per_identity_capacity(mut self, capacity: u64) -> Self {
        self.per_identity_capacity = capacity;
        self
    }

    /// Set the `active` record lifetime
    #[must_use]
    pub fn with_slot_ttl(mut self, ttl: Duration) -> Self {
        self.slot_ttl = ttl;
        self
    }

    /// Set the reconciler period
    #[must_use]
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }
}

/// Pool health derived from global utilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    /// Below 70%
    Healthy,
    /// Below 90%
    Degraded,
    /// Below 100%
    Critical,
    /// Full
    Exhausted,
}

impl PoolHealth {
    /// Health for `active` slots out of `capacity`
    #[must_use]
    pub fn from_utilization(active: u64, capacity: u64) -> Self {
        if capacity == 0 || active >= capacity {
            return Self::Exhausted;
        }
        let ratio = active as f64 / capacity as f64;
        if ratio < 0.7 {
            Self::Healthy
        } else if ratio < 0.9 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }

    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
            Self::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LeaseMode {
    /// Charged to the shared counters; `record` is the value of the `active` key
    Shared { record: String },
    /// The request id was already registered by another holder
    Passenger,
    /// Charged to this process's counters
    Local,
}

#[derive(Debug, Clone)]
struct Lease {
    request_id: String,
    identity: String,
    mode: LeaseMode,
}

#[derive(Debug, Clone)]
struct DeferredRelease {
    request_id: String,
    identity: String,
    record: String,
    active_removed: bool,
}

#[derive(Debug, Default)]
struct LocalState {
    global: u64,
    per_identity: HashMap<String, u64>,
    /// Keyed by slot token
    leases: HashMap<String, Lease>,
    deferred: Vec<DeferredRelease>,
    /// Counter drift seen by the previous reconcile pass
    drift: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    passengers: AtomicU64,
    identity_rejections: AtomicU64,
    global_rejections: AtomicU64,
    local_fallbacks: AtomicU64,
    reconciled: AtomicU64,
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Slots acquired by this instance
    pub acquired: u64,
    /// Slots released by this instance
    pub released: u64,
    /// Acquisitions for a request id someone else already held
    pub passengers: u64,
    /// Rejections for the per-identity cap
    pub identity_rejections: u64,
    /// Rejections for the global cap
    pub global_rejections: u64,
    /// Admissions decided against local counters
    pub local_fallbacks: u64,
    /// Shared counters rewritten by the reconciler
    pub reconciled: u64,
    /// Slots currently held through this instance
    pub held: usize,
    /// Releases waiting for the store to come back
    pub deferred_releases: usize,
}

/// Global and per-identity admission control
pub struct ConnectionPoolManager {
    config: PoolConfig,
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    local: Mutex<LocalState>,
    counters: PoolCounters,
}

impl ConnectionPoolManager {
    /// Create a new pool
    pub fn new(config: PoolConfig, store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        Self {
            config,
            store,
            keys,
            local: Mutex::new(LocalState::default()),
            counters: PoolCounters::default(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a slot for `request_id`
    ///
    /// A request id already registered by another holder is admitted without
    /// being charged again.
    ///
    /// # Errors
    /// - `IdentityAdmissionExceeded` when the identity is at its cap (terminal)
    /// - `ConnectionPoolExhausted` when the global pool is full (failover)
    pub async fn acquire(
        self: &Arc<Self>,
        identity: &str,
        request_id: &str,
    ) -> Result<AdmissionSlot, GatewayError> {
        self.retry_deferred().await;

        let token = Uuid::new_v4().to_string();
        let mode = match self.acquire_shared(identity, request_id, &token).await {
            Ok(Some(mode)) => mode,
            Ok(None) => {
                self.acquire_local(identity)?;
                LeaseMode::Local
            }
            Err(e) => {
                self.record_rejection(&e);
                return Err(e);
            }
        };

        if mode == LeaseMode::Passenger {
            self.counters.passengers.fetch_add(1, Ordering::Relaxed);
        }
        debug!(identity = %identity, request_id = %request_id, mode = ?mode, "Admission slot acquired");
        self.local.lock().leases.insert(
            token.clone(),
            Lease {
                request_id: request_id.to_string(),
                identity: identity.to_string(),
                mode,
            },
        );
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);

        Ok(AdmissionSlot {
            pool: Arc::clone(self),
            token,
            request_id: request_id.to_string(),
            identity: identity.to_string(),
            released: false,
        })
    }

    /// `Ok(None)` means the store is unreachable and the caller should fall
    /// back to local counters
    async fn acquire_shared(
        &self,
        identity: &str,
        request_id: &str,
        token: &str,
    ) -> Result<Option<LeaseMode>, GatewayError> {
        let active_key = self.keys.pool_active(request_id);
        let record = slot_record(token, identity);

        match self
            .store
            .compare_and_set(&active_key, None, &record, Some(self.config.slot_ttl))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(request_id = %request_id, "Request id already holds a slot, admitting uncharged");
                return Ok(Some(LeaseMode::Passenger));
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Shared store unavailable, admitting locally");
                return Ok(None);
            }
        }

        let identity_key = self.keys.pool_identity(identity);
        let global_key = self.keys.pool_global();

        let identity_count = match self.store.incr(&identity_key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Shared store unavailable, admitting locally");
                self.unregister(&active_key, &record).await;
                return Ok(None);
            }
        };
        if identity_count > to_i64(self.config.per_identity_capacity) {
            self.undo_identity(&identity_key).await;
            self.unregister(&active_key, &record).await;
            return Err(GatewayError::IdentityAdmissionExceeded {
                identity: identity.to_string(),
                limit: self.config.per_identity_capacity,
            });
        }

        let global_count = match self.store.incr(&global_key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Shared store unavailable, admitting locally");
                self.undo_identity(&identity_key).await;
                self.unregister(&active_key, &record).await;
                return Ok(None);
            }
        };
        if global_count > to_i64(self.config.global_capacity) {
            self.undo_global(&global_key).await;
            self.undo_identity(&identity_key).await;
            self.unregister(&active_key, &record).await;
            let observed = u64::try_from(global_count - 1).unwrap_or(0);
            return Err(GatewayError::ConnectionPoolExhausted {
                active: observed.min(self.config.global_capacity),
                capacity: self.config.global_capacity,
            });
        }

        Ok(Some(LeaseMode::Shared { record }))
    }

    async fn unregister(&self, active_key: &str, record: &str) {
        if let Err(e) = self.store.compare_and_delete(active_key, record).await {
            warn!(key = %active_key, error = %e, "Failed to remove slot record, leaving it to expire");
        }
    }

    fn acquire_local(&self, identity: &str) -> Result<(), GatewayError> {
        self.counters.local_fallbacks.fetch_add(1, Ordering::Relaxed);
        let mut local = self.local.lock();

        let held = local.per_identity.get(identity).copied().unwrap_or(0);
        if held >= self.config.per_identity_capacity {
            self.counters.identity_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::IdentityAdmissionExceeded {
                identity: identity.to_string(),
                limit: self.config.per_identity_capacity,
            });
        }
        if local.global >= self.config.global_capacity {
            self.counters.global_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::ConnectionPoolExhausted {
                active: local.global,
                capacity: self.config.global_capacity,
            });
        }

        local.global += 1;
        *local.per_identity.entry(identity.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn record_rejection(&self, error: &GatewayError) {
        match error {
            GatewayError::IdentityAdmissionExceeded { .. } => {
                self.counters.identity_rejections.fetch_add(1, Ordering::Relaxed);
            }
            GatewayError::ConnectionPoolExhausted { .. } => {
                self.counters.global_rejections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    async fn undo_identity(&self, identity_key: &str) {
        match self.store.decr(identity_key).await {
            Ok(count) if count <= 0 => {
                let _ = self.store.compare_and_delete(identity_key, "0").await;
                if count < 0 {
                    self.clamp(identity_key).await;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(key = %identity_key, error = %e, "Failed to roll back identity counter"),
        }
    }

    async fn undo_global(&self, global_key: &str) {
        match self.store.decr(global_key).await {
            Ok(count) if count < 0 => self.clamp(global_key).await,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to roll back global counter"),
        }
    }

    async fn clamp(&self, key: &str) {
        debug!(key = %key, "Counter went negative, clamping to zero");
        let _ = self.store.set(key, "0", None).await;
    }

    /// Release the slot identified by `token`; releasing twice is a no-op
    async fn release_lease(&self, token: &str) {
        let Some(lease) = self.local.lock().leases.remove(token) else {
            debug!("Slot already released");
            return;
        };

        let record = match lease.mode {
            LeaseMode::Local => {
                self.release_local(&lease.identity);
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %lease.request_id, "Local admission slot released");
                return;
            }
            LeaseMode::Passenger => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %lease.request_id, "Uncharged admission slot released");
                return;
            }
            LeaseMode::Shared { record } => record,
        };

        let pending = DeferredRelease {
            request_id: lease.request_id,
            identity: lease.identity,
            record,
            active_removed: false,
        };
        match self.release_shared(&pending).await {
            Ok(true) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %pending.request_id, identity = %pending.identity, "Admission slot released");
            }
            Ok(false) => {
                debug!(request_id = %pending.request_id, "Slot record expired before release, leaving counters to the reconciler");
            }
            Err(deferred) => {
                warn!(request_id = %pending.request_id, "Shared store unavailable, deferring release");
                self.local.lock().deferred.push(deferred);
            }
        }
    }

    fn release_local(&self, identity: &str) {
        let mut local = self.local.lock();
        local.global = local.global.saturating_sub(1);
        if let Some(count) = local.per_identity.get_mut(identity) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                local.per_identity.remove(identity);
            }
        }
    }

    /// `Ok(false)` when the record is no longer ours; `Err` carries the work
    /// left to do once the store is reachable again
    async fn release_shared(&self, pending: &DeferredRelease) -> Result<bool, DeferredRelease> {
        if !pending.active_removed {
            match self
                .store
                .compare_and_delete(&self.keys.pool_active(&pending.request_id), &pending.record)
                .await
            {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(_) => return Err(pending.clone()),
            }
        }

        let after_delete = DeferredRelease {
            active_removed: true,
            ..pending.clone()
        };
        let identity_key = self.keys.pool_identity(&pending.identity);
        let global_key = self.keys.pool_global();

        // Global first: a failure here retries both decrements
        match self.store.decr(&global_key).await {
            Ok(count) if count < 0 => self.clamp(&global_key).await,
            Ok(_) => {}
            Err(_) => return Err(after_delete),
        }
        match self.store.decr(&identity_key).await {
            Ok(count) if count <= 0 => {
                let _ = self.store.compare_and_delete(&identity_key, "0").await;
                if count < 0 {
                    self.clamp(&identity_key).await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(identity = %pending.identity, error = %e, "Identity counter not decremented");
            }
        }
        Ok(true)
    }

    /// Retry releases deferred during a store outage
    pub async fn retry_deferred(&self) {
        let deferred = {
            let mut local = self.local.lock();
            if local.deferred.is_empty() {
                return;
            }
            std::mem::take(&mut local.deferred)
        };

        let total = deferred.len();
        let mut still_pending = Vec::new();
        for item in deferred {
            match self.release_shared(&item).await {
                Ok(released) => {
                    if released {
                        self.counters.released.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(item) => still_pending.push(item),
            }
        }

        let remaining = still_pending.len();
        if remaining < total {
            info!(completed = total - remaining, remaining, "Deferred releases applied");
        }
        self.local.lock().deferred.extend(still_pending);
    }

    /// Recompute the shared counters from the live `active` records
    ///
    /// A counter is rewritten only when it disagrees with the records by the
    /// same amount on two consecutive passes, so an acquire or release caught
    /// between its record write and its counter update is left alone. Every
    /// rewrite is a compare-and-set against the value read at the start of
    /// the pass. Returns how many counters were corrected.
    ///
    /// # Errors
    /// Returns `StoreUnavailable` when the store cannot be read or written
    pub async fn reconcile(&self) -> Result<usize, GatewayError> {
        let store_err = |e: gateway_store::StoreError| GatewayError::store_unavailable(e.to_string());
        let global_key = self.keys.pool_global();
        let identity_prefix = self.keys.pool_identity_prefix();

        let global_raw = self.store.get(&global_key).await.map_err(store_err)?;
        let identity_counters = self.store.scan_prefix(&identity_prefix).await.map_err(store_err)?;
        let records = self
            .store
            .scan_prefix(&self.keys.pool_active_prefix())
            .await
            .map_err(store_err)?;

        let mut live: HashMap<String, i64> = HashMap::new();
        for (_, record) in &records {
            if let Some(identity) = record_identity(record) {
                *live.entry(identity.to_string()).or_insert(0) += 1;
            }
        }

        // (counter key, value read, live records, whether zero deletes the key)
        let mut observed: Vec<(String, Option<String>, i64, bool)> =
            vec![(global_key, global_raw, to_i64(records.len() as u64), false)];
        for (key, raw) in identity_counters {
            let identity = key.strip_prefix(&identity_prefix).unwrap_or_default();
            let count = live.remove(identity).unwrap_or(0);
            observed.push((key, Some(raw), count, true));
        }
        for (identity, count) in live {
            observed.push((self.keys.pool_identity(&identity), None, count, true));
        }

        let previous = std::mem::take(&mut self.local.lock().drift);
        let mut drift_now = HashMap::new();
        let mut corrected = 0;
        for (key, raw, count, delete_at_zero) in observed {
            let current = raw.as_deref().and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
            let drift = current - count;
            if drift == 0 {
                continue;
            }
            if previous.get(&key) != Some(&drift) {
                drift_now.insert(key, drift);
                continue;
            }

            let written = match (&raw, delete_at_zero && count == 0) {
                (Some(raw), true) => self.store.compare_and_delete(&key, raw).await,
                (None, true) => Ok(false),
                (raw, false) => {
                    self.store
                        .compare_and_set(&key, raw.as_deref(), &count.to_string(), None)
                        .await
                }
            }
            .map_err(store_err)?;
            if written {
                corrected += 1;
                info!(key = %key, drift, live = count, "Admission counter reconciled");
            }
        }

        self.local.lock().drift = drift_now;
        self.counters
            .reconciled
            .fetch_add(corrected as u64, Ordering::Relaxed);
        Ok(corrected)
    }

    /// Run deferred releases and `reconcile` periodically until cancelled
    pub fn spawn_reconciler(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = pool.config.reconcile_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_ms = period.as_millis() as u64, "Admission reconciler started");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Admission reconciler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        pool.retry_deferred().await;
                        if let Err(e) = pool.reconcile().await {
                            debug!(error = %e, "Admission reconcile skipped");
                        }
                    }
                }
            }
        })
    }

    /// Acquire, retrying with jittered backoff until `max_wait` has passed
    ///
    /// Both cap rejections are waited out; any other error returns at once.
    ///
    /// # Errors
    /// Returns the last rejection when `max_wait` elapses
    pub async fn acquire_with_backoff(
        self: &Arc<Self>,
        identity: &str,
        request_id: &str,
        max_wait: Duration,
    ) -> Result<AdmissionSlot, GatewayError> {
        let deadline = Instant::now() + max_wait;
        let mut delay = Duration::from_millis(50);
        loop {
            match self.acquire(identity, request_id).await {
                Ok(slot) => return Ok(slot),
                Err(
                    e @ (GatewayError::ConnectionPoolExhausted { .. }
                    | GatewayError::IdentityAdmissionExceeded { .. }),
                ) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(e);
                    }
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    let wait = delay.mul_f64(jitter).min(deadline - now);
                    debug!(request_id = %request_id, wait_ms = wait.as_millis() as u64, "Waiting for an admission slot");
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(Duration::from_secs(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Slots in use across the fleet, or locally when the store is down
    pub async fn active_count(&self) -> u64 {
        match self.store.get(&self.keys.pool_global()).await {
            Ok(value) => value
                .and_then(|raw| raw.parse::<i64>().ok())
                .map_or(0, |n| n.max(0) as u64),
            Err(_) => self.local.lock().global,
        }
    }

    /// Health as a function of global utilization
    pub async fn get_health_state(&self) -> PoolHealth {
        PoolHealth::from_utilization(self.active_count().await, self.config.global_capacity)
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let local = self.local.lock();
        PoolStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            passengers: self.counters.passengers.load(Ordering::Relaxed),
            identity_rejections: self.counters.identity_rejections.load(Ordering::Relaxed),
            global_rejections: self.counters.global_rejections.load(Ordering::Relaxed),
            local_fallbacks: self.counters.local_fallbacks.load(Ordering::Relaxed),
            reconciled: self.counters.reconciled.load(Ordering::Relaxed),
            held: local.leases.len(),
            deferred_releases: local.deferred.len(),
        }
    }
}

impl std::fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Value of an `active` record: the holder's token, then the identity
fn slot_record(token: &str, identity: &str) -> String {
    format!("{token}:{identity}")
}

fn record_identity(record: &str) -> Option<&str> {
    record.split_once(':').map(|(_, identity)| identity)
}

/// A held admission slot
///
/// Call [`release`](Self::release) when done. A slot dropped without an
/// explicit release is released on a spawned task, or deferred when no
/// runtime is available.
#[must_use = "dropping the slot releases it"]
pub struct AdmissionSlot {
    pool: Arc<ConnectionPoolManager>,
    token: String,
    request_id: String,
    identity: String,
    released: bool,
}

impl AdmissionSlot {
    /// Request holding the slot
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Identity the slot is charged to
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Release the slot
    pub async fn release(mut self) {
        self.released = true;
        self.pool.release_lease(&self.token).await;
    }
}

impl std::fmt::Debug for AdmissionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionSlot")
            .field("request_id", &self.request_id)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let token = std::mem::take(&mut self.token);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            debug!(request_id = %self.request_id, "Admission slot dropped, releasing");
            handle.spawn(async move {
                pool.release_lease(&token).await;
            });
            return;
        }

        let Some(lease) = pool.local.lock().leases.remove(&token) else {
            return;
        };
        match lease.mode {
            LeaseMode::Local => pool.release_local(&lease.identity),
            LeaseMode::Passenger => {}
            LeaseMode::Shared { record } => pool.local.lock().deferred.push(DeferredRelease {
                request_id: lease.request_id,
                identity: lease.identity,
                record,
                active_removed: false,
            }),
        }
    }
}
