//! Two-tier response cache.
//!
//! Cache-aside with warming: reads check the process-local LRU tier, then the
//! shared tier; a shared hit is copied into the local tier before it is
//! returned. Writes go to both tiers, the shared write in the background.
//! The shared tier is never required: any store error is a logged miss.

use crate::lru::LruMap;
use chrono::{DateTime, TimeZone, Utc};
use gateway_core::StreamRequest;
use gateway_store::{KeySpace, SharedStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether the cache is consulted at all
    pub enabled: bool,
    /// Local tier capacity in entries
    pub local_capacity: usize,
    /// Upper bound on local entry lifetime
    pub local_ttl: Duration,
    /// TTL applied when `set` is not given one
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_capacity: 1000,
            local_ttl: Duration::from_secs(300),
            default_ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable caching
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the local tier capacity
    #[must_use]
    pub fn with_local_capacity(mut self, capacity: usize) -> Self {
        self.local_capacity = capacity;
        self
    }

    /// Set the local entry lifetime bound
    #[must_use]
    pub fn with_local_ttl(mut self, ttl: Duration) -> Self {
        self.local_ttl = ttl;
        self
    }

    /// Set the default response TTL
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

/// Which tier served an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// Process-local LRU
    Local,
    /// Shared store
    Shared,
}

/// A cached response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Cache key
    pub key: String,
    /// Assembled response text
    pub value: String,
    /// Tier the entry was read from
    pub tier: CacheTier,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
}

/// Shared tier record; carries its own expiry so local copies never outlive it
#[derive(Debug, Serialize, Deserialize)]
struct SharedRecord {
    value: String,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    writes: AtomicU64,
    store_errors: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Hits served by the local tier
    pub local_hits: u64,
    /// Hits served by the shared tier
    pub shared_hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Shared hits copied into the local tier
    pub promotions: u64,
    /// Entries written
    pub writes: u64,
    /// Shared tier errors absorbed
    pub store_errors: u64,
    /// Entries in the local tier
    pub local_entries: usize,
    /// Local entries evicted for capacity
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate as a percentage
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.shared_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

/// Two-tier cache manager
pub struct CacheManager {
    config: CacheConfig,
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    local: Mutex<LruMap<(String, i64)>>,
    counters: Arc<CacheCounters>,
}

impl CacheManager {
    /// Create a cache manager over a shared store
    pub fn new(config: CacheConfig, store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        let local = Mutex::new(LruMap::new(config.local_capacity));
        Self {
            config,
            store,
            keys,
            local,
            counters: Arc::new(CacheCounters::default()),
        }
    }

    /// Whether the cache is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Stable key for an ordered tuple of normalized request fields.
    ///
    /// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
    #[must_use]
    pub fn generate_key(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Key for a request's normalized query, model and sampling parameters
    #[must_use]
    pub fn request_key(request: &StreamRequest) -> String {
        let parts = request.cache_key_parts();
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        Self::generate_key(&parts)
    }

    /// Read a value
    pub async fn get(&self, key: &str) -> Option<String> {
        self.lookup(key).await.map(|entry| entry.value)
    }

    /// Read an entry, reporting which tier served it
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        if !self.config.enabled {
            return None;
        }

        let local = self.local.lock().get(key, Instant::now());
        if let Some((value, expires_at_ms)) = local {
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Local cache hit");
            return Some(self.entry(key, value, CacheTier::Local, expires_at_ms));
        }

        let raw = match self.store.get(&self.keys.cache(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Shared cache tier unavailable, treating as miss");
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let record: SharedRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable shared cache entry, treating as miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let remaining_ms = record.expires_at_ms - Utc::now().timestamp_millis();
        if remaining_ms <= 0 {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.insert_local(
            key,
            &record.value,
            record.expires_at_ms,
            Duration::from_millis(remaining_ms as u64),
        );
        self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
        self.counters.promotions.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Shared cache hit, warmed local tier");

        Some(self.entry(key, record.value, CacheTier::Shared, record.expires_at_ms))
    }

    /// Write both tiers; the shared write runs in the background
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let Some((json, ttl)) = self.prepare_write(key, value, ttl) else {
            return;
        };

        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let shared_key = self.keys.cache(key);
        tokio::spawn(async move {
            if let Err(e) = store.set(&shared_key, &json, Some(ttl)).await {
                warn!(key = %shared_key, error = %e, "Shared cache write failed");
                counters.store_errors.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    /// Write both tiers and wait for the shared write; returns whether it succeeded
    pub async fn set_synced(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let Some((json, ttl)) = self.prepare_write(key, value, ttl) else {
            return false;
        };

        match self.store.set(&self.keys.cache(key), &json, Some(ttl)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "Shared cache write failed");
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Remove an entry from both tiers
    pub async fn invalidate(&self, key: &str) {
        self.local.lock().remove(key);
        if let Err(e) = self.store.delete(&self.keys.cache(key)).await {
            warn!(key = %key, error = %e, "Shared cache invalidation failed");
            self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every local entry
    pub fn clear_local(&self) {
        self.local.lock().clear();
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (local_entries, evictions) = {
            let local = self.local.lock();
            (local.len(), local.evictions())
        };
        CacheStats {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
            local_entries,
            evictions,
        }
    }

    /// Write the local tier and build the shared record
    fn prepare_write(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Option<(String, Duration)> {
        if !self.config.enabled {
            return None;
        }

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let expires_at_ms = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        self.insert_local(key, value, expires_at_ms, ttl);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        let record = SharedRecord {
            value: value.to_string(),
            expires_at_ms,
        };
        match serde_json::to_string(&record) {
            Ok(json) => Some((json, ttl)),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode cache entry");
                None
            }
        }
    }

    fn insert_local(&self, key: &str, value: &str, expires_at_ms: i64, ttl: Duration) {
        let ttl = ttl.min(self.config.local_ttl);
        self.local.lock().insert(
            key,
            (value.to_string(), expires_at_ms),
            Instant::now() + ttl,
        );
    }

    fn entry(&self, key: &str, value: String, tier: CacheTier, expires_at_ms: i64) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            value,
            tier,
            expires_at: Utc
                .timestamp_millis_opt(expires_at_ms)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_store::{MemoryStore, SwitchableStore};
    use proptest::prelude::*;

    fn manager(store: Arc<dyn SharedStore>) -> CacheManager {
        CacheManager::new(CacheConfig::default(), store, KeySpace::new("test"))
    }

    #[tokio::test]
    async fn test_set_then_get_local() {
        let cache = manager(Arc::new(MemoryStore::new()));
        cache.set_synced("k", "response", None).await;

        let entry = cache.lookup("k").await.expect("hit");
        assert_eq!(entry.value, "response");
        assert_eq!(entry.tier, CacheTier::Local);
        assert_eq!(cache.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn test_shared_hit_warms_local_tier() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let writer = manager(Arc::clone(&store));
        let reader = manager(store);

        assert!(writer.set_synced("k", "from another instance", None).await);

        let first = reader.lookup("k").await.expect("shared hit");
        assert_eq!(first.tier, CacheTier::Shared);
        let second = reader.lookup("k").await.expect("local hit");
        assert_eq!(second.tier, CacheTier::Local);
        assert_eq!(second.value, "from another instance");

        let stats = reader.stats();
        assert_eq!(stats.shared_hits, 1);
        assert_eq!(stats.promotions, 1);
        assert_eq!(stats.local_hits, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss() {
        let cache = manager(Arc::new(MemoryStore::new()));
        cache
            .set_synced("k", "short lived", Some(Duration::from_millis(30)))
            .await;
        assert!(cache.get("k").await.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_store_outage_is_a_miss_not_an_error() {
        let switchable = Arc::new(SwitchableStore::new(Arc::new(MemoryStore::new())));
        let cache = manager(Arc::clone(&switchable) as Arc<dyn SharedStore>);

        switchable.set_available(false);
        assert!(cache.get("missing").await.is_none());
        assert!(!cache.set_synced("k", "v", None).await);

        // The local tier still serves
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.stats().store_errors, 2);
    }

    #[tokio::test]
    async fn test_fire_and_forget_reaches_shared_tier() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager(Arc::clone(&store) as Arc<dyn SharedStore>);
        cache.set("k", "v", None).await;

        for _ in 0..50 {
            if store.get("test:cache:k").await.expect("get").is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("background shared write never landed");
    }

    #[tokio::test]
    async fn test_invalidate_removes_both_tiers() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let cache = manager(Arc::clone(&store));
        cache.set_synced("k", "v", None).await;
        cache.invalidate("k").await;
        assert!(cache.get("k").await.is_none());
        assert!(store.get("test:cache:k").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let cache = CacheManager::new(
            CacheConfig::new().with_enabled(false),
            Arc::new(MemoryStore::new()),
            KeySpace::default(),
        );
        cache.set("k", "v", None).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_local_tier_capacity() {
        let cache = CacheManager::new(
            CacheConfig::new().with_local_capacity(2),
            Arc::new(MemoryStore::new()),
            KeySpace::default(),
        );
        for key in ["a", "b", "c"] {
            cache.set_synced(key, key, None).await;
        }
        let stats = cache.stats();
        assert_eq!(stats.local_entries, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_generate_key_is_length_prefixed() {
        assert_ne!(
            CacheManager::generate_key(&["ab", "c"]),
            CacheManager::generate_key(&["a", "bc"])
        );
        assert_eq!(CacheManager::generate_key(&["x"]).len(), 64);
    }

    #[test]
    fn test_request_key_ignores_whitespace_and_model_case() {
        let a = StreamRequest::builder()
            .identity("u1")
            .query("hello   world")
            .model("Model-A")
            .build()
            .expect("request");
        let b = StreamRequest::builder()
            .identity("u2")
            .query(" hello world ")
            .model("model-a")
            .build()
            .expect("request");
        let c = StreamRequest::builder()
            .identity("u1")
            .query("hello world")
            .model("model-a")
            .temperature(0.5)
            .build()
            .expect("request");

        assert_eq!(CacheManager::request_key(&a), CacheManager::request_key(&b));
        assert_ne!(CacheManager::request_key(&a), CacheManager::request_key(&c));
    }

    proptest! {
        #[test]
        fn prop_generate_key_is_pure(parts in proptest::collection::vec(".*", 0..6)) {
            let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
            prop_assert_eq!(CacheManager::generate_key(&refs), CacheManager::generate_key(&refs));
        }

        #[test]
        fn prop_distinct_inputs_distinct_keys(a in ".{0,40}", b in ".{0,40}") {
            prop_assume!(a != b);
            prop_assert_ne!(
                CacheManager::generate_key(&[a.as_str(), "model"]),
                CacheManager::generate_key(&[b.as_str(), "model"])
            );
        }
    }
}
