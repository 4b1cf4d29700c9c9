//! Key and channel naming.
//!
//! Every key the gateway writes derives from one prefix so several
//! deployments can share a store without colliding.

/// Default key prefix
pub const DEFAULT_PREFIX: &str = "stream-gateway";

/// Builds namespaced store keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeySpace {
    /// Create a key space with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Shared cache entry
    #[must_use]
    pub fn cache(&self, key: &str) -> String {
        format!("{}:cache:{key}", self.prefix)
    }

    /// Shared rate counter for one identity in one window
    #[must_use]
    pub fn rate(&self, tier: &str, identity: &str, window_id: u64) -> String {
        format!("{}:rate:{tier}:{identity}:{window_id}", self.prefix)
    }

    /// Global admission counter
    #[must_use]
    pub fn pool_global(&self) -> String {
        format!("{}:pool:global", self.prefix)
    }

    /// Per-identity admission counter
    #[must_use]
    pub fn pool_identity(&self, identity: &str) -> String {
        format!("{}:pool:identity:{identity}", self.prefix)
    }

    /// Common prefix of every per-identity admission counter
    #[must_use]
    pub fn pool_identity_prefix(&self) -> String {
        format!("{}:pool:identity:", self.prefix)
    }

    /// Registration of one in-flight request id
    #[must_use]
    pub fn pool_active(&self, request_id: &str) -> String {
        format!("{}:pool:active:{request_id}", self.prefix)
    }

    /// Common prefix of every request id registration
    #[must_use]
    pub fn pool_active_prefix(&self) -> String {
        format!("{}:pool:active:", self.prefix)
    }

    /// Consecutive failure counter of a backend
    #[must_use]
    pub fn breaker_failures(&self, backend: &str) -> String {
        format!("{}:breaker:{backend}:failures", self.prefix)
    }

    /// Open timestamp of a backend's breaker
    #[must_use]
    pub fn breaker_opened_at(&self, backend: &str) -> String {
        format!("{}:breaker:{backend}:opened_at", self.prefix)
    }

    /// Private result channel of a queued request
    #[must_use]
    pub fn result_channel(&self, request_id: &str) -> String {
        format!("{}:results:{request_id}", self.prefix)
    }

    /// Durable request queue
    #[must_use]
    pub fn queue(&self, name: &str) -> String {
        format!("{}:queue:{name}", self.prefix)
    }
}
