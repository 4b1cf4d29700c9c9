//! # Gateway Resilience
//!
//! Distributed resilience primitives for the streaming gateway. All shared
//! state lives in a [`gateway_store::SharedStore`] and every component keeps
//! working, in a degraded form, when that store is unreachable:
//! - Two-tier response cache with local LRU warming
//! - Rate limiter with a local fast path and periodic shared reconciliation
//! - Global and per-identity admission pool with health reporting
//! - Per-backend circuit breakers with a single half-open probe
//! - Retry policy with exponential backoff and jitter
//! - Timeout management

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod circuit_breaker;
pub mod connection_pool;
pub mod lru;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

// Re-export main types
pub use cache::{CacheConfig, CacheEntry, CacheManager, CacheStats, CacheTier};
pub use circuit_breaker::{
    BreakerState, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerStats, CircuitState,
};
pub use connection_pool::{AdmissionSlot, ConnectionPoolManager, PoolConfig, PoolHealth, PoolStats};
pub use rate_limiter::{RateDecision, RateLimit, RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use retry::{RetryConfig, RetryPolicy, RetryPolicyBuilder};
pub use timeout::{TimeoutConfig, TimeoutManager};
