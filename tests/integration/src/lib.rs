//! Integration tests for the streaming gateway
//!
//! Each suite assembles full gateways over an in-process store with
//! scripted backends:
//! - Cache-aside serving and writes
//! - Rate limiting, including across instances
//! - Queue failover when the admission pool is full
//! - Circuit breaking and backend failover
//! - Degraded operation while the shared store is unreachable
//! - Properties of keys, counters and event streams

pub mod fixtures;
pub mod helpers;
pub mod mock_providers;

// Re-export commonly used items
pub use fixtures::*;
pub use helpers::*;
pub use mock_providers::*;

#[cfg(test)]
mod breaker_tests;
#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod degraded_store_tests;
#[cfg(test)]
mod failover_tests;
#[cfg(test)]
mod property_tests;
#[cfg(test)]
mod rate_limit_tests;
