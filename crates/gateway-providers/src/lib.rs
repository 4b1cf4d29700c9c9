//! # Gateway Providers
//!
//! Backend registry for the streaming gateway plus a synthetic backend.
//!
//! Backends implement [`gateway_core::Provider`]; the registry maps ids to
//! them, builds factory-registered backends on first use, and lists
//! failover candidates in priority order.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod registry;
pub mod synthetic;

// Re-export main types
pub use registry::{ProviderEntry, ProviderFactory, ProviderRegistry};
pub use synthetic::{SyntheticConfig, SyntheticProvider};
