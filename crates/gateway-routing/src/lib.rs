//! # Gateway Routing
//!
//! Backend selection for the streaming gateway: candidates come from the
//! provider registry in priority order, each call is guarded by the
//! backend's circuit breaker and retried per the retry policy, and failing
//! backends are failed over transparently.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dispatcher;

// Re-export main types
pub use dispatcher::{BackendDispatcher, DispatchedStream};
