//! # Gateway Orchestrator
//!
//! The per-request pipeline of the streaming gateway and the builder that
//! assembles a node from configuration.
//!
//! ```text
//! validate -> cache lookup -> rate limit -> admit ---------> dispatch -> stream -> cache write -> release
//!                 |                           \-> (pool full) queue producer -> relay worker output
//!                 \-> replay cached response
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod config;
pub mod orchestrator;
pub mod sink;

pub use builder::{Gateway, GatewayBuilder};
pub use config::OrchestratorConfig;
pub use orchestrator::{OrchestratorStats, StreamOrchestrator};
pub use sink::{EventSink, EventStream, KeepAliveTask};
