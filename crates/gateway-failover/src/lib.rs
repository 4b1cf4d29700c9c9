//! # Gateway Failover
//!
//! Durable queue overflow for requests that find the admission pool full.
//!
//! The producer side enqueues the request, listens on the request's result
//! channel and turns what workers publish back into an ordered chunk
//! stream. Workers on any instance drain the queue, run the request through
//! the same breaker-guarded dispatcher as the direct path and publish the
//! result in batches.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batcher;
pub mod config;
pub mod consumer;
pub mod message;
pub mod producer;
pub mod worker_pool;

pub use batcher::ChunkBatcher;
pub use config::FailoverConfig;
pub use consumer::{ProcessOutcome, QueueWorker, WorkerStats, WorkerStatsSnapshot};
pub use message::{ChannelMessage, QueuedRequest};
pub use producer::{QueueEvent, QueueEventStream, QueueProducer};
pub use worker_pool::WorkerPool;
