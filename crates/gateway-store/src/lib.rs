//! # Gateway Store
//!
//! The shared store every gateway instance coordinates through: key-value
//! entries with TTL, atomic counters, compare-and-set, publish/subscribe
//! channels and at-least-once queues.
//!
//! - [`SharedStore`] is the capability components depend on
//! - [`MemoryStore`] is the in-process implementation
//! - [`SwitchableStore`] simulates outages
//! - [`KeySpace`] names every key and channel

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod fault;
pub mod keys;
pub mod memory;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use fault::SwitchableStore;
pub use keys::KeySpace;
pub use memory::MemoryStore;
pub use store::{MessageId, QueueMessage, SharedStore, Subscription};
