//! # Gateway Core
//!
//! Core types, traits, and error handling for the streaming gateway.
//!
//! This crate provides the foundational types used throughout the gateway:
//! - The stream request and its validation rules
//! - Stream chunks and the client-facing event schema
//! - The `Provider` capability every backend implements
//! - The error taxonomy and its stable client-facing kinds

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod provider;
pub mod request;
pub mod streaming;
pub mod types;

// Re-export commonly used types
pub use error::{BackendErrorKind, ErrorKind, GatewayError, GatewayResult, TimeoutStage};
pub use provider::{ChunkStream, HealthStatus, Provider};
pub use request::{StreamRequest, StreamRequestBuilder};
pub use streaming::{ErrorPayload, FinishReason, ResponseSource, StreamChunk, StreamEvent};
pub use types::{IdentityTier, RequestId};
