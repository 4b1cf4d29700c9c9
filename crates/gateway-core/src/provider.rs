//! Backend capability.
//!
//! The gateway never looks at a backend's own request or response shape.
//! Everything it needs is behind [`Provider`].

use crate::error::GatewayError;
use crate::streaming::StreamChunk;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Stream of chunks produced by a backend
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, GatewayError>>;

/// Health reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Operational but slow or partially failing
    Degraded,
    /// Not serving requests
    Down,
}

impl HealthStatus {
    /// Whether the backend should receive traffic
    #[must_use]
    pub fn is_available(self) -> bool {
        !matches!(self, Self::Down)
    }
}

/// A generative-text backend.
///
/// Implementations report failures as [`GatewayError::Backend`] with a
/// [`crate::BackendErrorKind`] so callers can decide whether to retry.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable backend identifier, used for breaker state and logs
    fn id(&self) -> &str;

    /// Whether this backend can serve `model`
    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    /// Open a streamed completion.
    ///
    /// Errors returned here happen before any data; errors yielded by the
    /// stream happen mid-response.
    async fn stream(
        &self,
        query: &str,
        model: &str,
        identity: &str,
    ) -> Result<ChunkStream, GatewayError>;

    /// Probe the backend
    async fn health_check(&self) -> HealthStatus;
}
