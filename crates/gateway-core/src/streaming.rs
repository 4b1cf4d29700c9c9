//! Streaming types: backend chunks and the client-facing event schema.

use crate::error::{ErrorKind, GatewayError};
use crate::types::RequestId;
use serde::{Deserialize, Serialize};

/// Why a backend stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the response
    Stop,
    /// Token limit reached
    Length,
    /// Output was filtered
    ContentFilter,
    /// The backend ended the stream because of an error
    Error,
}

/// One piece of a streamed response.
///
/// Sequence indices are assigned by the gateway, contiguous from zero for
/// each request, and delivered to the client in strictly increasing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text content of this chunk
    pub content: String,
    /// Position of this chunk in the response
    pub sequence_index: u64,
    /// Set on the final chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl StreamChunk {
    /// Create a content chunk
    pub fn new(sequence_index: u64, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sequence_index,
            finish_reason: None,
        }
    }

    /// Mark this chunk as the last one
    #[must_use]
    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }

    /// Whether this chunk carries a finish reason
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Where the response is being served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Cache hit, no backend involved
    Cache,
    /// Admitted on this instance and streamed directly
    Direct,
    /// Diverted through the failover queue
    Queued,
}

/// Error body shared by the client event and the queue result channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable error kind
    pub kind: ErrorKind,
    /// Diagnostic-safe message
    pub message: String,
    /// Retry-after hint in milliseconds, for rate limited requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&GatewayError> for ErrorPayload {
    fn from(err: &GatewayError) -> Self {
        Self {
            kind: err.kind(),
            message: err.client_message(),
            retry_after_ms: err.retry_after().map(|d| d.as_millis() as u64),
        }
    }
}

impl From<ErrorPayload> for GatewayError {
    fn from(payload: ErrorPayload) -> Self {
        Self::Relayed {
            kind: payload.kind,
            message: payload.message,
        }
    }
}

/// Event emitted to the client sink.
///
/// Every request produces exactly one terminal event (`Complete` or `Error`)
/// and nothing after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event once a response source is chosen
    Status {
        /// Request identifier
        request_id: RequestId,
        /// Where the response comes from
        source: ResponseSource,
    },
    /// A piece of the response
    Chunk {
        /// Text content
        content: String,
        /// Sequence index
        index: u64,
        /// Set on the final chunk
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
    },
    /// Idle signal that keeps the connection open; carries no data
    KeepAlive,
    /// Terminal failure
    Error {
        /// Error body
        #[serde(flatten)]
        error: ErrorPayload,
    },
    /// Terminal success
    Complete {
        /// Request identifier
        request_id: RequestId,
        /// Number of chunks delivered
        chunk_count: u64,
        /// Wall time from request start to completion
        total_duration_ms: u64,
    },
}

impl StreamEvent {
    /// Build a chunk event
    #[must_use]
    pub fn chunk(chunk: StreamChunk) -> Self {
        Self::Chunk {
            content: chunk.content,
            index: chunk.sequence_index,
            finish_reason: chunk.finish_reason,
        }
    }

    /// Build the terminal error event for a gateway error
    #[must_use]
    pub fn from_error(err: &GatewayError) -> Self {
        Self::Error {
            error: ErrorPayload::from(err),
        }
    }

    /// Whether this event ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete { .. })
    }

    /// Stable event name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Chunk { .. } => "chunk",
            Self::KeepAlive => "keep_alive",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }
}
