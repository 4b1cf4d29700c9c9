//! Queue payload and result channel protocol.
//!
//! A queued request travels as JSON on the durable queue. Results come back
//! on the request's private channel as one of four message shapes, each
//! tagged with the `run_id` of the worker run that produced it so the
//! producer can ignore a duplicate run of the same request.

use gateway_core::{ErrorPayload, RequestId, StreamChunk, StreamRequest};
use serde::{Deserialize, Serialize};

/// A request diverted to the failover queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Request id; names the result channel
    pub request_id: RequestId,
    /// Caller identity
    pub identity: String,
    /// Caller correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// The original request
    pub payload: StreamRequest,
    /// When the producer enqueued it, epoch milliseconds
    pub enqueued_at_ms: i64,
    /// Producer-side attempt number, starting at 1
    pub attempt: u32,
}

impl QueuedRequest {
    /// Wrap a request for the queue
    #[must_use]
    pub fn new(request: &StreamRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            identity: request.identity.clone(),
            correlation_id: request.correlation_id.clone(),
            payload: request.clone(),
            enqueued_at_ms: chrono::Utc::now().timestamp_millis(),
            attempt: 1,
        }
    }

    /// Serialize for the queue
    ///
    /// # Errors
    /// Returns the serializer's error
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a queue payload
    ///
    /// # Errors
    /// Returns the parser's error for malformed payloads
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// A message on a request's result channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Consecutive chunks of the response
    ChunkBatch {
        /// Worker run that produced the chunks
        run_id: String,
        /// Chunks in sequence order
        chunks: Vec<StreamChunk>,
    },
    /// The run finished successfully
    Done {
        /// Worker run
        run_id: String,
        /// Chunks published by the run
        chunk_count: u64,
    },
    /// The run failed terminally
    Error {
        /// Worker run
        run_id: String,
        /// Diagnostic-safe error body
        error: ErrorPayload,
    },
    /// A worker holds the request and is still making progress
    Heartbeat {
        /// Worker run, if one has started
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        /// Publish time, epoch milliseconds
        at_ms: i64,
    },
}

impl ChannelMessage {
    /// Heartbeat for `run_id` stamped now
    #[must_use]
    pub fn heartbeat(run_id: &str) -> Self {
        Self::Heartbeat {
            run_id: Some(run_id.to_string()),
            at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Run that produced this message
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::ChunkBatch { run_id, .. } | Self::Done { run_id, .. } | Self::Error { run_id, .. } => {
                Some(run_id)
            }
            Self::Heartbeat { run_id, .. } => run_id.as_deref(),
        }
    }

    /// Serialize for publishing
    ///
    /// # Errors
    /// Returns the serializer's error
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a channel message
    ///
    /// # Errors
    /// Returns the parser's error for malformed or unknown messages
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
