//! Error taxonomy for the gateway.
//!
//! Every failure below the orchestrator is either absorbed by a fallback or
//! converted exactly once into a [`GatewayError`]. The orchestrator then turns
//! it into a single client-visible `error` event whose `kind` is one of the
//! stable [`ErrorKind`] strings and whose message comes from
//! [`GatewayError::client_message`], never from the raw error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Stable, client-facing error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request
    ValidationError,
    /// Identity exceeded its request rate
    RateLimitExceeded,
    /// Identity exceeded its concurrent request cap
    IdentityAdmissionExceeded,
    /// Global admission pool is full
    ConnectionPoolExhausted,
    /// A backend's breaker rejected the call
    CircuitBreakerOpen,
    /// No backend could serve the request
    AllBackendsUnavailable,
    /// A backend failed
    BackendError,
    /// Queued request waited too long
    QueueTimeout,
    /// First-chunk or total request timeout
    Timeout,
    /// Shared store could not be reached
    StoreUnavailable,
    /// The client went away mid-stream
    ClientDisconnected,
    /// Unexpected internal failure
    InternalError,
}

impl ErrorKind {
    /// Stable string form used on the wire
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::IdentityAdmissionExceeded => "identity_admission_exceeded",
            Self::ConnectionPoolExhausted => "connection_pool_exhausted",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::AllBackendsUnavailable => "all_backends_unavailable",
            Self::BackendError => "backend_error",
            Self::QueueTimeout => "queue_timeout",
            Self::Timeout => "timeout",
            Self::StoreUnavailable => "store_unavailable",
            Self::ClientDisconnected => "client_disconnected",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of backend failures, which drives retry and breaker policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Connection refused, reset, DNS failure
    Network,
    /// The backend did not answer in time
    Timeout,
    /// The backend reported itself overloaded or down
    Unavailable,
    /// Credentials rejected
    Authentication,
    /// The backend rejected the request as malformed
    InvalidRequest,
    /// Anything else
    Other,
}

impl BackendErrorKind {
    /// Network and timeout class errors are worth retrying
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Unavailable)
    }

    /// Whether the failure says something about the backend's health.
    ///
    /// A malformed request is the caller's fault and must not trip a breaker.
    #[must_use]
    pub fn counts_against_backend(self) -> bool {
        !matches!(self, Self::InvalidRequest)
    }
}

/// Which timeout fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStage {
    /// No chunk arrived within the first-chunk bound
    FirstChunk,
    /// The whole request exceeded its total bound
    Total,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstChunk => write!(f, "first chunk"),
            Self::Total => write!(f, "total request"),
        }
    }
}

/// Gateway error type
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Malformed request, rejected before any resource is touched
    #[error("Validation error: {message}")]
    Validation {
        /// Human readable description
        message: String,
        /// Offending field, if known
        field: Option<String>,
        /// Machine readable code
        code: String,
    },

    /// Identity exceeded its request rate
    #[error("Rate limit exceeded for {identity} (limit {limit}), retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Identity that was limited
        identity: String,
        /// Configured limit for the window
        limit: u64,
        /// Time until the current window ends
        retry_after: Duration,
    },

    /// Identity exceeded its concurrent request cap
    #[error("Concurrent request limit of {limit} reached for {identity}")]
    IdentityAdmissionExceeded {
        /// Identity that was rejected
        identity: String,
        /// Per-identity cap
        limit: u64,
    },

    /// The global admission pool is full
    #[error("Connection pool exhausted ({active}/{capacity})")]
    ConnectionPoolExhausted {
        /// Active slots observed
        active: u64,
        /// Global cap
        capacity: u64,
    },

    /// A backend's breaker rejected the call
    #[error("Circuit breaker open for backend {backend}")]
    CircuitBreakerOpen {
        /// Backend identifier
        backend: String,
    },

    /// Every candidate backend was skipped or failed
    #[error("All backends unavailable (attempted: {attempted:?})")]
    AllBackendsUnavailable {
        /// Backends that were tried or skipped
        attempted: Vec<String>,
    },

    /// A backend failed
    #[error("Backend {backend} error ({kind:?}): {message}")]
    Backend {
        /// Backend identifier
        backend: String,
        /// Raw backend message, never shown to clients
        message: String,
        /// Failure class
        kind: BackendErrorKind,
    },

    /// A queued request received no worker activity in time
    #[error("Queued request timed out after {waited:?}")]
    QueueTimeout {
        /// How long the producer waited
        waited: Duration,
    },

    /// First-chunk or total timeout
    #[error("Request timed out waiting for {stage} after {after:?}")]
    Timeout {
        /// Which bound fired
        stage: TimeoutStage,
        /// The bound that was exceeded
        after: Duration,
    },

    /// Shared store could not be reached
    #[error("Shared store unavailable: {message}")]
    StoreUnavailable {
        /// Underlying store error
        message: String,
    },

    /// The client sink is gone
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Terminal error reported by another process (e.g. a queue worker)
    #[error("{kind}: {message}")]
    Relayed {
        /// Kind reported by the remote side
        kind: ErrorKind,
        /// Diagnostic-safe message reported by the remote side
        message: String,
    },

    /// Unexpected internal failure
    #[error("Internal error: {message}")]
    Internal {
        /// Description
        message: String,
    },
}

impl GatewayError {
    /// Create a validation error
    pub fn validation(
        message: impl Into<String>,
        field: Option<String>,
        code: impl Into<String>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            field,
            code: code.into(),
        }
    }

    /// Create a backend error
    pub fn backend(
        backend: impl Into<String>,
        message: impl Into<String>,
        kind: BackendErrorKind,
    ) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
            kind,
        }
    }

    /// Create a breaker-open error
    pub fn circuit_breaker_open(backend: impl Into<String>) -> Self {
        Self::CircuitBreakerOpen {
            backend: backend.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(stage: TimeoutStage, after: Duration) -> Self {
        Self::Timeout { stage, after }
    }

    /// Create a store-unavailable error
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable kind reported to clients
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::IdentityAdmissionExceeded { .. } => ErrorKind::IdentityAdmissionExceeded,
            Self::ConnectionPoolExhausted { .. } => ErrorKind::ConnectionPoolExhausted,
            Self::CircuitBreakerOpen { .. } => ErrorKind::CircuitBreakerOpen,
            Self::AllBackendsUnavailable { .. } => ErrorKind::AllBackendsUnavailable,
            Self::Backend { .. } => ErrorKind::BackendError,
            Self::QueueTimeout { .. } => ErrorKind::QueueTimeout,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            Self::ClientDisconnected => ErrorKind::ClientDisconnected,
            Self::Relayed { kind, .. } => *kind,
            Self::Internal { .. } => ErrorKind::InternalError,
        }
    }

    /// Whether retrying the same backend call could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { kind, .. } => kind.is_retryable(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether the error should be recorded as a failure of the backend that produced it
    #[must_use]
    pub fn counts_against_backend(&self) -> bool {
        match self {
            Self::Backend { kind, .. } => kind.counts_against_backend(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Retry-after hint for rate limited requests
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Message that is safe to show to a client: no internal state, no backend detail.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Validation { message, .. } => message.clone(),
            Self::RateLimitExceeded { retry_after, .. } => format!(
                "Rate limit exceeded, retry after {} seconds",
                retry_after.as_secs_f64().ceil() as u64
            ),
            Self::IdentityAdmissionExceeded { limit, .. } => {
                format!("Too many concurrent requests (limit {limit})")
            }
            Self::ConnectionPoolExhausted { .. } => "Gateway is at capacity".to_string(),
            Self::CircuitBreakerOpen { .. } | Self::AllBackendsUnavailable { .. } => {
                "No backend is currently available to serve this request".to_string()
            }
            Self::Backend { .. } => "The backend failed to complete the request".to_string(),
            Self::QueueTimeout { .. } => {
                "Timed out waiting for capacity to process the request".to_string()
            }
            Self::Timeout { stage, .. } => format!("Timed out waiting for {stage}"),
            Self::StoreUnavailable { .. } | Self::Internal { .. } => {
                "Internal gateway error".to_string()
            }
            Self::ClientDisconnected => "Client disconnected".to_string(),
            Self::Relayed { message, .. } => message.clone(),
        }
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors.errors().keys().map(ToString::to_string).collect();
        fields.sort();
        let field = fields.into_iter().next();
        let code = field
            .as_ref()
            .map_or_else(|| "invalid_request".to_string(), |f| format!("invalid_{f}"));
        Self::Validation {
            message: errors.to_string(),
            field,
            code,
        }
    }
}
