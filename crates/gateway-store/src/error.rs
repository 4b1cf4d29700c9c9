//! Shared store errors.

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by a [`crate::SharedStore`]
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time
    #[error("Store operation timed out: {0}")]
    Timeout(String),

    /// A counter operation hit a non-numeric value
    #[error("Value at key {key} is not an integer")]
    TypeMismatch {
        /// Offending key
        key: String,
    },

    /// A stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the error means the store itself is unhealthy, as opposed to bad data
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}
