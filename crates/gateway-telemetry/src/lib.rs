//! # Gateway Telemetry
//!
//! Structured logging for the streaming gateway: subscriber setup with an
//! `EnvFilter`, pretty/compact/JSON output, and request/backend span macros.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;

pub use logging::{init_logging, init_test_logging, LogFormat, LoggingConfig, LoggingError};
