//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        /// File that was being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed
    #[error("Failed to parse configuration file {path}: {message}")]
    Parse {
        /// File that was being parsed
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// The file extension is not one of yaml, yml, toml or json
    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// An environment override could not be parsed
    #[error("Invalid value {value:?} for {var}")]
    InvalidOverride {
        /// Environment variable name
        var: String,
        /// Offending value
        value: String,
    },

    /// The configuration parsed but is not usable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Invalid(errors.to_string())
    }
}
