//! Structured logging setup.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;
use tracing_subscriber::{fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    #[default]
    Pretty,
    /// Single-line human readable output
    Compact,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(LoggingError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level filter used when `RUST_LOG` is not set
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Include module targets
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the level filter
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Set the output format
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Include or omit module targets
    #[must_use]
    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }
}

/// Install the global subscriber
///
/// # Errors
/// Returns error if a global subscriber is already installed
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let layer = match config.format {
        LogFormat::Pretty => tfmt::layer()
            .pretty()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => tfmt::layer()
            .compact()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tfmt::layer()
            .json()
            .with_current_span(true)
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    info!(level = %config.level, format = %config.format, "Logging initialized");
    Ok(())
}

static TEST_LOGGING: OnceCell<()> = OnceCell::new();

/// Enable log output in tests when `TEST_LOG` is set. Safe to call repeatedly.
pub fn init_test_logging() {
    TEST_LOGGING.get_or_init(|| {
        if std::env::var("TEST_LOG").is_ok() {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
            let _ = tracing_subscriber::registry()
                .with(tfmt::layer().with_test_writer().with_filter(filter))
                .try_init();
        }
    });
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// Failed to install the subscriber
    #[error("Failed to initialize logging: {0}")]
    Init(String),
    /// Unknown format name
    #[error("Unknown log format: {0}")]
    UnknownFormat(String),
}

/// Create a span for one gateway request
#[macro_export]
macro_rules! request_span {
    ($request_id:expr, $identity:expr) => {
        tracing::info_span!(
            "gateway_request",
            request_id = %$request_id,
            identity = %$identity
        )
    };
}

/// Create a span for one backend call
#[macro_export]
macro_rules! backend_span {
    ($backend:expr, $attempt:expr) => {
        tracing::debug_span!(
            "backend_call",
            backend = %$backend,
            attempt = $attempt
        )
    };
}
