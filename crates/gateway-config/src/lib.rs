//! # Gateway Config
//!
//! Typed configuration for the streaming gateway, loaded from YAML, TOML or
//! JSON with `GATEWAY_*` environment overrides.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod loader;

pub use config::{
    BreakerSettings, CacheSettings, GatewayConfig, LoggingSettings, NodeConfig, PoolSettings,
    ProviderKind, ProviderSettings, QueueSettings, RateLimitSettings, RetrySettings,
    SyntheticSettings, TierLimit, TimeoutSettings,
};
pub use error::ConfigError;
pub use loader::{apply_overrides, load_config, parse_config, ConfigLoader, CONFIG_PATH_ENV};
