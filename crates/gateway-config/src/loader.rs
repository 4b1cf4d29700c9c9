//! Configuration loading: file, then environment overrides, then validation.

use crate::config::GatewayConfig;
use crate::error::ConfigError;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";

/// Loads a [`GatewayConfig`]
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    use_env: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader with no file and environment overrides enabled
    #[must_use]
    pub fn new() -> Self {
        Self {
            file: None,
            use_env: true,
        }
    }

    /// Read this file
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Read the file named by `GATEWAY_CONFIG`, if set
    #[must_use]
    pub fn with_file_from_env(mut self) -> Self {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.trim().is_empty() {
                self.file = Some(PathBuf::from(path));
            }
        }
        self
    }

    /// Enable or disable `GATEWAY_*` overrides
    #[must_use]
    pub fn with_env_overrides(mut self, enabled: bool) -> Self {
        self.use_env = enabled;
        self
    }

    /// Load, override and validate
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, an override is
    /// malformed, or the result fails validation
    pub async fn load(&self) -> Result<GatewayConfig, ConfigError> {
        let mut config = match &self.file {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration file");
                let contents = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: path.clone(),
                        source,
                    })?;
                parse_config(path, &contents)?
            }
            None => {
                debug!("No configuration file, using defaults");
                GatewayConfig::default()
            }
        };

        if self.use_env {
            apply_overrides(&mut config, |var| std::env::var(var).ok())?;
        }

        config.validate_config()?;
        Ok(config)
    }
}

/// Load configuration from `GATEWAY_CONFIG` (or defaults) with environment overrides
///
/// # Errors
/// See [`ConfigLoader::load`]
pub async fn load_config() -> Result<GatewayConfig, ConfigError> {
    ConfigLoader::new().with_file_from_env().load().await
}

/// Parse file contents, choosing the format by extension
///
/// # Errors
/// Returns error on an unknown extension or malformed contents
pub fn parse_config(path: &Path, contents: &str) -> Result<GatewayConfig, ConfigError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| parse_err(e.to_string())),
        "toml" => toml::from_str(contents).map_err(|e| parse_err(e.to_string())),
        "json" => serde_json::from_str(contents).map_err(|e| parse_err(e.to_string())),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Apply `GATEWAY_*` overrides read through `lookup`
///
/// # Errors
/// Returns `ConfigError::InvalidOverride` when a value does not parse
pub fn apply_overrides<F>(config: &mut GatewayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("GATEWAY_INSTANCE_ID") {
        config.node.instance_id = Some(v);
    }
    if let Some(v) = lookup("GATEWAY_KEY_PREFIX") {
        config.node.key_prefix = v;
    }
    if let Some(v) = lookup("GATEWAY_LOG_LEVEL") {
        config.logging.level = v;
    }
    if let Some(v) = lookup("GATEWAY_LOG_FORMAT") {
        config.logging.format = v;
    }

    override_parsed(&lookup, "GATEWAY_CACHE_ENABLED", &mut config.cache.enabled)?;
    override_parsed(&lookup, "GATEWAY_CACHE_LOCAL_CAPACITY", &mut config.cache.local_capacity)?;
    override_duration(&lookup, "GATEWAY_CACHE_RESPONSE_TTL", &mut config.cache.response_ttl)?;

    override_parsed(&lookup, "GATEWAY_RATE_LIMIT_ENABLED", &mut config.rate_limit.enabled)?;
    override_parsed(
        &lookup,
        "GATEWAY_RATE_LIMIT_AUTHENTICATED",
        &mut config.rate_limit.authenticated.limit,
    )?;
    override_parsed(
        &lookup,
        "GATEWAY_RATE_LIMIT_ANONYMOUS",
        &mut config.rate_limit.anonymous.limit,
    )?;

    override_parsed(&lookup, "GATEWAY_POOL_GLOBAL_CAPACITY", &mut config.pool.global_capacity)?;
    override_parsed(
        &lookup,
        "GATEWAY_POOL_PER_IDENTITY_CAPACITY",
        &mut config.pool.per_identity_capacity,
    )?;

    override_parsed(
        &lookup,
        "GATEWAY_BREAKER_FAILURE_THRESHOLD",
        &mut config.breaker.failure_threshold,
    )?;
    override_duration(
        &lookup,
        "GATEWAY_BREAKER_RECOVERY_TIMEOUT",
        &mut config.breaker.recovery_timeout,
    )?;

    override_parsed(&lookup, "GATEWAY_QUEUE_ENABLED", &mut config.queue.enabled)?;
    override_parsed(&lookup, "GATEWAY_QUEUE_WORKERS", &mut config.queue.workers)?;

    override_duration(&lookup, "GATEWAY_TIMEOUT_FIRST_CHUNK", &mut config.timeouts.first_chunk)?;
    override_duration(&lookup, "GATEWAY_TIMEOUT_TOTAL", &mut config.timeouts.total)?;
    override_duration(&lookup, "GATEWAY_TIMEOUT_QUEUE_WAIT", &mut config.timeouts.queue_wait)?;

    Ok(())
}

fn override_parsed<F, T>(lookup: &F, var: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(var) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidOverride {
            var: var.to_string(),
            value: raw.clone(),
        })?;
        debug!(var = %var, "Applied environment override");
    }
    Ok(())
}

fn override_duration<F>(lookup: &F, var: &str, target: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(var) {
        *target = humantime_serde::re::humantime::parse_duration(raw.trim()).map_err(|_| {
            ConfigError::InvalidOverride {
                var: var.to_string(),
                value: raw.clone(),
            }
        })?;
        debug!(var = %var, "Applied environment override");
    }
    Ok(())
}
