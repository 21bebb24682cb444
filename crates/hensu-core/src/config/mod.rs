use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{HensuConfig, LeaseConfig, PlanDefaultsConfig, RuntimeConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Load and validate a `HensuConfig` from a TOML file path.
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<HensuConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(HensuConfig::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_config(&data)
}

/// Parse and validate a `HensuConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<HensuConfig, ConfigError> {
    let config: HensuConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &HensuConfig) -> Result<(), ConfigError> {
    if config.runtime.max_execution_steps == 0 {
        return Err(ConfigError::Validation {
            message: "runtime.max_execution_steps must be > 0".to_string(),
        });
    }

    if !config.runtime.use_virtual_threads && config.runtime.thread_pool_size == 0 {
        return Err(ConfigError::Validation {
            message: "runtime.thread_pool_size must be > 0 when use_virtual_threads is false"
                .to_string(),
        });
    }

    if config.lease.heartbeat_interval_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "lease.heartbeat_interval_seconds must be > 0".to_string(),
        });
    }

    if config.lease.lease_stale_threshold_seconds <= config.lease.heartbeat_interval_seconds {
        return Err(ConfigError::Validation {
            message: "lease.lease_stale_threshold_seconds must exceed heartbeat_interval_seconds"
                .to_string(),
        });
    }

    if config.plan.default_plan_max_steps == 0 {
        return Err(ConfigError::Validation {
            message: "plan.default_plan_max_steps must be > 0".to_string(),
        });
    }

    if config.plan.default_plan_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "plan.default_plan_timeout_seconds must be > 0".to_string(),
        });
    }

    Ok(())
}
