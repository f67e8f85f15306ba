//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "flowgate.toml",
    "config.toml",
    "./config/flowgate.toml",
    "/etc/flowgate/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate the result
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_env_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file not found, searching standard paths");
        }

        if let Ok(path) = env::var("FLOWGATE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn set_parsed<T: FromStr>(target: &mut T, key: &str, value: Option<String>) {
    if let Some(raw) = value {
        match raw.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key = %key, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}

/// Apply `FLOWGATE_*` overrides using `lookup` to read variables
pub(crate) fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Aggregator
    set_parsed(&mut config.aggregator.group_timeout_ms, "FLOWGATE_GROUP_TIMEOUT_MS", lookup("FLOWGATE_GROUP_TIMEOUT_MS"));
    set_parsed(&mut config.aggregator.reaper_interval_ms, "FLOWGATE_REAPER_INTERVAL_MS", lookup("FLOWGATE_REAPER_INTERVAL_MS"));
    if let Some(val) = lookup("FLOWGATE_REDUCER") {
        config.aggregator.reducer = val;
    }
    if let Some(val) = lookup("FLOWGATE_REDUCER_FIELD") {
        config.aggregator.reducer_field = val;
    }

    // Redelivery
    set_parsed(&mut config.redelivery.max_redelivery_count, "FLOWGATE_MAX_REDELIVERY_COUNT", lookup("FLOWGATE_MAX_REDELIVERY_COUNT"));
    if let Some(val) = lookup("FLOWGATE_ID_EXPRESSION") {
        config.redelivery.id_expression = val;
    }
    set_parsed(&mut config.redelivery.use_secure_hash, "FLOWGATE_USE_SECURE_HASH", lookup("FLOWGATE_USE_SECURE_HASH"));
    if let Some(val) = lookup("FLOWGATE_OBJECT_STORE_TYPE") {
        config.redelivery.object_store.store_type = val;
    }
    if let Some(val) = lookup("FLOWGATE_OBJECT_STORE_PATH") {
        config.redelivery.object_store.path = val;
    }

    // Retry
    if let Some(val) = lookup("FLOWGATE_RETRY_POLICY") {
        config.retry.policy = val;
    }
    set_parsed(&mut config.retry.count, "FLOWGATE_RETRY_COUNT", lookup("FLOWGATE_RETRY_COUNT"));
    set_parsed(&mut config.retry.frequency_ms, "FLOWGATE_RETRY_FREQUENCY_MS", lookup("FLOWGATE_RETRY_FREQUENCY_MS"));
    set_parsed(&mut config.retry.asynchronous, "FLOWGATE_RETRY_ASYNC", lookup("FLOWGATE_RETRY_ASYNC"));

    // Poll
    set_parsed(&mut config.poll.frequency, "FLOWGATE_POLL_FREQUENCY", lookup("FLOWGATE_POLL_FREQUENCY"));
    set_parsed(&mut config.poll.start_delay, "FLOWGATE_POLL_START_DELAY", lookup("FLOWGATE_POLL_START_DELAY"));
    if let Some(val) = lookup("FLOWGATE_POLL_TIME_UNIT") {
        config.poll.time_unit = val;
    }

    // Metrics
    set_parsed(&mut config.metrics.enabled, "FLOWGATE_METRICS_ENABLED", lookup("FLOWGATE_METRICS_ENABLED"));
    if let Some(val) = lookup("FLOWGATE_METRICS_ADDRESS") {
        config.metrics.listen_address = val;
    }
}
