//! Flowgate Configuration System
//!
//! TOML-based configuration with environment variable override support.
//! Values here are plain data; the crates that consume them turn them into
//! policies, stores and schedulers.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

const REDUCERS: &[&str] = &["minimum", "maximum", "collect"];
const STORE_TYPES: &[&str] = &["memory", "file"];
const RETRY_POLICIES: &[&str] = &["none", "fixed", "forever", "exponential"];

/// Accepted `poll.time_unit` spellings, each mapped to its canonical name
pub const TIME_UNITS: &[(&str, &str)] = &[
    ("milliseconds", "milliseconds"),
    ("ms", "milliseconds"),
    ("seconds", "seconds"),
    ("s", "seconds"),
    ("minutes", "minutes"),
    ("m", "minutes"),
    ("hours", "hours"),
    ("h", "hours"),
    ("days", "days"),
    ("d", "days"),
];

/// Canonical name of a time unit, matched case-insensitively
pub fn canonical_time_unit(value: &str) -> Option<&'static str> {
    TIME_UNITS
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(value.trim()))
        .map(|(_, canonical)| *canonical)
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub aggregator: AggregatorConfig,
    pub redelivery: RedeliveryConfig,
    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub metrics: MetricsConfig,
}

/// Correlation group tracking and aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Time a group may stay incomplete before it is expired
    pub group_timeout_ms: u64,
    /// Interval of the background expiry sweep
    pub reaper_interval_ms: u64,
    /// How long a closed correlation id keeps rejecting late members
    pub closed_group_retention_ms: u64,
    /// Reducer: minimum, maximum, collect
    pub reducer: String,
    /// Numeric payload field used by the minimum/maximum reducers
    pub reducer_field: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            group_timeout_ms: 60_000,
            reaper_interval_ms: 1_000,
            closed_group_retention_ms: 300_000,
            reducer: "minimum".to_string(),
            reducer_field: "rate".to_string(),
        }
    }
}

impl AggregatorConfig {
    pub fn group_timeout(&self) -> Duration {
        Duration::from_millis(self.group_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn closed_group_retention(&self) -> Duration {
        Duration::from_millis(self.closed_group_retention_ms)
    }
}

/// Redelivery policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// Deliveries beyond this count are rejected
    pub max_redelivery_count: u32,
    /// Expression resolving a message identity, kept verbatim
    pub id_expression: String,
    /// Identify messages by a SHA-256 of their payload instead of the expression
    pub use_secure_hash: bool,
    /// Remove the delivery record after a rejected message was handed to the failure handler
    pub clear_on_reject: bool,
    /// Reject messages whose identity cannot be resolved (fail closed)
    pub reject_unresolved_identity: bool,
    pub object_store: ObjectStoreConfig,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            max_redelivery_count: 5,
            id_expression: "#[mel:message:id]".to_string(),
            use_secure_hash: false,
            clear_on_reject: true,
            reject_unresolved_identity: true,
            object_store: ObjectStoreConfig::default(),
        }
    }
}

/// Object store backing the redelivery counters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// Store type: memory, file
    #[serde(rename = "type")]
    pub store_type: String,
    pub name: String,
    /// File location for the file store
    pub path: String,
    /// Maximum entries for the memory store
    pub max_entries: Option<usize>,
    /// Entry time-to-live in seconds for the memory store
    pub entry_ttl_secs: Option<u64>,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            store_type: "memory".to_string(),
            name: "redelivery".to_string(),
            path: "./data/redelivery.json".to_string(),
            max_entries: None,
            entry_ttl_secs: None,
        }
    }
}

/// Retry policy template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Policy: none, fixed, forever, exponential
    pub policy: String,
    /// Number of retries after the first attempt
    pub count: u32,
    /// Delay between attempts (initial delay for exponential)
    pub frequency_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Run retry loops on a background task
    pub asynchronous: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: "fixed".to_string(),
            count: 3,
            frequency_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: false,
            asynchronous: false,
        }
    }
}

impl RetryConfig {
    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Polling scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub frequency: u64,
    pub start_delay: u64,
    /// milliseconds, seconds, minutes, hours, days
    pub time_unit: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            frequency: 1_000,
            start_delay: 0,
            time_unit: "milliseconds".to_string(),
        }
    }
}

/// Prometheus exporter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: "0.0.0.0:9090".to_string(),
        }
    }
}

fn one_of(field: &str, value: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{} must be one of {:?}, got '{}'",
            field, allowed, value
        )))
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Check cross-field constraints the type system cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregator.group_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "aggregator.group_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.aggregator.reaper_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "aggregator.reaper_interval_ms must be greater than zero".to_string(),
            ));
        }
        one_of("aggregator.reducer", &self.aggregator.reducer, REDUCERS)?;

        if self.redelivery.id_expression.trim().is_empty() && !self.redelivery.use_secure_hash {
            return Err(ConfigError::ValidationError(
                "redelivery.id_expression is required unless use_secure_hash is set".to_string(),
            ));
        }
        one_of(
            "redelivery.object_store.type",
            &self.redelivery.object_store.store_type,
            STORE_TYPES,
        )?;
        if self.redelivery.object_store.store_type.eq_ignore_ascii_case("file")
            && self.redelivery.object_store.path.trim().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "redelivery.object_store.path is required for the file store".to_string(),
            ));
        }

        one_of("retry.policy", &self.retry.policy, RETRY_POLICIES)?;
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.poll.frequency == 0 {
            return Err(ConfigError::ValidationError(
                "poll.frequency must be greater than zero".to_string(),
            ));
        }
        if canonical_time_unit(&self.poll.time_unit).is_none() {
            let accepted: Vec<&str> = TIME_UNITS.iter().map(|(alias, _)| *alias).collect();
            return Err(ConfigError::ValidationError(format!(
                "poll.time_unit must be one of {:?}, got '{}'",
                accepted, self.poll.time_unit
            )));
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r##"# Flowgate Configuration
# Environment variables (FLOWGATE_*) override these settings

[aggregator]
group_timeout_ms = 60000
reaper_interval_ms = 1000
closed_group_retention_ms = 300000
reducer = "minimum"        # minimum, maximum, collect
reducer_field = "rate"

[redelivery]
max_redelivery_count = 5
id_expression = "#[mel:message:id]"
use_secure_hash = false
clear_on_reject = true
reject_unresolved_identity = true

[redelivery.object_store]
type = "memory"            # memory, file
name = "redelivery"
path = "./data/redelivery.json"

[retry]
policy = "fixed"           # none, fixed, forever, exponential
count = 3
frequency_ms = 2000
multiplier = 2.0
max_delay_ms = 60000
jitter = false
asynchronous = false

[poll]
frequency = 1000
start_delay = 0
time_unit = "milliseconds" # milliseconds (ms), seconds (s), minutes (m), hours (h), days (d)

[metrics]
enabled = false
listen_address = "0.0.0.0:9090"
"##
        .to_string()
    }
}
