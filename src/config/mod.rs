//! # Configuration
//!
//! YAML-backed engine configuration with environment-variable interpolation.
//!
//! Every field carries a serde default, so an empty document (or no document
//! at all) yields a runnable configuration. Values may reference environment
//! variables as `${VAR}` (required) or `${VAR:-default}` (optional with
//! fallback); interpolation happens on the raw YAML value tree before
//! deserialization, so it works anywhere a string appears.
//!
//! ## Usage
//!
//! ```rust
//! use weir_core::config::WeirConfig;
//!
//! # fn main() -> Result<(), weir_core::error::ConfigError> {
//! let config = WeirConfig::from_yaml(
//!     "orchestrator:\n  worker_pool_size: 8\nqueues:\n  capacity: 512\n",
//! )?;
//! assert_eq!(config.orchestrator.worker_pool_size, 8);
//! assert_eq!(config.queues.capacity, 512);
//! # Ok(())
//! # }
//! ```

use std::env;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable naming an alternate configuration file.
pub const CONFIG_PATH_ENV: &str = "WEIR_CONFIG";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeirConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordinator sizing and poller cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Concurrent execution-queue consumers. 0 sizes from the machine.
    #[serde(default)]
    pub worker_pool_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub delay_poll_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub sla_poll_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            worker_pool_size: 0,
            delay_poll_interval_ms: default_poll_interval_ms(),
            sla_poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Pool size with the 0-means-autosize rule applied.
    pub fn effective_worker_pool_size(&self) -> usize {
        if self.worker_pool_size > 0 {
            return self.worker_pool_size;
        }
        let cores = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        cores.max(4)
    }
}

/// In-memory queue bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Buffered messages per queue before emitters block.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            capacity: default_queue_capacity(),
        }
    }
}

/// Log subscriber settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; overridden by the log env variable.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WeirConfig {
    /// Parse a YAML document, interpolating `${VAR}` references first.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(contents)?;
        interpolate_value(&mut value)?;
        let config: WeirConfig = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load from the file named by `WEIR_CONFIG`, or defaults when unset.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Reject values that would stall the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.capacity == 0 {
            return Err(ConfigError::Validation(
                "queues.capacity must be greater than zero".to_string(),
            ));
        }
        if self.orchestrator.delay_poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.delay_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.orchestrator.sla_poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.sla_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Walk the YAML tree and interpolate every string in place.
fn interpolate_value(value: &mut serde_yaml::Value) -> Result<(), ConfigError> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = interpolate_env(s)?;
        }
        serde_yaml::Value::Mapping(mapping) => {
            for (_, v) in mapping.iter_mut() {
                interpolate_value(v)?;
            }
        }
        serde_yaml::Value::Sequence(sequence) => {
            for v in sequence.iter_mut() {
                interpolate_value(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace `${VAR}` and `${VAR:-default}` references in one string.
///
/// A reference without a default to an unset variable is an error rather
/// than an empty string, so typos surface at load time.
fn interpolate_env(input: &str) -> Result<String, ConfigError> {
    let pattern = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();

    let mut result = String::new();
    let mut last_end = 0;

    for captures in pattern.captures_iter(input) {
        let whole = captures.get(0).ok_or_else(|| {
            ConfigError::Validation("malformed interpolation capture".to_string())
        })?;
        let var_name = captures
            .get(1)
            .map(|m| m.as_str())
            .unwrap_or_default();
        let default_value = captures.get(2).map(|m| m.as_str());

        result.push_str(&input[last_end..whole.start()]);

        match env::var(var_name) {
            Ok(value) => result.push_str(&value),
            Err(_) => match default_value {
                Some(default) => result.push_str(default),
                None => {
                    return Err(ConfigError::Validation(format!(
                        "environment variable '{var_name}' is not set and has no default"
                    )));
                }
            },
        }

        last_end = whole.end();
    }
    result.push_str(&input[last_end..]);
    Ok(result)
}
