//! Application configuration.
//!
//! Aggregates the consumer, sender, store and subscription settings into a
//! single Config struct that can be loaded from YAML files or environment
//! variables.

use serde::Deserialize;

use crate::sender::SenderConfig;
use crate::store::StoreConfig;
use crate::transport::ConsumerConfig;

pub use ::config::ConfigError;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";

/// Which topics a subscription consumes and under which name.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub name: String,
    pub consumer_id: String,
    pub topics: Vec<String>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            name: "orders".to_string(),
            consumer_id: "courier-1".to_string(),
            topics: vec!["orders".to_string()],
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Poll loop and mailbox tuning.
    pub consumer: ConsumerConfig,
    /// Outbound sender settings, shared by the command and event senders.
    pub sender: SenderConfig,
    /// Idempotency and outbox persistence.
    pub store: StoreConfig,
    pub subscription: SubscriptionConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `COURIER_CONFIG` environment variable (if set)
    /// 4. Environment variables prefixed `COURIER__`, e.g. `COURIER__STORE__TYPE`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests;
