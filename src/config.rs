//! Messaging configuration.
//!
//! Loaded from YAML files and environment variables; env vars override
//! file values.

use serde::Deserialize;

use crate::consumer::ConsumerConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "AUCTION_BUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "AUCTION";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "AUCTION_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] ::config::ConfigError),
}

/// Broker and consumer tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Maximum unacknowledged messages in flight per queue.
    pub prefetch: u16,
    /// Retry budget before a failing message is dead-lettered.
    pub max_retries: u32,
    /// Queues this worker consumes from; `None` runs every event queue.
    pub queues: Option<Vec<String>>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            prefetch: 10,
            max_retries: 3,
            queues: None,
        }
    }
}

impl MessagingConfig {
    /// Consumer tunables derived from this configuration.
    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            prefetch: self.prefetch,
            max_retries: self.max_retries,
        }
    }

    /// Whether this worker should run a consumer for `queue`.
    pub fn runs_queue(&self, queue: &str) -> bool {
        match &self.queues {
            Some(queues) => queues.iter().any(|q| q == queue),
            None => true,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging configuration.
    pub messaging: MessagingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources in order of priority (later overrides earlier):
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. File named by `AUCTION_BUS_CONFIG` (if set)
    /// 3. Environment variables with the `AUCTION` prefix
    pub fn load() -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
