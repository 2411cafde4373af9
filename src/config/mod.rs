//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod server;

pub use messaging::{
    AmqpConfig, LiveConfig, MessagingConfig, RedisConfig, DEFAULT_AMQP_URL, DEFAULT_PREFETCH,
    DEFAULT_REDIS_URL,
};
pub use server::{ServerConfig, StorageConfig, WorkerConfig};

use serde::Deserialize;

use crate::hub::HubConfig;
use crate::topics::TopicTable;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DASHFEED_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DASHFEED";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DASHFEED_LOG";

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Work queue broker.
    pub messaging: MessagingConfig,
    /// Live pub/sub channel.
    pub live: LiveConfig,
    /// Queue and channel names per event kind.
    pub topics: TopicTable,
    /// Ingestion workers.
    pub worker: WorkerConfig,
    /// Connection hub.
    pub hub: HubConfig,
    /// Stream server.
    pub server: ServerConfig,
    /// Record storage.
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    ///
    /// The result is validated before it is returned.
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

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.topics.names().iter().any(|name| name.is_empty()) {
            return invalid("topic names must not be empty");
        }
        if self.topics.has_duplicates() {
            return invalid("topic names must be distinct");
        }
        if self.hub.mailbox_capacity == 0 {
            return invalid("hub.mailbox_capacity must be greater than zero");
        }
        if self.hub.inbox_capacity == 0 {
            return invalid("hub.inbox_capacity must be greater than zero");
        }
        if self.messaging.amqp.prefetch == 0 {
            return invalid("messaging.amqp.prefetch must be greater than zero");
        }
        if self.worker.batch_size == 0 {
            return invalid("worker.batch_size must be greater than zero");
        }
        // A batch can only fill if the broker hands out that many unacked messages.
        if self.worker.batched && self.worker.batch_size > usize::from(self.messaging.amqp.prefetch)
        {
            return Err(ConfigError::Invalid(format!(
                "worker.batch_size ({}) exceeds messaging.amqp.prefetch ({})",
                self.worker.batch_size, self.messaging.amqp.prefetch
            )));
        }
        Ok(())
    }
}
