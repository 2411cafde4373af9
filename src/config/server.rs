//! Server, worker and storage configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::worker::{BatchSettings, DEFAULT_BATCH_SIZE};

/// Stream server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port for the WebSocket / health listener.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Ingestion worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Persist in batches instead of one record per message.
    pub batched: bool,
    /// Records per batch.
    pub batch_size: usize,
    /// Idle time before a partial batch is flushed, in milliseconds.
    pub batch_linger_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batched: false,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_linger_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    /// Batch parameters when batching is enabled.
    pub fn batch_settings(&self) -> Option<BatchSettings> {
        self.batched.then(|| BatchSettings {
            size: self.batch_size,
            linger: Duration::from_millis(self.batch_linger_ms),
        })
    }
}

/// Record storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one JSON Lines file per topic.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}
