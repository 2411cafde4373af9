//! Persistence collaborator for ingested records.
//!
//! The worker only needs "store this record" and "store these records";
//! query and aggregation live elsewhere. `persist_batch` is all-or-nothing
//! per call: on error none of the batch may be considered stored.

use async_trait::async_trait;

use crate::model::Record;

mod jsonl;
mod memory;

pub use jsonl::JsonLinesStore;
pub use memory::MemoryStore;

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Errors that can occur while persisting records.
///
/// The worker treats every variant as transient and requeues the message.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable sink for one record type.
#[async_trait]
pub trait Persister<R: Record>: Send + Sync {
    /// Store a single record.
    async fn persist(&self, record: &R) -> Result<()>;

    /// Store several records as one unit.
    async fn persist_batch(&self, records: &[R]) -> Result<()>;
}
