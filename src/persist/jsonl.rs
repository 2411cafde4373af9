//! Append-only JSON Lines store.
//!
//! Stores records as one JSON document per line:
//! ```text
//! {data_dir}/
//!   {topic}.jsonl
//! ```
//!
//! A batch is serialized up front and appended with a single write, so a
//! serialization error stores nothing. A failed write is rolled back by
//! truncating the file to its previous length, so no torn line is left in
//! front of the retry.

use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::{Persister, Result};
use crate::model::Record;

/// JSON Lines file per record type.
pub struct JsonLinesStore<R> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> JsonLinesStore<R> {
    /// Open (or create) `{data_dir}/{topic}.jsonl`.
    ///
    /// Creates the data directory if it doesn't exist.
    pub async fn open(data_dir: impl AsRef<Path>, topic: &str) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).await?;
        Ok(Self {
            path: data_dir.join(format!("{}.jsonl", topic)),
            write_lock: Mutex::new(()),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every stored record back.
    pub async fn read_all(&self) -> Result<Vec<R>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str::<R>(line)?))
            .collect()
    }

    async fn append(&self, buf: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        append_or_rollback(&mut file, buf).await?;
        Ok(())
    }
}

/// File operations an append needs.
#[async_trait]
trait AppendFile: Send + Sync {
    async fn len(&self) -> io::Result<u64>;

    /// Write all of `buf` and flush it to disk.
    async fn write_synced(&mut self, buf: &[u8]) -> io::Result<()>;

    async fn truncate(&self, len: u64) -> io::Result<()>;
}

#[async_trait]
impl AppendFile for File {
    async fn len(&self) -> io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn write_synced(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf).await?;
        self.sync_data().await
    }

    async fn truncate(&self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }
}

/// Append `buf`, or leave the file at its previous length on error.
async fn append_or_rollback<F: AppendFile>(file: &mut F, buf: &[u8]) -> io::Result<()> {
    let original_len = file.len().await?;
    if let Err(e) = file.write_synced(buf).await {
        if let Err(rollback) = file.truncate(original_len).await {
            error!(error = %rollback, original_len, "Failed to roll back partial append");
        }
        return Err(e);
    }
    Ok(())
}

fn encode_line<R: Record>(record: &R, buf: &mut Vec<u8>) -> Result<()> {
    serde_json::to_writer(&mut *buf, record)?;
    buf.push(b'\n');
    Ok(())
}

#[async_trait]
impl<R: Record> Persister<R> for JsonLinesStore<R> {
    async fn persist(&self, record: &R) -> Result<()> {
        let mut buf = Vec::new();
        encode_line(record, &mut buf)?;
        self.append(&buf).await?;
        debug!(path = %self.path.display(), "Stored record");
        Ok(())
    }

    async fn persist_batch(&self, records: &[R]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in records {
            encode_line(record, &mut buf)?;
        }
        self.append(&buf).await?;
        debug!(
            path = %self.path.display(),
            count = records.len(),
            "Stored record batch"
        );
        Ok(())
    }
}
