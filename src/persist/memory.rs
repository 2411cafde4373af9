//! In-memory store with failure injection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{PersistError, Persister, Result};
use crate::model::Record;

/// Keeps records in a vector. Used by tests and local runs.
pub struct MemoryStore<R> {
    records: RwLock<Vec<R>>,
    fail_remaining: AtomicUsize,
    fail_always: AtomicBool,
    persist_calls: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl<R> Default for MemoryStore<R> {
    fn default() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            fail_remaining: AtomicUsize::new(0),
            fail_always: AtomicBool::new(false),
            persist_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
        }
    }
}

impl<R: Record> MemoryStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls, then recover.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every call until cleared.
    pub fn set_fail(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of stored records, in insertion order.
    pub async fn records(&self) -> Vec<R> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Number of `persist` calls, including failed ones.
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// Number of `persist_batch` calls, including failed ones.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<()> {
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(PersistError::Unavailable("injected failure".to_string()));
        }
        let consumed = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(PersistError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<R: Record> Persister<R> for MemoryStore<R> {
    async fn persist(&self, record: &R) -> Result<()> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn persist_batch(&self, records: &[R]) -> Result<()> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        self.records.write().await.extend_from_slice(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Quote;

    fn quote(symbol: &str) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let store = MemoryStore::<Quote>::new();
        store.fail_next(2);

        assert!(store.persist(&quote("A")).await.is_err());
        assert!(store.persist(&quote("A")).await.is_err());
        assert!(store.persist(&quote("A")).await.is_ok());

        assert_eq!(store.persist_calls(), 3);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_batch_stores_nothing() {
        let store = MemoryStore::<Quote>::new();
        store.set_fail(true);

        let batch = vec![quote("A"), quote("B")];
        assert!(store.persist_batch(&batch).await.is_err());
        assert!(store.is_empty().await);

        store.set_fail(false);
        store.persist_batch(&batch).await.unwrap();
        assert_eq!(store.records().await, batch);
        assert_eq!(store.batch_calls(), 2);
    }
}
