use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::envelope::{MessageId, MessageName};
use crate::inbox::DedupStore;

/// A deduplication record: created exactly once per distinct message id.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupRecord {
    pub message_id: MessageId,
    pub message_name: MessageName,
    pub processed_at: DateTime<Utc>,
}

/// An in-memory deduplication store for testing or local usage.
///
/// Mirrors the transactional contract of the database driver:
/// `check_and_record` reserves the identity in shared state the way a unique
/// insert claims its key, so a concurrent transaction on the same id reports
/// a duplicate before either commits. The reservation becomes a committed
/// record on commit and is released on rollback (or drop).
#[derive(Clone, Default)]
pub struct InMemoryDedup {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    committed: HashMap<MessageId, DedupRecord>,
    reserved: HashSet<MessageId>,
}

impl InMemoryDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of committed records.
    pub async fn records(&self) -> Vec<DedupRecord> {
        lock(&self.inner).committed.values().cloned().collect()
    }
}

fn lock(inner: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Staging transaction for [`InMemoryDedup`].
///
/// Holds the reservation for its staged identity; dropping the transaction
/// without committing releases it, like a database rollback.
pub struct InMemoryDedupTransaction {
    inner: Arc<Mutex<Inner>>,
    staged: Option<DedupRecord>,
}

impl Drop for InMemoryDedupTransaction {
    fn drop(&mut self) {
        if let Some(record) = self.staged.take() {
            lock(&self.inner).reserved.remove(&record.message_id);
        }
    }
}

/// Error type for [`InMemoryDedup`] operations. The in-memory store cannot
/// actually fail; the type exists to satisfy the trait contract.
#[derive(Debug)]
pub struct InMemoryDedupError;

impl std::fmt::Display for InMemoryDedupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "In-memory dedup error")
    }
}

impl std::error::Error for InMemoryDedupError {}

#[async_trait]
impl DedupStore for InMemoryDedup {
    type Error = InMemoryDedupError;
    type Transaction = InMemoryDedupTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(InMemoryDedupTransaction {
            inner: Arc::clone(&self.inner),
            staged: None,
        })
    }

    async fn check_and_record(
        &self,
        tx: &mut Self::Transaction,
        id: &MessageId,
        name: &MessageName,
    ) -> Result<bool, Self::Error> {
        {
            let mut inner = lock(&self.inner);
            if inner.committed.contains_key(id) || !inner.reserved.insert(*id) {
                return Ok(true);
            }
        }
        tx.staged = Some(DedupRecord {
            message_id: *id,
            message_name: name.clone(),
            processed_at: Utc::now(),
        });
        Ok(false)
    }

    async fn commit(&self, mut tx: Self::Transaction) -> Result<(), Self::Error> {
        if let Some(record) = tx.staged.take() {
            let mut inner = lock(&self.inner);
            inner.reserved.remove(&record.message_id);
            inner.committed.insert(record.message_id, record);
        }
        Ok(())
    }

    async fn rollback(&self, mut tx: Self::Transaction) -> Result<(), Self::Error> {
        if let Some(record) = tx.staged.take() {
            lock(&self.inner).reserved.remove(&record.message_id);
        }
        Ok(())
    }
}
