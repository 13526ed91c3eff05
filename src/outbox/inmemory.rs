use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::outbox::{
    AppendEvents, LeaseEvents, NewOutboxRecord, OutboxRecord, WorkerPartition, partition_of,
};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// An in-memory outbox for testing or local usage.
///
/// Supports the full store contract: transactional append (staged until
/// commit, discarded on rollback), row leasing with expiry, retry release,
/// and a dead-letter area.
#[derive(Clone)]
pub struct InMemoryOutbox {
    inner: Arc<Mutex<Inner>>,
    partition: WorkerPartition,
    lease: Duration,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    records: BTreeMap<i64, StoredRecord>,
    dead_letters: Vec<DeadLetter>,
}

struct StoredRecord {
    record: OutboxRecord,
    partition: i32,
    leased_until: Option<DateTime<Utc>>,
}

/// A record moved out of the live outbox after exhausting its retries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub record: OutboxRecord,
    pub reason: String,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            partition: WorkerPartition::default(),
            lease: DEFAULT_LEASE,
        }
    }

    /// Restrict this handle to the given worker partition slot.
    pub fn with_partition(mut self, partition: WorkerPartition) -> Self {
        self.partition = partition;
        self
    }

    /// Override the lease duration (tests shorten it to exercise expiry).
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Open a staging transaction.
    pub async fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }
    }

    /// Snapshot of delivered records, in delivery order.
    pub async fn delivered(&self) -> Vec<OutboxRecord> {
        let inner = self.inner.lock().await;
        let mut delivered: Vec<_> = inner
            .records
            .values()
            .filter(|s| s.record.delivered_at.is_some())
            .map(|s| s.record.clone())
            .collect();
        delivered.sort_by_key(|r| r.delivered_at);
        delivered
    }

    /// Snapshot of dead-lettered records.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().await.dead_letters.clone()
    }

    /// Count of rows still awaiting delivery.
    pub async fn pending(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .records
            .values()
            .filter(|s| s.record.delivered_at.is_none())
            .count()
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Staging transaction for [`InMemoryOutbox`].
///
/// Appended records become visible only on [`commit`](Self::commit).
/// Dropping the transaction (or calling [`rollback`](Self::rollback))
/// discards everything staged, mirroring a database rollback.
pub struct InMemoryTransaction {
    inner: Arc<Mutex<Inner>>,
    staged: Vec<(String, NewOutboxRecord)>,
}

impl InMemoryTransaction {
    pub async fn commit(self) {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        for (queue, new) in self.staged {
            inner.next_id += 1;
            let id = inner.next_id;
            let partition = partition_of(&new.stamps);
            inner.records.insert(
                id,
                StoredRecord {
                    record: OutboxRecord {
                        id,
                        queue_name: queue,
                        body: new.body,
                        stamps: new.stamps,
                        created_at: now,
                        available_at: new.available_at.unwrap_or(now),
                        delivered_at: None,
                        attempts: 0,
                    },
                    partition,
                    leased_until: None,
                },
            );
        }
    }

    pub fn rollback(self) {}
}

/// Error type for [`InMemoryOutbox`] operations.
#[derive(Debug)]
pub struct InMemoryOutboxError {
    kind: InMemoryOutboxErrorKind,
}

#[derive(Debug)]
enum InMemoryOutboxErrorKind {
    NotFound(i64),
}

impl InMemoryOutboxError {
    fn not_found(id: i64) -> Self {
        Self {
            kind: InMemoryOutboxErrorKind::NotFound(id),
        }
    }
}

impl std::fmt::Display for InMemoryOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryOutboxErrorKind::NotFound(id) => {
                write!(f, "Record {id} not found in in-memory driver")
            }
        }
    }
}

impl std::error::Error for InMemoryOutboxError {}

#[async_trait]
impl AppendEvents for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Transaction<'a> = InMemoryTransaction;

    /// Stage records on the transaction; they land in the store on commit.
    async fn append(
        &self,
        queue: &str,
        records: Vec<NewOutboxRecord>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        tx.staged
            .extend(records.into_iter().map(|r| (queue.to_owned(), r)));
        Ok(())
    }
}

#[async_trait]
impl LeaseEvents for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn claim_batch(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, Self::Error> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let lease_until = now + self.lease;

        // Partitions whose oldest undelivered row is leased or backing off.
        // Later rows of such a partition must wait for their head, or retries
        // would reorder the partition.
        let mut blocked = HashSet::new();

        let mut claimed = Vec::new();
        for stored in inner.records.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if stored.record.queue_name != queue
                || stored.record.delivered_at.is_some()
                || !self.partition.owns(stored.partition)
            {
                continue;
            }
            if blocked.contains(&stored.partition) {
                continue;
            }
            let leased = stored.leased_until.is_some_and(|until| until > now);
            if leased || stored.record.available_at > now {
                blocked.insert(stored.partition);
                continue;
            }
            stored.leased_until = Some(lease_until);
            claimed.push(stored.record.clone());
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: i64) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .records
            .get_mut(&id)
            .ok_or(InMemoryOutboxError::not_found(id))?;
        stored.record.delivered_at = Some(Utc::now());
        stored.leased_until = None;
        Ok(())
    }

    async fn release(&self, id: i64, retry_in: Duration) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .records
            .get_mut(&id)
            .ok_or(InMemoryOutboxError::not_found(id))?;
        stored.record.attempts += 1;
        stored.record.available_at = Utc::now() + retry_in;
        stored.leased_until = None;
        Ok(())
    }

    async fn unclaim(&self, id: i64) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .records
            .get_mut(&id)
            .ok_or(InMemoryOutboxError::not_found(id))?;
        stored.leased_until = None;
        Ok(())
    }

    async fn dead_letter(&self, id: i64, reason: &str) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .records
            .remove(&id)
            .ok_or(InMemoryOutboxError::not_found(id))?;
        inner.dead_letters.push(DeadLetter {
            record: stored.record,
            reason: reason.to_owned(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, MessageName};
    use crate::outbox::Outbox;

    fn stamped(name: &str, key: &str, value: u32) -> Envelope<serde_json::Value> {
        Envelope::new(serde_json::json!({ "value": value }))
            .with_message_name(MessageName::parse(name).unwrap())
            .with_partition_key(key)
    }

    async fn append_all(store: &InMemoryOutbox, envelopes: Vec<Envelope<serde_json::Value>>) {
        let outbox = Outbox::new(store.clone());
        let mut tx = store.begin().await;
        outbox.append("orders", envelopes, &mut tx).await.unwrap();
        tx.commit().await;
    }

    #[tokio::test]
    async fn claim_returns_records_in_append_order() {
        let store = InMemoryOutbox::new();
        append_all(
            &store,
            vec![stamped("order.placed", "k", 1), stamped("order.placed", "k", 2)],
        )
        .await;

        let batch = store.claim_batch("orders", 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].id < batch[1].id);
        assert_eq!(batch[0].body["value"], 1);
    }

    #[tokio::test]
    async fn claimed_rows_are_invisible_to_concurrent_claims() {
        let store = InMemoryOutbox::new();
        append_all(&store, vec![stamped("order.placed", "k", 1)]).await;

        let first = store.claim_batch("orders", 10).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = store.claim_batch("orders", 10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn released_rows_become_claimable_after_backoff() {
        let store = InMemoryOutbox::new();
        append_all(&store, vec![stamped("order.placed", "k", 1)]).await;

        let batch = store.claim_batch("orders", 10).await.unwrap();
        store.release(batch[0].id, Duration::ZERO).await.unwrap();

        let retried = store.claim_batch("orders", 10).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].attempts, 1);
    }

    #[tokio::test]
    async fn backing_off_head_blocks_the_rest_of_its_partition() {
        let store = InMemoryOutbox::new();
        append_all(
            &store,
            vec![stamped("order.placed", "k", 1), stamped("order.placed", "k", 2)],
        )
        .await;

        let batch = store.claim_batch("orders", 10).await.unwrap();
        // Head fails and backs off; the second row is handed back untouched.
        store
            .release(batch[0].id, Duration::from_secs(3600))
            .await
            .unwrap();
        store.unclaim(batch[1].id).await.unwrap();

        // The later row must not be claimable ahead of its backing-off head.
        assert!(store.claim_batch("orders", 10).await.unwrap().is_empty());

        // A different partition is unaffected.
        append_all(&store, vec![stamped("order.placed", "other", 3)]).await;
        let other = store.claim_batch("orders", 10).await.unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].body["value"], 3);
    }

    #[tokio::test]
    async fn delivered_rows_are_never_claimed_again() {
        let store = InMemoryOutbox::new();
        append_all(&store, vec![stamped("order.placed", "k", 1)]).await;

        let batch = store.claim_batch("orders", 10).await.unwrap();
        store.mark_delivered(batch[0].id).await.unwrap();

        assert!(store.claim_batch("orders", 10).await.unwrap().is_empty());
        assert_eq!(store.delivered().await.len(), 1);
    }

    #[tokio::test]
    async fn delayed_rows_stay_hidden_until_available() {
        let store = InMemoryOutbox::new();
        let outbox = Outbox::new(store.clone());

        let mut tx = store.begin().await;
        outbox
            .append_at(
                "orders",
                vec![stamped("order.placed", "k", 1)],
                Some(Utc::now() + Duration::from_secs(3600)),
                &mut tx,
            )
            .await
            .unwrap();
        tx.commit().await;

        assert!(store.claim_batch("orders", 10).await.unwrap().is_empty());
        assert_eq!(store.pending().await, 1);
    }

    #[tokio::test]
    async fn dead_letter_removes_the_row_from_the_live_set() {
        let store = InMemoryOutbox::new();
        append_all(&store, vec![stamped("order.placed", "k", 1)]).await;

        let batch = store.claim_batch("orders", 10).await.unwrap();
        store.dead_letter(batch[0].id, "publish failed").await.unwrap();

        assert!(store.claim_batch("orders", 10).await.unwrap().is_empty());
        let dead = store.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "publish failed");
    }

    #[tokio::test]
    async fn workers_claim_disjoint_partitions() {
        let base = InMemoryOutbox::new();
        append_all(
            &base,
            vec![
                stamped("order.placed", "order-1", 1),
                stamped("order.placed", "order-2", 2),
                stamped("order.placed", "order-3", 3),
                stamped("order.placed", "order-4", 4),
            ],
        )
        .await;

        let worker_a = base.clone().with_partition(WorkerPartition { id: 0, total: 2 });
        let worker_b = base.clone().with_partition(WorkerPartition { id: 1, total: 2 });

        let a = worker_a.claim_batch("orders", 10).await.unwrap();
        let b = worker_b.claim_batch("orders", 10).await.unwrap();

        assert_eq!(a.len() + b.len(), 4);
        for record in &a {
            assert!(!b.iter().any(|r| r.id == record.id));
        }
    }

    #[tokio::test]
    async fn same_partition_key_lands_on_one_worker() {
        let base = InMemoryOutbox::new();
        append_all(
            &base,
            vec![
                stamped("order.placed", "order-42", 1),
                stamped("order.placed", "order-42", 2),
            ],
        )
        .await;

        let worker_a = base.clone().with_partition(WorkerPartition { id: 0, total: 2 });
        let worker_b = base.clone().with_partition(WorkerPartition { id: 1, total: 2 });

        let a = worker_a.claim_batch("orders", 10).await.unwrap();
        let b = worker_b.claim_batch("orders", 10).await.unwrap();

        // Both rows hash to the same partition, so exactly one worker owns them.
        assert!(a.len() == 2 && b.is_empty() || b.len() == 2 && a.is_empty());
    }
}
