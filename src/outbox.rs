//! Outbox abstractions and backend drivers.
//!
//! This module implements the *outbox pattern*: events are persisted in the
//! same transaction as the business state change that produced them, then
//! forwarded asynchronously to the broker by dispatcher workers.
//!
//! The outbox is responsible for **durability and ordering**; delivery
//! concerns are delegated to the dispatcher and publisher layers.
//!
//! ## Components
//!
//! - [`Outbox`]: high-level façade that stamps, serializes, and appends
//! - [`AppendEvents`]: trait for transactional insertion
//! - [`LeaseEvents`]: trait for claiming, acknowledging, and releasing rows
//! - [`dispatcher::Dispatcher`]: the claim/publish/ack worker loop
//!
//! Concrete drivers are provided by backend modules such as [`inmemory`] and
//! [`sqlx`] (feature-gated).

pub mod dispatcher;
pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, Utc};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::envelope::{Envelope, Stamps};

/// Error returned by outbox operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Kinds of outbox errors.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// Errors originating from the storage backend.
    Backend(tower::BoxError),
    /// Payload serialization failure.
    Serde(serde_json::Error),
    /// An envelope reached the outbox without a required stamp.
    MissingStamp(&'static str),
}

impl OutboxError {
    /// Create a backend-related outbox error.
    pub(crate) fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Backend(err),
        }
    }

    pub(crate) fn serde(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Serde(err),
        }
    }

    pub(crate) fn missing_stamp(stamp: &'static str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::MissingStamp(stamp),
        }
    }

    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
            OutboxErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            OutboxErrorKind::MissingStamp(stamp) => {
                writeln!(f, "Envelope is missing required stamp: {stamp}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::Backend(err) => Some(err.as_ref()),
            OutboxErrorKind::Serde(err) => Some(err),
            OutboxErrorKind::MissingStamp(_) => None,
        }
    }
}

/// Row persisted in the outbox.
///
/// Created by a business-transaction commit, mutated only by the dispatcher
/// (claim, then mark delivered or release). Never updated by business code
/// after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Store-assigned, monotonic identifier.
    pub id: i64,
    /// Logical destination within the store.
    pub queue_name: String,
    /// JSON-serialized business payload.
    pub body: serde_json::Value,
    /// Stamps recorded at append time.
    pub stamps: Stamps,
    pub created_at: DateTime<Utc>,
    /// Supports delayed delivery and retry backoff.
    pub available_at: DateTime<Utc>,
    /// Null until the broker acknowledged the publish.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Number of failed delivery attempts so far.
    pub attempts: u32,
}

impl OutboxRecord {
    /// Rebuild the envelope carried by this record.
    pub fn envelope(&self) -> Envelope<serde_json::Value> {
        Envelope::from_parts(self.stamps.clone(), self.body.clone())
    }
}

/// A stamped, serialized event ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    pub body: serde_json::Value,
    pub stamps: Stamps,
    /// Earliest instant the dispatcher may claim the row.
    pub available_at: Option<DateTime<Utc>>,
}

/// High-level façade over an outbox backend.
///
/// `Outbox` validates stamps, serializes payloads, and delegates persistence
/// to the underlying driver. It is the only entry point business code uses.
#[derive(Clone)]
pub struct Outbox<D>(D);

impl<D> Outbox<D> {
    /// Create a new outbox backed by the given driver.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// Append events to the outbox inside the caller's transaction.
    ///
    /// Events are persisted but **not** sent; delivery happens asynchronously
    /// in a [`dispatcher::Dispatcher`]. Every envelope must carry a message
    /// id and a message name before it is durably stored.
    #[instrument(skip(self, envelopes, tx))]
    pub async fn append<M>(
        &self,
        queue: &str,
        envelopes: impl IntoIterator<Item = Envelope<M>>,
        tx: &mut D::Transaction<'_>,
    ) -> Result<(), OutboxError>
    where
        M: serde::Serialize,
        D: AppendEvents,
        D::Error: Into<tower::BoxError>,
    {
        self.append_at(queue, envelopes, None, tx).await
    }

    /// Append events that become claimable only at `available_at`.
    #[instrument(skip(self, envelopes, tx))]
    pub async fn append_at<M>(
        &self,
        queue: &str,
        envelopes: impl IntoIterator<Item = Envelope<M>>,
        available_at: Option<DateTime<Utc>>,
        tx: &mut D::Transaction<'_>,
    ) -> Result<(), OutboxError>
    where
        M: serde::Serialize,
        D: AppendEvents,
        D::Error: Into<tower::BoxError>,
    {
        let mut records = Vec::new();
        for envelope in envelopes {
            if envelope.message_id().is_none() {
                return Err(OutboxError::missing_stamp("message_id"));
            }
            if envelope.message_name().is_none() {
                return Err(OutboxError::missing_stamp("message_name"));
            }
            let (stamps, message) = envelope.into_parts();
            let body = serde_json::to_value(&message).map_err(OutboxError::serde)?;
            records.push(NewOutboxRecord {
                body,
                stamps,
                available_at,
            });
        }

        self.0
            .append(queue, records, tx)
            .await
            .map_err(|e| OutboxError::backend(e.into()))
    }
}

/// Trait for inserting events into the outbox.
///
/// Implementations must execute inside the caller's existing transaction and
/// fail only on constraint or storage errors, never silently dropping data.
#[async_trait::async_trait]
pub trait AppendEvents {
    /// Backend-specific error type.
    type Error;
    /// Transaction type used for atomic insertion.
    type Transaction<'a>: Send;

    /// Insert a batch of stamped, serialized events.
    async fn append(
        &self,
        queue: &str,
        records: Vec<NewOutboxRecord>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;
}

/// Trait for the dispatcher side of the outbox: leasing rows and closing
/// leases.
///
/// `claim_batch` must be atomic so concurrent dispatchers never claim the
/// same row; drivers use non-blocking skip-over-locked semantics (or an
/// equivalent) plus partition assignment so a given partition is processed by
/// a single worker at a time.
#[async_trait::async_trait]
pub trait LeaseEvents {
    /// Backend-specific error type.
    type Error;

    /// Atomically lease up to `limit` undelivered, available rows.
    ///
    /// Rows are returned in append (id) order.
    async fn claim_batch(&self, queue: &str, limit: usize)
    -> Result<Vec<OutboxRecord>, Self::Error>;

    /// Close the lease after a broker acknowledgement.
    async fn mark_delivered(&self, id: i64) -> Result<(), Self::Error>;

    /// Release the lease after a failure, making the row claimable again
    /// after `retry_in`. Bumps the attempt counter.
    async fn release(&self, id: i64, retry_in: std::time::Duration) -> Result<(), Self::Error>;

    /// Return a claimed row untouched, without recording a failed attempt.
    ///
    /// Used for rows held back to preserve partition ordering and for leases
    /// returned on shutdown.
    async fn unclaim(&self, id: i64) -> Result<(), Self::Error>;

    /// Move a row that exhausted its retries to the dead-letter store.
    async fn dead_letter(&self, id: i64, reason: &str) -> Result<(), Self::Error>;
}

/// Static partition assignment for a dispatcher worker.
///
/// A worker only claims rows whose partition hashes into its slot, so rows
/// sharing a partition key are always dispatched by a single worker at a
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPartition {
    pub id: u32,
    pub total: u32,
}

impl Default for WorkerPartition {
    /// A single worker that owns every partition.
    fn default() -> Self {
        Self { id: 0, total: 1 }
    }
}

impl WorkerPartition {
    pub(crate) fn owns(&self, partition: i32) -> bool {
        partition.rem_euclid(self.total as i32) == self.id as i32
    }
}

/// Calculates the storage partition for a stamp set.
///
/// Envelopes without a partition key fall back to their message id, so they
/// spread across workers without imposing mutual ordering.
pub(crate) fn partition_of(stamps: &Stamps) -> i32 {
    use std::hash::Hasher;

    let mut hasher = ahash::AHasher::default();
    match (&stamps.partition_key, &stamps.message_id) {
        (Some(key), _) => hasher.write(key.as_str().as_bytes()),
        (None, Some(id)) => hasher.write(id.as_uuid().as_bytes()),
        (None, None) => {}
    }
    (hasher.finish() % i32::MAX as u64) as i32
}
