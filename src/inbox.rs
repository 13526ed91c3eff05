//! Inbox deduplication: idempotent consumption of broker messages.
//!
//! This module implements the *inbox pattern*. Before a business handler
//! runs, the message identity is recorded in a deduplication store whose
//! unique constraint is the sole correctness mechanism: a failed insert means
//! the message was already processed and the handler is skipped. The insert
//! and the handler share one transaction, so the "processed" fact and the
//! business effect commit (or roll back) together.
//!
//! The pipeline stage order is a fixed, visible contract:
//!
//! 1. extract stamps from the wire headers
//! 2. reject protocol violations (no identity, malformed stamp or payload)
//! 3. begin the transaction
//! 4. deduplication check (insert-or-conflict)
//! 5. business handler
//! 6. commit
//!
//! ## Components
//!
//! - [`InboxPipeline`]: the consumption interceptor
//! - [`DedupStore`]: trait for transactional deduplication backends
//! - [`HandleMessage`]: the business handler seam
//!
//! Concrete stores are provided by [`inmemory`] and [`sqlx`] (feature-gated);
//! a RabbitMQ delivery adapter lives in [`rabbitmq`].

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::collections::BTreeMap;

use tracing_error::SpanTrace;

use crate::envelope::{Envelope, MessageId, MessageName};
use crate::publish::{MESSAGE_ID_HEADER, PARTITION_KEY_HEADER, TYPE_HEADER, decode_message_id_stamp};

/// A broker message as received from the transport, before any validation.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    /// The queue this message was consumed from.
    pub queue: String,
    /// Wire headers (stamp headers plus anything the broker added).
    pub headers: BTreeMap<String, String>,
    /// JSON-encoded business payload.
    pub body: Vec<u8>,
}

/// Result of pushing one incoming message through the pipeline.
#[derive(Debug)]
pub enum InboxOutcome {
    /// The handler ran and the transaction committed.
    Processed,
    /// The message identity was seen before; the handler was not invoked.
    Duplicate,
    /// The message violated the wire protocol and must be negatively
    /// acknowledged without requeueing.
    Rejected(ProtocolViolation),
}

/// Ways an incoming message can violate the wire protocol.
///
/// Protocol violations are surfaced before the deduplicator runs and are
/// never retried: redelivering a malformed message cannot fix it.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
    MissingMessageId,
    MalformedMessageId(String),
    MissingMessageName,
    InvalidMessageName(String),
    MalformedPayload(String),
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMessageId => write!(f, "Message carries no identity stamp"),
            Self::MalformedMessageId(raw) => write!(f, "Malformed identity stamp: {raw}"),
            Self::MissingMessageName => write!(f, "Message carries no type header"),
            Self::InvalidMessageName(raw) => write!(f, "Invalid message name: {raw}"),
            Self::MalformedPayload(err) => write!(f, "Malformed payload: {err}"),
        }
    }
}

/// Trait for transactional deduplication backends.
///
/// `check_and_record` must insert the deduplication record and report a
/// uniqueness conflict as `true` — never a read-then-write check, which
/// would race under concurrent redelivery.
#[async_trait::async_trait]
pub trait DedupStore {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;
    /// Transaction shared with the business handler.
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;

    /// Record the identity; returns `true` if it was already recorded.
    async fn check_and_record(
        &self,
        tx: &mut Self::Transaction,
        id: &MessageId,
        name: &MessageName,
    ) -> Result<bool, Self::Error>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error>;
}

/// Business handler seam.
///
/// The handler receives the stamped envelope and the open transaction; its
/// effects commit atomically with the deduplication record.
#[async_trait::async_trait]
pub trait HandleMessage<Tx>: Send + Sync {
    async fn handle(
        &self,
        envelope: &Envelope<serde_json::Value>,
        tx: &mut Tx,
    ) -> Result<(), tower::BoxError>;
}

/// The inbox consumption interceptor.
///
/// Constructed from its two collaborators; the stage order is fixed (see the
/// module docs) rather than assembled from prioritized middleware.
pub struct InboxPipeline<D, F> {
    dedup: D,
    handler: F,
}

impl<D, F> InboxPipeline<D, F>
where
    D: DedupStore + Send + Sync,
    F: HandleMessage<D::Transaction>,
{
    pub fn new(dedup: D, handler: F) -> Self {
        Self { dedup, handler }
    }

    /// Push one incoming message through the pipeline.
    ///
    /// Returns `Ok` for every settled outcome, including rejections and
    /// duplicates; `Err` means a store or handler failure rolled the
    /// transaction back and the message should be redelivered.
    #[tracing::instrument(skip(self, incoming), fields(queue = %incoming.queue))]
    pub async fn process(&self, incoming: IncomingMessage) -> Result<InboxOutcome, InboxError> {
        let envelope = match extract_envelope(&incoming) {
            Ok(envelope) => envelope,
            Err(violation) => {
                tracing::warn!(%violation, "Rejecting message before deduplication");
                return Ok(InboxOutcome::Rejected(violation));
            }
        };

        // extract_envelope guarantees both stamps.
        let id = envelope
            .message_id()
            .copied()
            .ok_or_else(|| InboxError::store("envelope lost its identity stamp".into()))?;
        let name = envelope
            .message_name()
            .cloned()
            .ok_or_else(|| InboxError::store("envelope lost its name stamp".into()))?;

        let mut tx = self
            .dedup
            .begin()
            .await
            .map_err(|e| InboxError::store(e.into()))?;

        let duplicate = match self.dedup.check_and_record(&mut tx, &id, &name).await {
            Ok(duplicate) => duplicate,
            Err(e) => {
                let _ = self.dedup.rollback(tx).await;
                return Err(InboxError::store(e.into()));
            }
        };

        if duplicate {
            self.dedup
                .rollback(tx)
                .await
                .map_err(|e| InboxError::store(e.into()))?;
            tracing::debug!(message_id = %id, "Duplicate message skipped");
            return Ok(InboxOutcome::Duplicate);
        }

        if let Err(e) = self.handler.handle(&envelope, &mut tx).await {
            // Roll the dedup record back with the handler's effects so the
            // redelivered message is retried.
            let _ = self.dedup.rollback(tx).await;
            return Err(InboxError::handler(e));
        }

        self.dedup
            .commit(tx)
            .await
            .map_err(|e| InboxError::store(e.into()))?;

        Ok(InboxOutcome::Processed)
    }
}

/// Validate wire headers and body, producing a fully stamped envelope.
fn extract_envelope(
    incoming: &IncomingMessage,
) -> Result<Envelope<serde_json::Value>, ProtocolViolation> {
    let raw_id = incoming
        .headers
        .get(MESSAGE_ID_HEADER)
        .ok_or(ProtocolViolation::MissingMessageId)?;
    let id = decode_message_id_stamp(raw_id)
        .map_err(|_| ProtocolViolation::MalformedMessageId(raw_id.clone()))?;

    let raw_name = incoming
        .headers
        .get(TYPE_HEADER)
        .ok_or(ProtocolViolation::MissingMessageName)?;
    let name = MessageName::parse(raw_name.clone())
        .map_err(|_| ProtocolViolation::InvalidMessageName(raw_name.clone()))?;

    let body: serde_json::Value = serde_json::from_slice(&incoming.body)
        .map_err(|e| ProtocolViolation::MalformedPayload(e.to_string()))?;

    let mut envelope = Envelope::unstamped(body)
        .with_message_id(id)
        .with_message_name(name)
        .with_source_queue(&incoming.queue);

    if let Some(raw_key) = incoming.headers.get(PARTITION_KEY_HEADER) {
        // The partition key stamp is informational on the consuming side; a
        // malformed one does not reject the message.
        if let Ok(stamp) = serde_json::from_str::<serde_json::Value>(raw_key) {
            if let Some(key) = stamp.get("partitionKey").and_then(|v| v.as_str()) {
                envelope = envelope.with_partition_key(key);
            }
        }
    }

    Ok(envelope)
}

/// Error returned when the pipeline fails after validation.
#[derive(Debug)]
pub struct InboxError {
    context: SpanTrace,
    kind: InboxErrorKind,
}

/// Kinds of inbox errors.
#[derive(Debug)]
pub enum InboxErrorKind {
    /// The deduplication store failed.
    Store(tower::BoxError),
    /// The business handler failed; the transaction was rolled back.
    Handler(tower::BoxError),
}

impl InboxError {
    fn store(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InboxErrorKind::Store(err),
        }
    }

    fn handler(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InboxErrorKind::Handler(err),
        }
    }

    pub fn kind(&self) -> &InboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for InboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InboxErrorKind::Store(err) => writeln!(f, "Dedup store error: {err}"),
            InboxErrorKind::Handler(err) => writeln!(f, "Handler error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for InboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            InboxErrorKind::Store(err) => Some(err.as_ref()),
            InboxErrorKind::Handler(err) => Some(err.as_ref()),
        }
    }
}
