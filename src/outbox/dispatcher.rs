//! Dispatcher loop forwarding outbox rows to the broker.
//!
//! A dispatcher worker repeatedly claims a batch of leased rows, resolves
//! each row's route, publishes it, and marks it delivered. A publish failure
//! releases the lease for retry with exponential backoff; rows that exhaust
//! their retries are moved to the dead-letter store.
//!
//! Rows sharing a partition are processed serially and in append order;
//! combined with the store's partition-aware leasing this gives per-partition
//! FIFO into the broker even with multiple concurrent workers.
//!
//! The loop runs until cancelled. Cancellation is honored between batches,
//! and every row claimed by the current batch is settled (delivered,
//! released, or dead-lettered) before the worker stops, so no lease is left
//! dangling.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::outbox::{LeaseEvents, OutboxRecord, partition_of};
use crate::publish::{Publish, PublisherRegistry, WireMessage};
use crate::routing::RoutingResolver;

/// Tuning knobs for a dispatcher worker.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Logical outbox queue this worker drains.
    pub queue: String,
    /// Maximum rows claimed per poll.
    pub batch_size: usize,
    /// Delay between polls when the outbox is drained.
    pub poll_interval: Duration,
    /// Attempts before a row is dead-lettered.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base: Duration,
    /// Consecutive store failures tolerated before the worker gives up.
    pub max_store_failures: u32,
}

impl DispatcherConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            max_attempts: 5,
            retry_base: Duration::from_millis(200),
            max_store_failures: 10,
        }
    }

    /// Backoff before the given retry attempt (doubles per attempt).
    fn backoff(&self, attempts: u32) -> Duration {
        self.retry_base
            .saturating_mul(2u32.saturating_pow(attempts.min(16)))
    }
}

/// A dispatcher worker.
///
/// Generic parameters:
/// - `S`: outbox store (lease side)
/// - `P`: publisher backend
/// - `HK`: lifecycle hook implementation
pub struct Dispatcher<S, P, HK = TracingDispatchHook> {
    store: S,
    resolver: RoutingResolver,
    publishers: PublisherRegistry<P>,
    config: DispatcherConfig,
    hook: HK,
}

impl<S, P> Dispatcher<S, P, TracingDispatchHook> {
    /// Create a dispatcher with the default tracing hook.
    pub fn new(
        store: S,
        resolver: RoutingResolver,
        publishers: PublisherRegistry<P>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            publishers,
            config,
            hook: TracingDispatchHook,
        }
    }
}

impl<S, P, HK> Dispatcher<S, P, HK>
where
    S: LeaseEvents + Send + Sync,
    S::Error: Into<tower::BoxError>,
    P: Publish + Send + Sync,
    HK: DispatchHook,
{
    /// Replace the lifecycle hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: DispatchHook>(self, hook: HK2) -> Dispatcher<S, P, HK2> {
        Dispatcher {
            store: self.store,
            resolver: self.resolver,
            publishers: self.publishers,
            config: self.config,
            hook,
        }
    }

    /// Run the dispatch loop until cancelled.
    ///
    /// Transient store errors are retried with the poll cadence; the loop
    /// only fails after `max_store_failures` consecutive claim errors.
    #[tracing::instrument(skip(self, cancel), fields(queue = %self.config.queue))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DispatcherError> {
        self.hook.on_startup();

        let mut store_failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                self.hook.on_shutdown();
                return Ok(());
            }

            let batch = match self
                .store
                .claim_batch(&self.config.queue, self.config.batch_size)
                .await
            {
                Ok(batch) => {
                    store_failures = 0;
                    batch
                }
                Err(e) => {
                    let e = e.into();
                    self.hook.on_store_error(e.as_ref());
                    store_failures += 1;
                    if store_failures >= self.config.max_store_failures {
                        return Err(DispatcherError::store(e));
                    }
                    Vec::new()
                }
            };

            let drained = batch.is_empty();
            if !drained {
                self.hook.on_claimed(batch.len());
                self.dispatch_batch(batch).await?;
            }

            if drained {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.hook.on_shutdown();
                        return Ok(());
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    /// Dispatch one claimed batch, partition by partition.
    ///
    /// Rows arrive in append order; grouping preserves that order inside each
    /// partition. A failure stops the failing partition for this batch (the
    /// remaining rows are released untouched) but other partitions continue.
    async fn dispatch_batch(&self, batch: Vec<OutboxRecord>) -> Result<(), DispatcherError> {
        let mut partitions: Vec<(i32, Vec<OutboxRecord>)> = Vec::new();
        for record in batch {
            let partition = partition_of(&record.stamps);
            match partitions.iter_mut().find(|(p, _)| *p == partition) {
                Some((_, records)) => records.push(record),
                None => partitions.push((partition, vec![record])),
            }
        }

        for (_, records) in partitions {
            let mut records = records.into_iter();
            while let Some(record) = records.next() {
                if !self.dispatch_record(record).await? {
                    // Preserve FIFO: later rows of this partition must not
                    // overtake the failed one.
                    for held in records {
                        self.store
                            .unclaim(held.id)
                            .await
                            .map_err(|e| DispatcherError::store(e.into()))?;
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Publish a single record. Returns whether its partition may continue.
    async fn dispatch_record(&self, record: OutboxRecord) -> Result<bool, DispatcherError> {
        let Some(name) = record.stamps.message_name.clone() else {
            // Can only happen if a row was written outside the append façade.
            self.settle_dead_letter(&record, "record has no message name")
                .await?;
            return Ok(true);
        };

        let route = self.resolver.resolve(&name);

        let publisher = match self.publishers.get(&route.destination) {
            Ok(publisher) => publisher,
            Err(e) => {
                self.settle_dead_letter(&record, &e.to_string()).await?;
                return Ok(true);
            }
        };

        let wire = match WireMessage::from_record(&record, &route) {
            Ok(wire) => wire,
            Err(e) => {
                self.settle_dead_letter(&record, &e.to_string()).await?;
                return Ok(true);
            }
        };

        match publisher.publish(wire).await {
            Ok(()) => {
                self.store
                    .mark_delivered(record.id)
                    .await
                    .map_err(|e| DispatcherError::store(e.into()))?;
                self.hook.on_delivered(&record);
                Ok(true)
            }
            Err(e) => {
                let e = e.into();
                self.hook.on_publish_error(&record, e.as_ref());

                if record.attempts + 1 >= self.config.max_attempts {
                    self.settle_dead_letter(&record, &format!("publish failed: {e}"))
                        .await?;
                } else {
                    self.settle_release(&record, self.config.backoff(record.attempts))
                        .await?;
                }
                Ok(false)
            }
        }
    }

    async fn settle_release(
        &self,
        record: &OutboxRecord,
        retry_in: Duration,
    ) -> Result<(), DispatcherError> {
        self.store
            .release(record.id, retry_in)
            .await
            .map_err(|e| DispatcherError::store(e.into()))?;
        self.hook.on_released(record, retry_in);
        Ok(())
    }

    async fn settle_dead_letter(
        &self,
        record: &OutboxRecord,
        reason: &str,
    ) -> Result<(), DispatcherError> {
        self.store
            .dead_letter(record.id, reason)
            .await
            .map_err(|e| DispatcherError::store(e.into()))?;
        self.hook.on_dead_lettered(record, reason);
        Ok(())
    }
}

/// Error returned when the dispatch loop fails.
#[derive(Debug)]
pub struct DispatcherError {
    context: SpanTrace,
    kind: DispatcherErrorKind,
}

/// Classification of dispatcher runtime errors.
#[derive(Debug)]
pub enum DispatcherErrorKind {
    /// The outbox store failed persistently.
    Store(tower::BoxError),
}

impl DispatcherError {
    fn store(error: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatcherErrorKind::Store(error),
        }
    }
}

impl std::fmt::Display for DispatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatcherErrorKind::Store(err) => writeln!(f, "Outbox store error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatcherErrorKind::Store(err) => Some(err.as_ref()),
        }
    }
}

/// Hook trait for observing dispatcher lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait DispatchHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_claimed(&self, count: usize);
    fn on_delivered(&self, record: &OutboxRecord);
    fn on_publish_error(&self, record: &OutboxRecord, error: &dyn std::error::Error);
    fn on_released(&self, record: &OutboxRecord, retry_in: Duration);
    fn on_dead_lettered(&self, record: &OutboxRecord, reason: &str);
    fn on_store_error(&self, error: &dyn std::error::Error);
}

/// Default hook implementation logging lifecycle events via `tracing`.
pub struct TracingDispatchHook;

impl DispatchHook for TracingDispatchHook {
    fn on_startup(&self) {
        tracing::info!("Dispatcher is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Dispatcher is shutting down");
    }

    fn on_claimed(&self, count: usize) {
        tracing::debug!(count, "Claimed outbox batch");
    }

    fn on_delivered(&self, record: &OutboxRecord) {
        tracing::info!(id = record.id, "Record delivered to broker");
    }

    fn on_publish_error(&self, record: &OutboxRecord, error: &dyn std::error::Error) {
        tracing::error!(id = record.id, ?error, "Error publishing record");
    }

    fn on_released(&self, record: &OutboxRecord, retry_in: Duration) {
        tracing::warn!(id = record.id, ?retry_in, "Lease released for retry");
    }

    fn on_dead_lettered(&self, record: &OutboxRecord, reason: &str) {
        tracing::error!(id = record.id, reason, "Record moved to dead letters");
    }

    fn on_store_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Outbox store error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, MessageName};
    use crate::outbox::inmemory::InMemoryOutbox;
    use crate::outbox::{Outbox, WorkerPartition};
    use crate::publish::inmemory::InMemoryPublisher;

    fn envelope(name: &str, key: &str, value: u32) -> Envelope<serde_json::Value> {
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

    fn config() -> DispatcherConfig {
        let mut config = DispatcherConfig::new("orders");
        config.poll_interval = Duration::from_millis(5);
        config.retry_base = Duration::ZERO;
        config
    }

    async fn run_until_drained(dispatcher: Dispatcher<InMemoryOutbox, InMemoryPublisher>, store: &InMemoryOutbox) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()));
        for _ in 0..200 {
            if store.pending().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn delivers_records_in_append_order_per_partition() {
        let store = InMemoryOutbox::new();
        append_all(
            &store,
            vec![
                envelope("order.placed", "order-42", 1),
                envelope("order.placed", "order-42", 2),
            ],
        )
        .await;

        let publisher = InMemoryPublisher::new();
        let dispatcher = Dispatcher::new(
            store.clone(),
            RoutingResolver::new(),
            PublisherRegistry::with_default(publisher.clone()),
            config(),
        );
        run_until_drained(dispatcher, &store).await;

        let sent = publisher.sent_messages().await;
        assert_eq!(sent.len(), 2);
        let first: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
        let second: serde_json::Value = serde_json::from_slice(&sent[1].body).unwrap();
        assert_eq!(first["value"], 1);
        assert_eq!(second["value"], 2);
        assert_eq!(sent[0].destination, "order");
        assert_eq!(sent[0].routing_key, "order.placed");
    }

    #[tokio::test]
    async fn same_partition_stays_ordered_under_two_workers() {
        let store = InMemoryOutbox::new();
        append_all(
            &store,
            vec![
                envelope("order.placed", "order-42", 1),
                envelope("order.placed", "order-42", 2),
            ],
        )
        .await;

        let publisher = InMemoryPublisher::new();
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for id in 0..2u32 {
            let worker_store = store
                .clone()
                .with_partition(WorkerPartition { id, total: 2 });
            let dispatcher = Dispatcher::new(
                worker_store,
                RoutingResolver::new(),
                PublisherRegistry::with_default(publisher.clone()),
                config(),
            );
            handles.push(tokio::spawn(dispatcher.run(cancel.clone())));
        }

        for _ in 0..200 {
            if store.pending().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let sent = publisher.sent_messages().await;
        assert_eq!(sent.len(), 2);
        let first: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
        let second: serde_json::Value = serde_json::from_slice(&sent[1].body).unwrap();
        assert_eq!(first["value"], 1);
        assert_eq!(second["value"], 2);
    }

    #[tokio::test]
    async fn publish_failure_releases_and_retries() {
        let store = InMemoryOutbox::new();
        append_all(&store, vec![envelope("order.placed", "order-42", 1)]).await;

        let publisher = InMemoryPublisher::new();
        publisher.fail_next(2).await;

        let dispatcher = Dispatcher::new(
            store.clone(),
            RoutingResolver::new(),
            PublisherRegistry::with_default(publisher.clone()),
            config(),
        );
        run_until_drained(dispatcher, &store).await;

        assert_eq!(publisher.sent_messages().await.len(), 1);
        assert_eq!(store.delivered().await.len(), 1);
        assert!(store.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_does_not_reorder_the_partition() {
        let store = InMemoryOutbox::new();
        append_all(
            &store,
            vec![
                envelope("order.placed", "order-42", 1),
                envelope("order.placed", "order-42", 2),
            ],
        )
        .await;

        let publisher = InMemoryPublisher::new();
        publisher.fail_next(1).await;

        let mut config = config();
        config.retry_base = Duration::from_millis(50);
        let dispatcher = Dispatcher::new(
            store.clone(),
            RoutingResolver::new(),
            PublisherRegistry::with_default(publisher.clone()),
            config,
        );
        run_until_drained(dispatcher, &store).await;

        // The second row must wait out the head's backoff instead of
        // overtaking it.
        let sent = publisher.sent_messages().await;
        assert_eq!(sent.len(), 2);
        let first: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
        let second: serde_json::Value = serde_json::from_slice(&sent[1].body).unwrap();
        assert_eq!(first["value"], 1);
        assert_eq!(second["value"], 2);
    }

    #[tokio::test]
    async fn exhausted_retries_move_the_record_to_dead_letters() {
        let store = InMemoryOutbox::new();
        append_all(&store, vec![envelope("order.placed", "order-42", 1)]).await;

        let publisher = InMemoryPublisher::new();
        publisher.fail_next(u32::MAX).await;

        let mut config = config();
        config.max_attempts = 3;
        let dispatcher = Dispatcher::new(
            store.clone(),
            RoutingResolver::new(),
            PublisherRegistry::with_default(publisher.clone()),
            config,
        );
        run_until_drained(dispatcher, &store).await;

        assert!(store.delivered().await.is_empty());
        let dead = store.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].record.attempts, 2);
        assert!(dead[0].reason.contains("publish failed"));
    }

    #[tokio::test]
    async fn unroutable_destination_is_dead_lettered_not_retried() {
        let store = InMemoryOutbox::new();
        append_all(&store, vec![envelope("order.placed", "order-42", 1)]).await;

        // Registry with no entries and no default: every destination is unknown.
        let registry: PublisherRegistry<InMemoryPublisher> =
            PublisherRegistry::from_entries(vec![]).unwrap();
        let dispatcher = Dispatcher::new(store.clone(), RoutingResolver::new(), registry, config());
        run_until_drained(dispatcher, &store).await;

        let dead = store.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("order"));
    }
}
