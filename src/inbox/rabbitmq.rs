//! RabbitMQ delivery adapter for the inbox pipeline.

use std::collections::BTreeMap;

use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::types::AMQPValue;

use crate::inbox::{DedupStore, HandleMessage, InboxOutcome, InboxPipeline, IncomingMessage};

/// Run one RabbitMQ delivery through the pipeline and settle it.
///
/// Settlement follows the pipeline outcome:
/// - `Processed` and `Duplicate` acknowledge the delivery
/// - `Rejected` negatively acknowledges without requeue, handing the
///   message to the queue's dead-letter exchange if one is configured
/// - a pipeline error negatively acknowledges with requeue, so transient
///   store or handler failures are retried
#[tracing::instrument(skip_all, fields(queue = %queue))]
pub async fn handle_delivery<D, F>(
    pipeline: &InboxPipeline<D, F>,
    queue: &str,
    delivery: Delivery,
) -> Result<InboxOutcome, tower::BoxError>
where
    D: DedupStore + Send + Sync,
    D::Transaction: Send,
    F: HandleMessage<D::Transaction> + Send + Sync,
{
    let incoming = IncomingMessage {
        queue: queue.to_owned(),
        headers: string_headers(&delivery),
        body: delivery.data.clone(),
    };

    match pipeline.process(incoming).await {
        Ok(outcome) => {
            match &outcome {
                InboxOutcome::Processed | InboxOutcome::Duplicate => {
                    delivery.ack(BasicAckOptions::default()).await?;
                }
                InboxOutcome::Rejected(violation) => {
                    tracing::warn!(%violation, "Discarding malformed delivery");
                    delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await?;
                }
            }
            Ok(outcome)
        }
        Err(err) => {
            delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await?;
            Err(err.into())
        }
    }
}

/// AMQP headers carried as strings. Non-string values are ignored; the
/// stamp headers this pipeline reads are always long strings.
fn string_headers(delivery: &Delivery) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            match value {
                AMQPValue::LongString(s) => {
                    headers.insert(key.to_string(), s.to_string());
                }
                AMQPValue::ShortString(s) => {
                    headers.insert(key.to_string(), s.to_string());
                }
                _ => {}
            }
        }
    }
    headers
}
