use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties,
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;

use crate::publish::{Publish, WireMessage};

/// RabbitMQ publisher.
///
/// Publishes to the exchange named by the message destination, with the
/// message headers mapped to AMQP headers. The channel is wrapped in
/// `Arc<Mutex<_>>` because `lapin::Channel` is not `Sync` and publishes may
/// be issued concurrently.
#[derive(Clone)]
pub struct RabbitMqPublisher {
    channel: Arc<Mutex<lapin::Channel>>,
}

impl RabbitMqPublisher {
    /// Creates a publisher on the given channel with publisher confirms
    /// enabled.
    pub async fn try_new(channel: lapin::Channel) -> Result<Self, lapin::Error> {
        channel
            .confirm_select(lapin::options::ConfirmSelectOptions::default())
            .await?;
        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
        })
    }
}

#[async_trait]
impl Publish for RabbitMqPublisher {
    type Error = lapin::Error;

    /// Publish a message to RabbitMQ.
    ///
    /// The call waits for both:
    /// - the publish to be sent
    /// - the broker confirmation (publisher confirms)
    #[tracing::instrument(skip_all, fields(destination = %message.destination, routing_key = %message.routing_key))]
    async fn publish(&self, message: WireMessage) -> Result<(), Self::Error> {
        let mut amqp_headers = FieldTable::default();
        for (key, value) in &message.headers {
            amqp_headers.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
        }

        let properties = BasicProperties::default().with_headers(amqp_headers);

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                &message.destination,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;

        Ok(())
    }
}
