//! RabbitMQ implementation of the topology client.

use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{
    Connection, ConnectionProperties, ExchangeKind,
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
};

use crate::topology::declare::TopologyClient;
use crate::topology::{BindingConfig, ExchangeConfig, ExchangeType, QueueConfig, sanitize_dsn};

/// AMQP reply code for a passive declare of a missing object.
const NOT_FOUND: u16 = 404;

/// Topology client backed by a RabbitMQ connection.
///
/// Existence is probed with passive declares. A failed passive declare
/// closes its channel, so every probe runs on a throwaway channel while
/// declarations go through a long-lived one.
pub struct RabbitMqTopology {
    connection: Connection,
    channel: lapin::Channel,
}

impl RabbitMqTopology {
    /// Connects to the broker. The DSN is sanitized before it appears in
    /// any log or error output.
    #[tracing::instrument(skip_all, fields(dsn = %sanitize_dsn(dsn)))]
    pub async fn connect(dsn: &str) -> Result<Self, lapin::Error> {
        let connection = Connection::connect(dsn, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        Ok(Self {
            connection,
            channel,
        })
    }

    /// True when a passive declare succeeded, false when the broker
    /// reported the object as missing.
    fn interpret_probe(result: Result<(), lapin::Error>) -> Result<bool, lapin::Error> {
        match result {
            Ok(()) => Ok(true),
            Err(lapin::Error::ProtocolError(err)) if err.get_id() == NOT_FOUND => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl TopologyClient for RabbitMqTopology {
    type Error = lapin::Error;

    async fn exchange_exists(&mut self, name: &str) -> Result<bool, Self::Error> {
        let probe = self.connection.create_channel().await?;
        let result = probe
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        Self::interpret_probe(result)
    }

    #[tracing::instrument(skip_all, fields(exchange = name))]
    async fn declare_exchange(
        &mut self,
        name: &str,
        config: &ExchangeConfig,
    ) -> Result<(), Self::Error> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(config.kind),
                ExchangeDeclareOptions {
                    durable: config.durable,
                    ..Default::default()
                },
                field_table(&config.arguments),
            )
            .await
    }

    async fn queue_exists(&mut self, name: &str) -> Result<bool, Self::Error> {
        let probe = self.connection.create_channel().await?;
        let result = probe
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ());
        Self::interpret_probe(result)
    }

    #[tracing::instrument(skip_all, fields(queue = name))]
    async fn declare_queue(
        &mut self,
        name: &str,
        config: &QueueConfig,
    ) -> Result<(), Self::Error> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: config.durable,
                    ..Default::default()
                },
                field_table(&config.arguments),
            )
            .await?;
        Ok(())
    }

    /// AMQP offers no way to look a binding up, so bindings are always
    /// re-declared. The broker treats a repeated identical bind as a no-op.
    async fn binding_exists(&mut self, _binding: &BindingConfig) -> Result<bool, Self::Error> {
        Ok(false)
    }

    #[tracing::instrument(skip_all, fields(exchange = binding.exchange, queue = binding.queue))]
    async fn declare_binding(&mut self, binding: &BindingConfig) -> Result<(), Self::Error> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.binding_key,
                QueueBindOptions::default(),
                field_table(&binding.arguments),
            )
            .await
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

/// Converts JSON arguments to an AMQP field table. Composite values are
/// carried as their JSON text.
fn field_table(arguments: &std::collections::BTreeMap<String, serde_json::Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let amqp = match value {
            serde_json::Value::Null => AMQPValue::Void,
            serde_json::Value::Bool(b) => AMQPValue::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => AMQPValue::LongLongInt(i),
                None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => AMQPValue::LongString(s.as_str().into()),
            other => AMQPValue::LongString(other.to_string().into()),
        };
        table.insert(key.as_str().into(), amqp);
    }
    table
}
