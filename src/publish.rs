//! Publisher abstractions and backends.
//!
//! A publisher hands a wire message to the broker client. Wire messages
//! carry the business payload as a JSON body and every stamp as transport
//! headers; identity and semantic name are never embedded in the payload.
//!
//! Publishers are addressed through a [`PublisherRegistry`]: an explicit map
//! from destination name to publisher instance, validated for duplicates at
//! startup.

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use tracing_error::SpanTrace;

use crate::envelope::{MessageId, Stamps};
use crate::outbox::OutboxRecord;
use crate::routing::Route;

/// Header carrying the semantic message name.
pub const TYPE_HEADER: &str = "type";
/// Header carrying the message identity as a structured stamp.
pub const MESSAGE_ID_HEADER: &str = "x-stamp-message-id";
/// Header carrying the partition key as a structured stamp.
pub const PARTITION_KEY_HEADER: &str = "x-stamp-partition-key";

/// A message in wire form: resolved route, headers, and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub destination: String,
    pub routing_key: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WireMessage {
    /// Build the wire form of an outbox record for a resolved route.
    ///
    /// Forwards every stamp the record carries and every header the route
    /// declares; nothing is invented or dropped in between.
    pub fn from_record(record: &OutboxRecord, route: &Route) -> Result<Self, PublishError> {
        let body = serde_json::to_vec(&record.body).map_err(PublishError::serde)?;

        let mut headers = route.headers.clone();
        encode_stamp_headers(&record.stamps, &mut headers).map_err(PublishError::serde)?;

        Ok(Self {
            destination: route.destination.clone(),
            routing_key: route.routing_key.clone(),
            headers,
            body,
        })
    }
}

/// Serialize stamps into their wire headers.
pub fn encode_stamp_headers(
    stamps: &Stamps,
    headers: &mut BTreeMap<String, String>,
) -> Result<(), serde_json::Error> {
    if let Some(name) = &stamps.message_name {
        headers.insert(TYPE_HEADER.to_owned(), name.as_str().to_owned());
    }
    if let Some(id) = &stamps.message_id {
        headers.insert(
            MESSAGE_ID_HEADER.to_owned(),
            serde_json::to_string(&serde_json::json!({ "messageId": id }))?,
        );
    }
    if let Some(key) = &stamps.partition_key {
        headers.insert(
            PARTITION_KEY_HEADER.to_owned(),
            serde_json::to_string(&serde_json::json!({ "partitionKey": key.as_str() }))?,
        );
    }
    Ok(())
}

/// Parse the structured message-identity stamp header.
pub fn decode_message_id_stamp(raw: &str) -> Result<MessageId, serde_json::Error> {
    #[derive(Deserialize)]
    struct IdStamp {
        #[serde(rename = "messageId")]
        message_id: MessageId,
    }

    serde_json::from_str::<IdStamp>(raw).map(|s| s.message_id)
}

/// Trait implemented by concrete publisher backends.
///
/// A publisher delivers a [`WireMessage`] to an external broker. Failure is
/// reported, never swallowed; the dispatcher decides whether to retry.
#[async_trait::async_trait]
pub trait Publish {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Deliver a wire message to the broker and await its acknowledgement.
    async fn publish(&self, message: WireMessage) -> Result<(), Self::Error>;
}

/// Explicit map from destination name to publisher instance.
///
/// Built at startup and validated for duplicate destinations; an unknown
/// destination at dispatch time is reported as an error, never resolved
/// lazily.
#[derive(Debug)]
pub struct PublisherRegistry<P> {
    publishers: HashMap<String, P>,
    /// Fallback used when a destination has no dedicated entry.
    default: Option<P>,
}

impl<P> PublisherRegistry<P> {
    /// Build a registry from `(destination, publisher)` entries.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, P)>,
    ) -> Result<Self, PublishError> {
        let mut publishers = HashMap::new();
        for (destination, publisher) in entries {
            if publishers.insert(destination.clone(), publisher).is_some() {
                return Err(PublishError::duplicate_destination(destination));
            }
        }
        Ok(Self {
            publishers,
            default: None,
        })
    }

    /// A registry that routes every destination to one publisher.
    ///
    /// This is the common shape for single-broker deployments, where the
    /// destination becomes the exchange name on the wire message itself.
    pub fn with_default(publisher: P) -> Self {
        Self {
            publishers: HashMap::new(),
            default: Some(publisher),
        }
    }

    /// Add a fallback publisher for destinations without a dedicated entry.
    pub fn or_default(mut self, publisher: P) -> Self {
        self.default = Some(publisher);
        self
    }

    /// Look up the publisher for a destination.
    pub fn get(&self, destination: &str) -> Result<&P, PublishError> {
        self.publishers
            .get(destination)
            .or(self.default.as_ref())
            .ok_or_else(|| PublishError::unknown_destination(destination.to_owned()))
    }
}

/// Error returned by the publishing layer.
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Kinds of publishing errors.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// Errors originating from the broker backend.
    Backend(tower::BoxError),
    /// Body or stamp serialization failure.
    Serde(serde_json::Error),
    /// Two publishers were registered for the same destination.
    DuplicateDestination(String),
    /// No publisher is registered for the destination.
    UnknownDestination(String),
}

impl PublishError {
    fn serde(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::Serde(err),
        }
    }

    fn duplicate_destination(destination: String) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::DuplicateDestination(destination),
        }
    }

    fn unknown_destination(destination: String) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::UnknownDestination(destination),
        }
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::Backend(err) => writeln!(f, "Broker error: {err}"),
            PublishErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            PublishErrorKind::DuplicateDestination(dest) => {
                writeln!(f, "Duplicate publisher registered for destination: {dest}")
            }
            PublishErrorKind::UnknownDestination(dest) => {
                writeln!(f, "No publisher registered for destination: {dest}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::Backend(err) => Some(err.as_ref()),
            PublishErrorKind::Serde(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, MessageName};
    use chrono::Utc;

    fn record() -> OutboxRecord {
        let envelope = Envelope::new(serde_json::json!({ "total": 10 }))
            .with_message_name(MessageName::parse("order.placed").unwrap())
            .with_partition_key("order-42");
        let (stamps, body) = envelope.into_parts();
        OutboxRecord {
            id: 1,
            queue_name: "orders".into(),
            body,
            stamps,
            created_at: Utc::now(),
            available_at: Utc::now(),
            delivered_at: None,
            attempts: 0,
        }
    }

    #[test]
    fn wire_message_carries_every_stamp_as_headers() {
        let record = record();
        let route = Route {
            destination: "order".into(),
            routing_key: "order.placed".into(),
            headers: BTreeMap::new(),
        };

        let wire = WireMessage::from_record(&record, &route).unwrap();

        assert_eq!(wire.headers[TYPE_HEADER], "order.placed");
        let id = decode_message_id_stamp(&wire.headers[MESSAGE_ID_HEADER]).unwrap();
        assert_eq!(&id, record.stamps.message_id.as_ref().unwrap());
        assert!(wire.headers[PARTITION_KEY_HEADER].contains("order-42"));
    }

    #[test]
    fn wire_body_is_the_json_payload_only() {
        let record = record();
        let route = Route {
            destination: "order".into(),
            routing_key: "order.placed".into(),
            headers: BTreeMap::new(),
        };

        let wire = WireMessage::from_record(&record, &route).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&wire.body).unwrap();
        assert_eq!(body, serde_json::json!({ "total": 10 }));
    }

    #[test]
    fn route_headers_are_forwarded() {
        let record = record();
        let route = Route {
            destination: "order".into(),
            routing_key: "order.placed".into(),
            headers: BTreeMap::from([("x-priority".to_owned(), "high".to_owned())]),
        };

        let wire = WireMessage::from_record(&record, &route).unwrap();
        assert_eq!(wire.headers["x-priority"], "high");
    }

    #[test]
    fn registry_rejects_duplicate_destinations() {
        let err = PublisherRegistry::from_entries(vec![
            ("order".to_owned(), inmemory::InMemoryPublisher::new()),
            ("order".to_owned(), inmemory::InMemoryPublisher::new()),
        ])
        .unwrap_err();

        assert!(matches!(
            err.kind(),
            PublishErrorKind::DuplicateDestination(d) if d == "order"
        ));
    }

    #[test]
    fn registry_reports_unknown_destinations() {
        let registry: PublisherRegistry<inmemory::InMemoryPublisher> =
            PublisherRegistry::from_entries(vec![]).unwrap();
        let err = registry.get("order").unwrap_err();
        assert!(matches!(
            err.kind(),
            PublishErrorKind::UnknownDestination(d) if d == "order"
        ));
    }

    #[test]
    fn registry_falls_back_to_the_default_publisher() {
        let registry = PublisherRegistry::with_default(inmemory::InMemoryPublisher::new());
        assert!(registry.get("anything").is_ok());
    }
}
