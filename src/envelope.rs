use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message container used by the outbox and inbox pipelines.
///
/// `Envelope` bundles an opaque business payload together with a fixed set of
/// typed stamps. Stamps are transport metadata: they travel as wire headers,
/// never inside the payload.
///
/// ## Design
///
/// - `M` is the business payload type
/// - Stamps are named optional fields, not an open-ended metadata bag; any
///   future stamp is a new field with its own type
///
/// ## Example
///
/// ```rust
/// use postbox::envelope::{Envelope, MessageName};
///
/// let envelope = Envelope::new("payload")
///     .with_message_name(MessageName::parse("order.placed").unwrap())
///     .with_partition_key("order-42");
/// assert!(envelope.message_id().is_some());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    message: M,
    message_id: Option<MessageId>,
    message_name: Option<MessageName>,
    partition_key: Option<PartitionKey>,
    source_queue: Option<String>,
}

impl<M> Envelope<M> {
    /// Wrap a payload and assign a fresh time-sortable [`MessageId`].
    pub fn new(message: M) -> Self {
        Self {
            message,
            message_id: Some(MessageId::generate()),
            message_name: None,
            partition_key: None,
            source_queue: None,
        }
    }

    /// Wrap a payload without assigning any stamps.
    ///
    /// Used on the consuming side, where identity comes from the wire.
    pub fn unstamped(message: M) -> Self {
        Self {
            message,
            message_id: None,
            message_name: None,
            partition_key: None,
            source_queue: None,
        }
    }

    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_message_name(mut self, name: MessageName) -> Self {
        self.message_name = Some(name);
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<PartitionKey>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Record the queue this envelope was consumed from.
    pub fn with_source_queue(mut self, queue: impl Into<String>) -> Self {
        self.source_queue = Some(queue.into());
        self
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    pub fn message_name(&self) -> Option<&MessageName> {
        self.message_name.as_ref()
    }

    pub fn partition_key(&self) -> Option<&PartitionKey> {
        self.partition_key.as_ref()
    }

    pub fn source_queue(&self) -> Option<&str> {
        self.source_queue.as_deref()
    }

    /// Map the payload while keeping every stamp.
    pub fn map<N>(self, f: impl FnOnce(M) -> N) -> Envelope<N> {
        Envelope {
            message: f(self.message),
            message_id: self.message_id,
            message_name: self.message_name,
            partition_key: self.partition_key,
            source_queue: self.source_queue,
        }
    }

    /// Split into stamps and payload.
    pub fn into_parts(self) -> (Stamps, M) {
        (
            Stamps {
                message_id: self.message_id,
                message_name: self.message_name,
                partition_key: self.partition_key,
            },
            self.message,
        )
    }

    pub fn from_parts(stamps: Stamps, message: M) -> Self {
        Self {
            message,
            message_id: stamps.message_id,
            message_name: stamps.message_name,
            partition_key: stamps.partition_key,
            source_queue: None,
        }
    }
}

/// Serializable stamp set, persisted as outbox headers and carried on the
/// wire as transport metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamps {
    pub message_id: Option<MessageId>,
    pub message_name: Option<MessageName>,
    pub partition_key: Option<PartitionKey>,
}

/// Globally unique, time-sortable message identity (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Dot-segmented semantic message name, e.g. `order.placed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageName(String);

impl MessageName {
    /// Parse a name, rejecting empty names and empty segments.
    pub fn parse(name: impl Into<String>) -> Result<Self, InvalidMessageName> {
        let name = name.into();
        if name.is_empty() || name.split('.').any(str::is_empty) {
            return Err(InvalidMessageName { name });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading dot segment, used as the conventional routing destination.
    pub fn first_segment(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for MessageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a message name is empty or has empty segments.
#[derive(Debug)]
pub struct InvalidMessageName {
    name: String,
}

impl std::fmt::Display for InvalidMessageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid message name: {:?}", self.name)
    }
}

impl std::error::Error for InvalidMessageName {}

/// Grouping key for messages that must be delivered in append order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}
