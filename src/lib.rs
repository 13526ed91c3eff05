#![doc = include_str!("../README.md")]

pub mod envelope;
pub mod inbox;
pub mod outbox;
pub mod publish;
pub mod routing;
pub mod topology;

#[doc(inline)]
pub use envelope::{Envelope, MessageId, MessageName, PartitionKey};

#[doc(inline)]
pub use outbox::{Outbox, OutboxError, OutboxErrorKind};

#[doc(inline)]
pub use outbox::dispatcher::{Dispatcher, DispatcherConfig, DispatchHook, TracingDispatchHook};

#[doc(inline)]
pub use inbox::{InboxOutcome, InboxPipeline};

#[doc(inline)]
pub use routing::{Route, RoutingResolver};

#[doc(inline)]
pub use publish::{Publish, PublisherRegistry, WireMessage};
