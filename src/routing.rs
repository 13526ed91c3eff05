//! Maps an event's semantic name to a broker destination.
//!
//! The default convention derives the destination from the leading dot
//! segment of the message name (`order.placed` publishes to the `order`
//! destination) and uses the full name as the routing key.
//!
//! Per-name overrides are registered as plain data at startup and injected
//! into the resolver; the override table is immutable afterwards, so
//! resolution is a pure lookup with no hidden caches.

use std::collections::BTreeMap;
use std::collections::HashMap;

use tracing_error::SpanTrace;

use crate::envelope::MessageName;

/// A resolved broker route for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Broker destination (exchange or topic).
    pub destination: String,
    pub routing_key: String,
    /// Extra headers declared by an override. Stamp headers are added by the
    /// publisher layer, never here.
    pub headers: BTreeMap<String, String>,
}

/// Declared override for one message name.
///
/// Unset fields fall back to the convention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOverride {
    pub destination: Option<String>,
    pub routing_key: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Resolves message names to broker routes.
///
/// Built once at startup from an explicit override map and immutable
/// thereafter.
#[derive(Debug, Clone, Default)]
pub struct RoutingResolver {
    overrides: HashMap<MessageName, RouteOverride>,
}

impl RoutingResolver {
    /// Convention-only resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a resolver from declared overrides.
    ///
    /// Registering the same message name twice is a configuration error and
    /// fails fast.
    pub fn with_overrides(
        overrides: impl IntoIterator<Item = (MessageName, RouteOverride)>,
    ) -> Result<Self, RoutingError> {
        let mut map = HashMap::new();
        for (name, route_override) in overrides {
            if map.insert(name.clone(), route_override).is_some() {
                return Err(RoutingError::duplicate_override(name));
            }
        }
        Ok(Self { overrides: map })
    }

    /// Resolve the route for a message name.
    ///
    /// An override takes precedence field by field; anything it leaves unset
    /// comes from the convention.
    pub fn resolve(&self, name: &MessageName) -> Route {
        let route_override = self.overrides.get(name);

        let destination = route_override
            .and_then(|o| o.destination.clone())
            .unwrap_or_else(|| name.first_segment().to_owned());
        let routing_key = route_override
            .and_then(|o| o.routing_key.clone())
            .unwrap_or_else(|| name.as_str().to_owned());
        let headers = route_override
            .map(|o| o.headers.clone())
            .unwrap_or_default();

        Route {
            destination,
            routing_key,
            headers,
        }
    }
}

/// Error returned when building a [`RoutingResolver`].
#[derive(Debug)]
pub struct RoutingError {
    context: SpanTrace,
    kind: RoutingErrorKind,
}

#[derive(Debug)]
pub enum RoutingErrorKind {
    /// The same message name was registered twice.
    DuplicateOverride(MessageName),
}

impl RoutingError {
    fn duplicate_override(name: MessageName) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RoutingErrorKind::DuplicateOverride(name),
        }
    }

    pub fn kind(&self) -> &RoutingErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RoutingErrorKind::DuplicateOverride(name) => {
                writeln!(f, "Duplicate routing override for message name: {name}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RoutingError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> MessageName {
        MessageName::parse(s).unwrap()
    }

    #[test]
    fn convention_uses_first_segment_and_full_name() {
        let resolver = RoutingResolver::new();
        let route = resolver.resolve(&name("order.placed"));
        assert_eq!(route.destination, "order");
        assert_eq!(route.routing_key, "order.placed");
        assert!(route.headers.is_empty());
    }

    #[test]
    fn override_takes_precedence_over_convention() {
        let resolver = RoutingResolver::with_overrides(vec![(
            name("order.placed"),
            RouteOverride {
                destination: Some("commerce".into()),
                routing_key: Some("orders.v2.placed".into()),
                headers: BTreeMap::from([("x-priority".to_owned(), "high".to_owned())]),
            },
        )])
        .unwrap();

        let route = resolver.resolve(&name("order.placed"));
        assert_eq!(route.destination, "commerce");
        assert_eq!(route.routing_key, "orders.v2.placed");
        assert_eq!(route.headers["x-priority"], "high");
    }

    #[test]
    fn partial_override_falls_back_per_field() {
        let resolver = RoutingResolver::with_overrides(vec![(
            name("order.placed"),
            RouteOverride {
                destination: Some("commerce".into()),
                ..Default::default()
            },
        )])
        .unwrap();

        let route = resolver.resolve(&name("order.placed"));
        assert_eq!(route.destination, "commerce");
        assert_eq!(route.routing_key, "order.placed");
    }

    #[test]
    fn overrides_do_not_leak_across_message_names() {
        let resolver = RoutingResolver::with_overrides(vec![(
            name("order.placed"),
            RouteOverride {
                destination: Some("commerce".into()),
                ..Default::default()
            },
        )])
        .unwrap();

        let other = resolver.resolve(&name("order.cancelled"));
        assert_eq!(other.destination, "order");
        assert_eq!(other.routing_key, "order.cancelled");
    }

    #[test]
    fn duplicate_override_fails_fast() {
        let err = RoutingResolver::with_overrides(vec![
            (name("order.placed"), RouteOverride::default()),
            (name("order.placed"), RouteOverride::default()),
        ])
        .unwrap_err();

        assert!(matches!(
            err.kind(),
            RoutingErrorKind::DuplicateOverride(n) if n.as_str() == "order.placed"
        ));
    }
}
