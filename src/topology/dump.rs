//! Export a topology as a RabbitMQ definitions document.
//!
//! The output is the JSON format accepted by the management plugin's
//! definitions import, so a topology can be loaded without this tool.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::topology::{TopologyConfig, TopologyError};

#[derive(Serialize)]
struct Definitions<'a> {
    vhosts: Vec<VhostDef<'a>>,
    exchanges: Vec<ExchangeDef<'a>>,
    queues: Vec<QueueDef<'a>>,
    bindings: Vec<BindingDef<'a>>,
}

#[derive(Serialize)]
struct VhostDef<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct ExchangeDef<'a> {
    name: &'a str,
    vhost: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    durable: bool,
    auto_delete: bool,
    internal: bool,
    arguments: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct QueueDef<'a> {
    name: &'a str,
    vhost: &'a str,
    durable: bool,
    auto_delete: bool,
    arguments: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct BindingDef<'a> {
    source: &'a str,
    vhost: &'a str,
    destination: &'a str,
    destination_type: &'static str,
    routing_key: &'a str,
    arguments: &'a BTreeMap<String, serde_json::Value>,
}

/// Render the configuration as a pretty-printed definitions document.
///
/// The configuration is validated first; a dump of an inconsistent
/// topology would only defer the failure to import time.
pub fn dump(config: &TopologyConfig, vhost: &str) -> Result<String, TopologyError> {
    crate::topology::resolve(config)?;

    let definitions = Definitions {
        vhosts: vec![VhostDef { name: vhost }],
        exchanges: config
            .exchanges
            .iter()
            .map(|(name, e)| ExchangeDef {
                name,
                vhost,
                kind: e.kind.as_str(),
                durable: e.durable,
                auto_delete: false,
                internal: false,
                arguments: &e.arguments,
            })
            .collect(),
        queues: config
            .queues
            .iter()
            .map(|(name, q)| QueueDef {
                name,
                vhost,
                durable: q.durable,
                auto_delete: false,
                arguments: &q.arguments,
            })
            .collect(),
        bindings: config
            .bindings
            .iter()
            .map(|b| BindingDef {
                source: &b.exchange,
                vhost,
                destination: &b.queue,
                destination_type: "queue",
                routing_key: &b.binding_key,
                arguments: &b.arguments,
            })
            .collect(),
    };

    serde_json::to_string_pretty(&definitions).map_err(TopologyError::parse)
}
