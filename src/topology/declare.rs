//! Idempotent application of a declaration plan against a broker.

use async_trait::async_trait;

use crate::topology::{BindingConfig, Declaration, ExchangeConfig, QueueConfig, TopologyError};

/// Broker operations needed to apply a topology.
///
/// Implementations check for existence before creating, so repeated
/// application of the same plan converges without errors.
#[async_trait]
pub trait TopologyClient {
    type Error: Into<tower::BoxError>;

    async fn exchange_exists(&mut self, name: &str) -> Result<bool, Self::Error>;
    async fn declare_exchange(
        &mut self,
        name: &str,
        config: &ExchangeConfig,
    ) -> Result<(), Self::Error>;

    async fn queue_exists(&mut self, name: &str) -> Result<bool, Self::Error>;
    async fn declare_queue(&mut self, name: &str, config: &QueueConfig)
        -> Result<(), Self::Error>;

    /// Whether the binding is already in place. Protocols that cannot
    /// observe bindings may report `false`; declaring a binding twice is
    /// harmless on AMQP brokers.
    async fn binding_exists(&mut self, binding: &BindingConfig) -> Result<bool, Self::Error>;
    async fn declare_binding(&mut self, binding: &BindingConfig) -> Result<(), Self::Error>;
}

/// What happened to one object of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareAction {
    /// The object was missing and has been created.
    Created,
    /// The object already existed; nothing was done.
    Unchanged,
    /// Dry run: the object would be created on a real run.
    WouldCreate,
}

impl DeclareAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Unchanged => "unchanged",
            Self::WouldCreate => "would create",
        }
    }
}

/// Per-object report of an [`apply`] or [`dry_run`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclareOutcome {
    pub object: String,
    pub action: DeclareAction,
}

/// Apply a declaration plan, creating every object that does not exist yet.
#[tracing::instrument(skip_all, fields(declarations = plan.len()))]
pub async fn apply<C: TopologyClient + Send>(
    client: &mut C,
    plan: &[Declaration],
) -> Result<Vec<DeclareOutcome>, TopologyError> {
    let mut outcomes = Vec::with_capacity(plan.len());
    for declaration in plan {
        let exists = match declaration {
            Declaration::Exchange { name, .. } => client.exchange_exists(name).await,
            Declaration::Queue { name, .. } => client.queue_exists(name).await,
            Declaration::Binding(binding) => client.binding_exists(binding).await,
        }
        .map_err(|e| TopologyError::client(e.into()))?;

        let action = if exists {
            DeclareAction::Unchanged
        } else {
            match declaration {
                Declaration::Exchange { name, config } => {
                    client.declare_exchange(name, config).await
                }
                Declaration::Queue { name, config } => client.declare_queue(name, config).await,
                Declaration::Binding(binding) => client.declare_binding(binding).await,
            }
            .map_err(|e| TopologyError::client(e.into()))?;
            DeclareAction::Created
        };

        tracing::info!(object = %declaration.describe(), action = action.as_str());
        outcomes.push(DeclareOutcome {
            object: declaration.describe(),
            action,
        });
    }
    Ok(outcomes)
}

/// Report the planned actions without contacting any broker.
pub fn dry_run(plan: &[Declaration]) -> Vec<DeclareOutcome> {
    plan.iter()
        .map(|declaration| DeclareOutcome {
            object: declaration.describe(),
            action: DeclareAction::WouldCreate,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;
    use std::convert::Infallible;

    use super::*;
    use crate::topology::{ExchangeType, TopologyConfig, resolve};

    /// Fake broker that remembers what was declared.
    #[derive(Default)]
    struct FakeBroker {
        exchanges: BTreeSet<String>,
        queues: BTreeSet<String>,
        bindings: BTreeSet<(String, String, String)>,
    }

    #[async_trait]
    impl TopologyClient for FakeBroker {
        type Error = Infallible;

        async fn exchange_exists(&mut self, name: &str) -> Result<bool, Infallible> {
            Ok(self.exchanges.contains(name))
        }

        async fn declare_exchange(
            &mut self,
            name: &str,
            _config: &ExchangeConfig,
        ) -> Result<(), Infallible> {
            self.exchanges.insert(name.to_owned());
            Ok(())
        }

        async fn queue_exists(&mut self, name: &str) -> Result<bool, Infallible> {
            Ok(self.queues.contains(name))
        }

        async fn declare_queue(
            &mut self,
            name: &str,
            _config: &QueueConfig,
        ) -> Result<(), Infallible> {
            self.queues.insert(name.to_owned());
            Ok(())
        }

        async fn binding_exists(&mut self, binding: &BindingConfig) -> Result<bool, Infallible> {
            Ok(self.bindings.contains(&(
                binding.exchange.clone(),
                binding.queue.clone(),
                binding.binding_key.clone(),
            )))
        }

        async fn declare_binding(&mut self, binding: &BindingConfig) -> Result<(), Infallible> {
            self.bindings.insert((
                binding.exchange.clone(),
                binding.queue.clone(),
                binding.binding_key.clone(),
            ));
            Ok(())
        }
    }

    fn sample_config() -> TopologyConfig {
        TopologyConfig {
            exchanges: BTreeMap::from([
                (
                    "order".to_owned(),
                    ExchangeConfig {
                        kind: ExchangeType::Topic,
                        durable: true,
                        arguments: BTreeMap::from([(
                            "x-dead-letter-exchange".to_owned(),
                            serde_json::Value::String("order.dlx".to_owned()),
                        )]),
                    },
                ),
                (
                    "order.dlx".to_owned(),
                    ExchangeConfig {
                        kind: ExchangeType::Fanout,
                        durable: true,
                        arguments: BTreeMap::new(),
                    },
                ),
            ]),
            queues: BTreeMap::from([(
                "order.placed.v1".to_owned(),
                QueueConfig {
                    durable: true,
                    arguments: BTreeMap::new(),
                },
            )]),
            bindings: vec![BindingConfig {
                exchange: "order".to_owned(),
                queue: "order.placed.v1".to_owned(),
                binding_key: "order.placed".to_owned(),
                arguments: BTreeMap::new(),
            }],
        }
    }

    #[tokio::test]
    async fn first_run_creates_everything() {
        let plan = resolve(&sample_config()).unwrap();
        let mut broker = FakeBroker::default();

        let outcomes = apply(&mut broker, &plan).await.unwrap();
        assert!(outcomes.iter().all(|o| o.action == DeclareAction::Created));
        assert!(broker.exchanges.contains("order"));
        assert!(broker.exchanges.contains("order.dlx"));
        assert!(broker.queues.contains("order.placed.v1"));
        assert_eq!(broker.bindings.len(), 1);
    }

    #[tokio::test]
    async fn second_run_reports_no_changes() {
        let plan = resolve(&sample_config()).unwrap();
        let mut broker = FakeBroker::default();

        apply(&mut broker, &plan).await.unwrap();
        let outcomes = apply(&mut broker, &plan).await.unwrap();
        assert!(outcomes.iter().all(|o| o.action == DeclareAction::Unchanged));
    }

    #[tokio::test]
    async fn partially_declared_broker_only_fills_the_gaps() {
        let plan = resolve(&sample_config()).unwrap();
        let mut broker = FakeBroker::default();
        broker.exchanges.insert("order.dlx".to_owned());

        let outcomes = apply(&mut broker, &plan).await.unwrap();
        let by_object: BTreeMap<_, _> = outcomes
            .into_iter()
            .map(|o| (o.object, o.action))
            .collect();
        assert_eq!(by_object["exchange order.dlx"], DeclareAction::Unchanged);
        assert_eq!(by_object["exchange order"], DeclareAction::Created);
    }

    #[test]
    fn dry_run_never_touches_a_client() {
        let plan = resolve(&sample_config()).unwrap();
        let outcomes = dry_run(&plan);
        assert_eq!(outcomes.len(), plan.len());
        assert!(
            outcomes
                .iter()
                .all(|o| o.action == DeclareAction::WouldCreate)
        );
    }
}
