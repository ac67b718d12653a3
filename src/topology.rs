//! Work queues, their delay queues and the shared dead queue.
//!
//! Each work queue `<name>` gets a companion `<name>.delay` whose messages expire after the
//! retry delay and are dead-lettered straight back to `<name>`. Failed messages from every
//! work queue land on one dead queue.

use crate::connection::Connection;
use crate::envelope::ActionRoutes;
use crate::queue::{Queue, QueueOptions};
use crate::transport::{BrokerError, QueueArguments};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DELAY_SUFFIX: &str = ".delay";

#[derive(Clone, Debug)]
pub struct QueueDefinition {
    pub name: String,
    pub options: QueueOptions,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl QueueDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: QueueOptions::default(),
            max_attempts: 3,
            retry_delay: Duration::from_secs(60),
        }
    }

    pub fn delay_queue_name(&self) -> String {
        format!("{}{DELAY_SUFFIX}", self.name)
    }
}

struct QueueSet {
    definition: QueueDefinition,
    work: Arc<Queue>,
    delay: Arc<Queue>,
}

pub struct Topology {
    queues: BTreeMap<String, QueueSet>,
    dead: Arc<Queue>,
}

impl Topology {
    pub fn new(
        connection: &Connection,
        definitions: impl IntoIterator<Item = QueueDefinition>,
        dead_queue: &str,
    ) -> Self {
        let passive = |arguments: QueueArguments, durable: bool| QueueOptions {
            durable,
            prefetch: 0,
            arguments,
            ..QueueOptions::default()
        };

        let queues = definitions
            .into_iter()
            .map(|definition| {
                let work = Arc::new(Queue::new(
                    definition.name.clone(),
                    definition.options.clone(),
                    connection.clone(),
                ));
                let delay = Arc::new(Queue::new(
                    definition.delay_queue_name(),
                    passive(
                        QueueArguments {
                            message_ttl: Some(definition.retry_delay),
                            dead_letter_to: Some(definition.name.clone()),
                        },
                        definition.options.durable,
                    ),
                    connection.clone(),
                ));
                (
                    definition.name.clone(),
                    QueueSet {
                        definition,
                        work,
                        delay,
                    },
                )
            })
            .collect();

        let dead = Arc::new(Queue::new(
            dead_queue,
            passive(QueueArguments::default(), true),
            connection.clone(),
        ));

        Self { queues, dead }
    }

    /// Declares the dead queue, then every work queue and its delay queue.
    pub async fn declare_all(&self) -> Result<(), BrokerError> {
        self.dead.declare().await?;
        for set in self.queues.values() {
            set.work.declare().await?;
            set.delay.declare().await?;
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|set| set.work.clone())
    }

    pub fn delay_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|set| set.delay.clone())
    }

    pub fn definition(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.get(name).map(|set| &set.definition)
    }

    pub fn dead_queue(&self) -> &Arc<Queue> {
        &self.dead
    }

    pub fn routes(&self, name: &str) -> Option<ActionRoutes> {
        self.queues.get(name).map(|set| ActionRoutes {
            origin: name.to_string(),
            delay: set.delay.clone(),
            dead: self.dead.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::transport::memory::MemoryBroker;

    #[tokio::test]
    async fn declares_delay_queue_per_origin_and_one_dead_queue() {
        let broker = MemoryBroker::new();
        let connection = Connection::new(Arc::new(broker.clone()), ConnectionOptions::default());
        connection.connect().await.expect("connect");

        let topology = Topology::new(
            &connection,
            [QueueDefinition::new("apps"), QueueDefinition::new("players")],
            "failed",
        );
        topology.declare_all().await.expect("declare");

        for name in ["apps", "apps.delay", "players", "players.delay", "failed"] {
            assert!(broker.is_declared(name), "{name} not declared");
        }

        let delay = topology.delay_queue("apps").expect("delay queue");
        assert_eq!(
            delay.options().arguments.dead_letter_to.as_deref(),
            Some("apps")
        );
        assert_eq!(delay.options().prefetch, 0);
        assert!(topology.routes("unknown").is_none());
        connection.close().await;
    }
}
