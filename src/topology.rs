// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! A `Topology` is the setup routine of a channel session: the exchanges,
//! queues and bindings a role needs, plus the prefetch limit of its consumer.
//! It is installed every time the session (re)opens a channel, so every
//! declaration in it must be idempotent.
//!
//! Role topologies:
//! - watcher: the target queue and, optionally, the worker queue
//! - sender: the dead-letter exchange `<queue>-retry`, the work queue, the
//!   binding between them and prefetch = 1
//! - worker: the sender topology plus the upstream sender queue

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// Unacknowledged deliveries a consumer session may hold at once.
pub const CONSUMER_PREFETCH: u16 = 1;

/// Declarations installed on a channel before any message flows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) prefetch: Option<u16>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Watcher topology.
    ///
    /// # Parameters
    /// * `queue` - The work queue, declared durable
    /// * `worker_queue` - An optional second queue, declared durable
    ///
    /// # Returns
    /// A topology with no exchange and no prefetch
    pub fn producer(queue: &str, worker_queue: Option<&str>) -> Topology {
        let topology = Topology::new().queue(QueueDefinition::new(queue).durable());

        match worker_queue {
            Some(worker) => topology.queue(QueueDefinition::new(worker).durable()),
            None => topology,
        }
    }

    /// Sender topology: work queue bound to its dead-letter exchange, prefetch 1.
    ///
    /// # Parameters
    /// * `queue` - The work queue
    ///
    /// # Returns
    /// The topology installed by sender sessions
    pub fn consumer(queue: &str) -> Topology {
        let exchange = ExchangeDefinition::dead_letter_for(queue);
        let binding = QueueBinding::new(queue).exchange(exchange.name());

        Topology::new()
            .exchange(exchange)
            .queue(QueueDefinition::new(queue).durable())
            .queue_binding(binding)
            .prefetch(CONSUMER_PREFETCH)
    }

    /// Worker topology: the sender topology plus the durable upstream queue.
    ///
    /// # Parameters
    /// * `queue` - The work queue
    /// * `sender_queue` - The queue results are forwarded to
    ///
    /// # Returns
    /// The topology installed by worker sessions
    pub fn worker(queue: &str, sender_queue: &str) -> Topology {
        Topology::consumer(queue).queue(QueueDefinition::new(sender_queue).durable())
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology. A queue with the same name
    /// replaces the earlier definition.
    ///
    /// # Parameters
    /// * `def` - The queue definition
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Sets the consumer prefetch applied at the end of the install.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    /// Installs the topology on `channel`.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    /// 4. Applies the prefetch limit
    ///
    /// # Parameters
    /// * `channel` - The channel to declare on
    ///
    /// # Returns
    /// Ok(()) on success, or the first failure as is
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exchange in &self.exchanges {
            channel.declare_exchange(exchange).await?;
        }

        for queue in &self.queues {
            channel.declare_queue(queue).await?;
        }

        for binding in &self.queues_binding {
            channel.bind_queue(binding).await?;
        }

        if let Some(count) = self.prefetch {
            channel.prefetch(count).await?;
        }

        debug!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.queues_binding.len(),
            "topology installed"
        );

        Ok(())
    }
}
