// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges declared by the crate. The only exchange a session needs is the
//! per-queue dead-letter exchange, a durable fanout that routes expired
//! messages from the delay queues back into the work queue.

/// Suffix appended to a work queue name to build its dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE_SUFFIX: &str = "-retry";

/// Name of the dead-letter exchange owned by `queue`.
pub fn dead_letter_exchange_name(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_EXCHANGE_SUFFIX)
}

/// Definition of a durable fanout exchange, built with chained setters.
///
/// Fanout exchanges ignore routing keys, so every queue bound to one receives
/// every message dead-lettered into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new fanout exchange definition.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A non-durable fanout exchange definition
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// The durable exchange that feeds expired delay-queue messages back into
    /// `queue`.
    ///
    /// # Parameters
    /// * `queue` - The work queue owning the exchange
    ///
    /// # Returns
    /// The definition of `<queue>-retry`
    pub fn dead_letter_for(queue: &str) -> ExchangeDefinition {
        ExchangeDefinition::new(&dead_letter_exchange_name(queue)).durable()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Makes the exchange durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}
