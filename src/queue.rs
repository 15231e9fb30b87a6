// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue and binding definitions for the work queues and the ephemeral delay
//! queues that implement retries. Delay queues carry a per-message TTL, an
//! idle expiry and a dead-letter exchange; once a message's TTL elapses the
//! broker moves it through that exchange back into the work queue.

use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};

/// Queue argument naming the exchange that receives expired messages
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument holding the per-message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument holding the idle time, in milliseconds, before the broker deletes the queue
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// Definition of a RabbitMQ queue, built with chained setters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) ttl: Option<u64>,
    pub(crate) expires: Option<u64>,
    pub(crate) dead_letter_exchange: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A non-durable queue definition with no arguments
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn message_ttl(&self) -> Option<u64> {
        self.ttl
    }

    pub fn expires(&self) -> Option<u64> {
        self.expires
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the per-message TTL of the queue.
    ///
    /// # Parameters
    /// * `ttl` - Milliseconds a message waits before it is dead-lettered
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets how long the queue may stay unused before the broker deletes it.
    ///
    /// # Parameters
    /// * `expires` - Idle time in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn expires_after(mut self, expires: u64) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Sets the exchange receiving expired messages.
    ///
    /// # Parameters
    /// * `exchange` - The dead-letter exchange name
    ///
    /// # Returns
    /// Self for method chaining
    pub fn dead_letter_to(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// The `x-*` arguments sent with `queue.declare`.
    ///
    /// Redeclaring a queue with different arguments is a channel error on the
    /// broker, so the same definition must always produce the same table.
    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongLongInt(broker_millis(ttl)),
            );
        }

        if let Some(expires) = self.expires {
            args.insert(
                ShortString::from(AMQP_HEADERS_EXPIRES),
                AMQPValue::LongLongInt(broker_millis(expires)),
            );
        }

        args
    }
}

// The broker reads these arguments as signed integers.
fn broker_millis(ms: u64) -> LongLongInt {
    LongLongInt::try_from(ms).unwrap_or(LongLongInt::MAX)
}

/// Binds a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
}

impl QueueBinding {
    /// Creates a binding for `queue`. Bindings to fanout exchanges carry no
    /// routing key.
    ///
    /// # Parameters
    /// * `queue` - The name of the bound queue
    ///
    /// # Returns
    /// A binding with no exchange set yet
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Sets the exchange to bind the queue to.
    ///
    /// # Parameters
    /// * `exchange` - The exchange name
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_queue_has_no_arguments() {
        let def = QueueDefinition::new("payments").durable();
        assert!(def.is_durable());
        assert!(def.arguments().inner().is_empty());
    }

    #[test]
    fn oversized_durations_never_turn_negative() {
        let def = QueueDefinition::new("payments-retry-huge")
            .ttl(u64::MAX)
            .expires_after(u64::MAX);

        let args = def.arguments();
        let args = args.inner();

        assert_eq!(
            args.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongLongInt(i64::MAX))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_EXPIRES),
            Some(&AMQPValue::LongLongInt(i64::MAX))
        );
    }

    #[test]
    fn delay_queue_arguments() {
        let def = QueueDefinition::new("payments-retry-5000")
            .durable()
            .dead_letter_to("payments-retry")
            .ttl(5_000)
            .expires_after(50_000);

        let args = def.arguments();
        let args = args.inner();

        assert_eq!(args.len(), 3);
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("payments-retry")))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongLongInt(5_000))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_EXPIRES),
            Some(&AMQPValue::LongLongInt(50_000))
        );
    }
}
