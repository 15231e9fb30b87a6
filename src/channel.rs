// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Operations
//!
//! The `BrokerChannel` trait is the narrow set of channel operations the
//! topology builder, the schedulers and message settlement rely on. It is
//! implemented for `lapin::Channel` and mocked in tests.
//!
//! Declaration failures are split in two: the broker refusing a declaration
//! on a live channel (a soft protocol error such as 406 or 403) is reported as
//! the matching topology error, while a connection or channel that went away
//! mid-setup is reported as [`AmqpError::ConnectionLostError`], which the
//! consumer loop recovers from.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::AMQPErrorKind,
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tracing::{debug, error};

/// Channel operations used outside of the consumer stream itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries held by the channel.
    async fn prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl BrokerChannel for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        self.exchange_declare(
            &def.name,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                passive: false,
                durable: def.durable,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = %def.name,
                "error to declare the exchange"
            );
            declaration_error(&err, &def.name, AmqpError::DeclareExchangeError(def.name.clone()))
        })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(declaration_error(
                    &err,
                    &def.name,
                    AmqpError::DeclareQueueError(def.name.clone()),
                ))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {}",
            binding.queue_name, binding.exchange_name
        );

        self.queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            "",
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            declaration_error(
                &err,
                &binding.queue_name,
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ),
            )
        })
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                declaration_error(&err, "qos", AmqpError::QoSDeclarationError(err.to_string()))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), routing_key, "error publishing message");
                Err(AmqpError::PublishingError(routing_key.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
            AmqpError::NackMessageError
        })
    }
}

/// Whether `err` means the connection or the channel is gone, rather than the
/// broker refusing an operation on a channel that is still usable.
pub(crate) fn is_connection_loss(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => !matches!(amqp.kind(), AMQPErrorKind::Soft(_)),
        _ => true,
    }
}

fn declaration_error(err: &lapin::Error, target: &str, refused: AmqpError) -> AmqpError {
    if is_connection_loss(err) {
        AmqpError::ConnectionLostError(target.to_owned())
    } else {
        refused
    }
}
