// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishing helpers shared by every role and the watcher-role `Producer`.
//! All messages go through the default exchange straight to a queue, are
//! JSON encoded, persistent, stamped with a fresh message id and carry the
//! current trace context in their headers.

use crate::{channel::BrokerChannel, errors::AmqpError, otel, session::ChannelSession};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Encodes `data` as a JSON body.
pub(crate) fn encode<T>(data: &T) -> Result<Vec<u8>, AmqpError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(data).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize payload");
        AmqpError::SerializePayloadError
    })
}

/// Properties of a persistent JSON message carrying `headers` and the current trace context.
pub(crate) fn message_properties(mut headers: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
    otel::inject_current(&mut headers);

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers))
}

/// Publishes an already encoded body to `queue` through the default exchange.
pub(crate) async fn publish_to_queue(
    channel: &dyn BrokerChannel,
    queue: &str,
    payload: &[u8],
    headers: BTreeMap<ShortString, AMQPValue>,
) -> Result<(), AmqpError> {
    channel
        .publish("", queue, payload, message_properties(headers))
        .await?;

    debug!(queue, bytes = payload.len(), "message published");
    Ok(())
}

/// Encodes `data` and publishes it to `queue` without extra headers.
pub(crate) async fn publish_json<T>(
    channel: &dyn BrokerChannel,
    queue: &str,
    data: &T,
) -> Result<(), AmqpError>
where
    T: Serialize + Sync + ?Sized,
{
    let payload = encode(data)?;
    publish_to_queue(channel, queue, &payload, BTreeMap::new()).await
}

/// Watcher-role handle: publishes into the work queue and, optionally, a worker queue.
///
/// The underlying channel is re-established on demand, so a send after a
/// broker restart reconnects and redeclares both queues first.
pub struct Producer {
    session: Arc<ChannelSession>,
    queue: String,
    worker_queue: Option<String>,
}

impl Producer {
    pub(crate) fn new(session: Arc<ChannelSession>, queue: &str, worker_queue: Option<&str>) -> Self {
        Producer {
            session,
            queue: queue.to_owned(),
            worker_queue: worker_queue.map(str::to_owned),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn worker_queue(&self) -> Option<&str> {
        self.worker_queue.as_deref()
    }

    /// Publishes a durable message to the work queue.
    ///
    /// # Parameters
    /// * `data` - The message, JSON encoded
    ///
    /// # Returns
    /// Ok(()) on success, or the channel setup or publish error
    pub async fn send_to_queue<T>(&self, data: &T) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let channel = self.session.channel().await?;
        publish_json(&channel, &self.queue, data).await
    }

    /// Publishes a durable message to the worker queue.
    ///
    /// # Parameters
    /// * `data` - The message, JSON encoded
    ///
    /// # Returns
    /// `WorkerQueueNotConfigured` when the producer has no worker queue
    pub async fn send_to_worker<T>(&self, data: &T) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let Some(worker_queue) = &self.worker_queue else {
            return Err(AmqpError::WorkerQueueNotConfigured);
        };

        let channel = self.session.channel().await?;
        publish_json(&channel, worker_queue, data).await
    }

    /// Closes the producer channel.
    pub async fn close(&self) {
        self.session.close().await;
    }
}
