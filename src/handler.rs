// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Handlers receive one delivery at a time together with the actions that
//! settle it. Each terminal action (`ack`, `nack`, `schedule_retry`,
//! `schedule_transaction_resend`) consumes the delivery, so a message can be
//! settled at most once. Dropping a delivery without settling it leaves the
//! message unacknowledged and, with prefetch 1, holds back every later
//! message of the queue until the channel is recycled.

use crate::{
    channel::BrokerChannel,
    errors::{AmqpError, HandlerError},
    message::Message,
    publisher::{encode, publish_json},
    retry::{RetryPlan, RetryScheduler, TransactionResendScheduler},
};
use async_trait::async_trait;
use serde::Serialize;
use std::{future::Future, sync::Arc};
use tracing::{debug, warn};

/// Settles one delivery on the channel it arrived on.
#[derive(Clone)]
pub(crate) struct Settlement {
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
}

impl Settlement {
    pub(crate) fn new(channel: Arc<dyn BrokerChannel>, delivery_tag: u64) -> Self {
        Settlement {
            channel,
            delivery_tag,
        }
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        self.channel.ack(self.delivery_tag).await?;
        debug!(delivery_tag = self.delivery_tag, "message acked");
        Ok(())
    }

    async fn nack(&self) -> Result<(), AmqpError> {
        self.channel.nack(self.delivery_tag, true).await?;
        warn!(delivery_tag = self.delivery_tag, "message nacked and requeued");
        Ok(())
    }
}

/// Delivery handed to a sender-role handler.
pub struct SenderDelivery {
    message: Message,
    settlement: Settlement,
    retry: Arc<RetryScheduler>,
    resend: Arc<TransactionResendScheduler>,
}

impl SenderDelivery {
    pub(crate) fn new(
        message: Message,
        settlement: Settlement,
        retry: Arc<RetryScheduler>,
        resend: Arc<TransactionResendScheduler>,
    ) -> Self {
        SenderDelivery {
            message,
            settlement,
            retry,
            resend,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Removes the message from the queue for good.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.settlement.ack().await
    }

    /// Rejects the message and puts it back at the head of the queue for
    /// immediate redelivery. Does not go through any delay queue.
    pub async fn nack(self) -> Result<(), AmqpError> {
        self.settlement.nack().await
    }

    /// Retries the original payload after the backoff delay for its next
    /// attempt, counting from the message's `retries` header.
    ///
    /// The message is acked once the copy sits in the delay queue. If the
    /// copy cannot be published the message is left unsettled.
    pub async fn schedule_retry(self) -> Result<RetryPlan, AmqpError> {
        let current = self.message.retries();
        let plan = self
            .retry
            .schedule_retry(self.message.payload(), current)
            .await?;
        self.settlement.ack().await?;
        Ok(plan)
    }

    /// Like [`schedule_retry`](Self::schedule_retry) with a replacement
    /// payload and an explicit retry count.
    ///
    /// # Parameters
    /// * `data` - The payload to retry, JSON encoded
    /// * `current` - Retries the message already went through
    ///
    /// # Returns
    /// The applied plan; the message is left unsettled on error
    pub async fn schedule_retry_with<T>(self, data: &T, current: u32) -> Result<RetryPlan, AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = encode(data)?;
        let plan = self.retry.schedule_retry(&payload, current).await?;
        self.settlement.ack().await?;
        Ok(plan)
    }

    /// Sends the original payload back to the queue after the fixed
    /// transaction status check delay, then acks the message.
    pub async fn schedule_transaction_resend(self) -> Result<(), AmqpError> {
        self.resend.schedule_resend(self.message.payload()).await?;
        self.settlement.ack().await
    }

    /// Like [`schedule_transaction_resend`](Self::schedule_transaction_resend)
    /// with a replacement payload.
    ///
    /// # Parameters
    /// * `data` - The payload to resend, JSON encoded
    ///
    /// # Returns
    /// Ok(()) once the copy is queued and the message acked
    pub async fn schedule_transaction_resend_with<T>(self, data: &T) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = encode(data)?;
        self.resend.schedule_resend(&payload).await?;
        self.settlement.ack().await
    }
}

/// Delivery handed to a worker-role handler.
pub struct WorkerDelivery {
    message: Message,
    settlement: Settlement,
    retry: Arc<RetryScheduler>,
    sender_queue: String,
}

impl WorkerDelivery {
    pub(crate) fn new(
        message: Message,
        settlement: Settlement,
        retry: Arc<RetryScheduler>,
        sender_queue: &str,
    ) -> Self {
        WorkerDelivery {
            message,
            settlement,
            retry,
            sender_queue: sender_queue.to_owned(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn sender_queue(&self) -> &str {
        &self.sender_queue
    }

    /// Publishes a durable result to the sender queue. Does not settle the
    /// delivery.
    ///
    /// # Parameters
    /// * `data` - The result, JSON encoded
    ///
    /// # Returns
    /// Ok(()) on success or the publish error
    pub async fn send_to_sender_queue<T>(&self, data: &T) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        publish_json(self.settlement.channel.as_ref(), &self.sender_queue, data).await
    }

    /// Removes the message from the queue for good.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.settlement.ack().await
    }

    /// Rejects the message and puts it back at the head of the queue.
    pub async fn nack(self) -> Result<(), AmqpError> {
        self.settlement.nack().await
    }

    /// Retries the original payload after the backoff delay, then acks.
    pub async fn schedule_retry(self) -> Result<RetryPlan, AmqpError> {
        let current = self.message.retries();
        let plan = self
            .retry
            .schedule_retry(self.message.payload(), current)
            .await?;
        self.settlement.ack().await?;
        Ok(plan)
    }

    /// Retries a replacement payload with an explicit retry count, then acks.
    pub async fn schedule_retry_with<T>(self, data: &T, current: u32) -> Result<RetryPlan, AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = encode(data)?;
        let plan = self.retry.schedule_retry(&payload, current).await?;
        self.settlement.ack().await?;
        Ok(plan)
    }
}

/// Business logic of a sender-role consumer.
#[async_trait]
pub trait SenderHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: SenderDelivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> SenderHandler for F
where
    F: Fn(SenderDelivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: SenderDelivery) -> Result<(), HandlerError> {
        self(delivery).await
    }
}

/// Business logic of a worker-role consumer.
#[async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: WorkerDelivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> WorkerHandler for F
where
    F: Fn(WorkerDelivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: WorkerDelivery) -> Result<(), HandlerError> {
        self(delivery).await
    }
}
