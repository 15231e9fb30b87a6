// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processing of a single delivery: open a consumer span, wrap the message
//! with the actions of the session's role and run the handler. The consumer
//! never settles a message itself, whatever the handler returns.

use crate::{
    channel::BrokerChannel,
    handler::{SenderDelivery, SenderHandler, Settlement, WorkerDelivery, WorkerHandler},
    message::Message,
    otel,
    retry::{Backoff, RetryScheduler, TransactionResendScheduler},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use tracing::{debug, error};

/// Handler of a consuming role, as registered by the caller.
#[derive(Clone)]
pub(crate) enum RoleHandler {
    Sender {
        handler: Arc<dyn SenderHandler>,
        resend_timeout: Duration,
    },
    Worker {
        handler: Arc<dyn WorkerHandler>,
        sender_queue: String,
    },
}

enum BoundHandler {
    Sender {
        handler: Arc<dyn SenderHandler>,
        resend: Arc<TransactionResendScheduler>,
    },
    Worker {
        handler: Arc<dyn WorkerHandler>,
        sender_queue: String,
    },
}

/// Everything needed to process deliveries from one channel.
///
/// Rebuilt whenever the session reopens its channel, since delivery tags
/// and republishes are only valid on the channel the delivery came from.
pub(crate) struct ConsumerContext {
    queue: String,
    channel: Arc<dyn BrokerChannel>,
    retry: Arc<RetryScheduler>,
    handler: BoundHandler,
}

impl ConsumerContext {
    pub(crate) fn new(
        queue: &str,
        channel: Arc<dyn BrokerChannel>,
        backoff: Arc<dyn Backoff>,
        handler: &RoleHandler,
    ) -> Self {
        let retry = Arc::new(RetryScheduler::new(queue, backoff, channel.clone()));

        let handler = match handler {
            RoleHandler::Sender {
                handler,
                resend_timeout,
            } => BoundHandler::Sender {
                handler: handler.clone(),
                resend: Arc::new(TransactionResendScheduler::new(
                    queue,
                    *resend_timeout,
                    channel.clone(),
                )),
            },
            RoleHandler::Worker {
                handler,
                sender_queue,
            } => BoundHandler::Worker {
                handler: handler.clone(),
                sender_queue: sender_queue.clone(),
            },
        };

        ConsumerContext {
            queue: queue.to_owned(),
            channel,
            retry,
            handler,
        }
    }

    /// Runs the handler for one message and records the outcome on its span.
    pub(crate) async fn consume(&self, tracer: &BoxedTracer, message: Message) {
        let (_ctx, mut span) = otel::new_span(message.headers(), tracer, &self.queue);
        let delivery_tag = message.delivery_tag();

        debug!(
            queue = %self.queue,
            delivery_tag,
            retries = message.retries(),
            redelivered = message.redelivered(),
            "received"
        );

        let settlement = Settlement::new(self.channel.clone(), delivery_tag);

        let result = match &self.handler {
            BoundHandler::Sender { handler, resend } => {
                let delivery =
                    SenderDelivery::new(message, settlement, self.retry.clone(), resend.clone());
                handler.handle(delivery).await
            }
            BoundHandler::Worker {
                handler,
                sender_queue,
            } => {
                let delivery =
                    WorkerDelivery::new(message, settlement, self.retry.clone(), sender_queue);
                handler.handle(delivery).await
            }
        };

        match result {
            Ok(()) => {
                debug!(queue = %self.queue, delivery_tag, "message handled");
                span.set_status(Status::Ok);
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = %self.queue,
                    delivery_tag,
                    "handler failure"
                );
                span.record_error(err.as_ref());
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }

        span.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockBrokerChannel,
        errors::HandlerError,
        retry::BackoffSequence,
    };
    use lapin::types::FieldTable;
    use opentelemetry::global;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(tag: u64) -> Message {
        Message::new(tag, "jobs", false, FieldTable::default(), b"{}".to_vec())
    }

    fn backoff() -> Arc<dyn Backoff> {
        Arc::new(BackoffSequence::default())
    }

    #[tokio::test]
    async fn failing_handler_leaves_the_message_unsettled() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_ack().never();
        channel.expect_nack().never();
        channel.expect_publish().never();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = move |_delivery: SenderDelivery| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err::<(), HandlerError>("downstream unavailable".into())
            }
        };

        let context = ConsumerContext::new(
            "payments",
            Arc::new(channel),
            backoff(),
            &RoleHandler::Sender {
                handler: Arc::new(handler),
                resend_timeout: Duration::from_secs(60),
            },
        );

        context.consume(&global::tracer("test"), message(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_role_gets_its_sender_queue() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|_, routing_key, _, _| routing_key == "results")
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_ack()
            .withf(|tag| *tag == 9)
            .times(1)
            .returning(|_| Ok(()));

        let handler = |delivery: WorkerDelivery| async move {
            assert_eq!(delivery.sender_queue(), "results");
            delivery.send_to_sender_queue(&serde_json::json!({"done": true})).await?;
            delivery.ack().await?;
            Ok::<(), HandlerError>(())
        };

        let context = ConsumerContext::new(
            "jobs",
            Arc::new(channel),
            backoff(),
            &RoleHandler::Worker {
                handler: Arc::new(handler),
                sender_queue: "results".into(),
            },
        );

        context.consume(&global::tracer("test"), message(9)).await;
    }
}
