// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Loop
//!
//! Runs the consumer of a sender or worker session on its own task. The loop
//! awaits the handler before pulling the next delivery, so handler calls on
//! one session never overlap; together with prefetch 1 this gives at most one
//! unacknowledged message per session.
//!
//! Connectivity failures are retried after `reconnect_delay`: the session's
//! channel is dropped and the next iteration reconnects and reinstalls the
//! topology. A topology failure ends the loop with that error.
//!
//! Deliveries come from a [`DeliverySource`]; the session-backed source opens
//! a lapin consumer on the session's channel.

use crate::{
    channel::BrokerChannel,
    consumer::{ConsumerContext, RoleHandler},
    errors::AmqpError,
    message::Message,
    otel::CONSUMER_TRACER,
    retry::Backoff,
    session::{ChannelSession, Role},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel, Consumer};
use opentelemetry::global;
use std::{future::pending, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::sleep,
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Deliveries of one consumer together with the channel they arrived on.
pub(crate) struct DeliveryStream {
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) deliveries: BoxStream<'static, Result<Message, AmqpError>>,
}

/// Where the consumer loop gets its deliveries from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait DeliverySource: Send + Sync {
    /// Opens (or reopens) the channel and starts consuming.
    async fn start(&self) -> Result<DeliveryStream, AmqpError>;

    /// Drops the current channel so the next `start` builds a new one.
    async fn discard(&self);

    /// Reports a delivery stream that ended without being asked to.
    fn stream_lost(&self);

    fn is_closed(&self) -> bool;

    /// Closes the source for good.
    async fn close(&self);
}

/// Session-backed source consuming with tag `<queue>-<role>-<uuid>`.
struct SessionSource {
    session: Arc<ChannelSession>,
    consumer_tag: String,
}

impl SessionSource {
    fn new(session: Arc<ChannelSession>) -> Self {
        let consumer_tag = format!("{}-{}-{}", session.queue(), session.role(), Uuid::new_v4());
        SessionSource {
            session,
            consumer_tag,
        }
    }
}

#[async_trait]
impl DeliverySource for SessionSource {
    async fn start(&self) -> Result<DeliveryStream, AmqpError> {
        let channel = self.session.channel().await?;
        let consumer = declare_consumer(&channel, self.session.queue(), &self.consumer_tag).await?;

        info!(
            queue = %self.session.queue(),
            role = %self.session.role(),
            consumer_tag = %self.consumer_tag,
            "consuming"
        );

        let queue = self.session.queue().to_owned();
        let deliveries = consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(Message::from_delivery(&queue, delivery)),
                Err(err) => {
                    error!(error = err.to_string(), queue = %queue, "errors consume msg");
                    Err(AmqpError::ConsumerError(queue.clone()))
                }
            })
            .boxed();

        Ok(DeliveryStream {
            channel: Arc::new(channel),
            deliveries,
        })
    }

    async fn discard(&self) {
        self.session.invalidate().await;
    }

    fn stream_lost(&self) {
        self.session.manager().report_stream_loss(self.session.queue());
    }

    fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    async fn close(&self) {
        self.session.close().await;
    }
}

/// Handle to a running consumer loop.
pub struct ConsumerHandle {
    source: Arc<dyn DeliverySource>,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), AmqpError>>,
}

impl ConsumerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to end.
    ///
    /// # Returns
    /// Ok(()) once the session is closed, or the topology error that stopped
    /// the loop
    pub async fn wait(self) -> Result<(), AmqpError> {
        join(self.task).await
    }

    /// Stops the loop and closes the session.
    ///
    /// The loop stops pulling deliveries; a handler already running finishes
    /// on the open channel, so its ack or retry still reaches the broker. The
    /// session is closed once the loop has returned.
    ///
    /// # Returns
    /// The result of the loop, as for [`wait`](Self::wait)
    pub async fn shutdown(self) -> Result<(), AmqpError> {
        let ConsumerHandle { source, stop, task } = self;

        stop.send_replace(true);
        let result = join(task).await;
        source.close().await;
        result
    }
}

async fn join(task: JoinHandle<Result<(), AmqpError>>) -> Result<(), AmqpError> {
    match task.await {
        Ok(result) => result,
        Err(err) => {
            error!(error = err.to_string(), "consumer task failure");
            Err(AmqpError::InternalError)
        }
    }
}

// Resolves once a stop is requested. A dropped handle never stops the loop.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        pending::<()>().await;
    }
}

pub(crate) struct Dispatcher {
    source: Arc<dyn DeliverySource>,
    queue: String,
    role: Role,
    handler: RoleHandler,
    backoff: Arc<dyn Backoff>,
    reconnect_delay: Duration,
}

impl Dispatcher {
    pub(crate) fn new(
        source: Arc<dyn DeliverySource>,
        queue: &str,
        role: Role,
        handler: RoleHandler,
        backoff: Arc<dyn Backoff>,
        reconnect_delay: Duration,
    ) -> Self {
        Dispatcher {
            source,
            queue: queue.to_owned(),
            role,
            handler,
            backoff,
            reconnect_delay,
        }
    }

    /// Consumer loop over the deliveries of `session`.
    pub(crate) fn for_session(
        session: Arc<ChannelSession>,
        handler: RoleHandler,
        backoff: Arc<dyn Backoff>,
        reconnect_delay: Duration,
    ) -> Self {
        let queue = session.queue().to_owned();
        let role = session.role();

        Dispatcher::new(
            Arc::new(SessionSource::new(session)),
            &queue,
            role,
            handler,
            backoff,
            reconnect_delay,
        )
    }

    pub(crate) fn spawn(self) -> ConsumerHandle {
        let source = self.source.clone();
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));

        ConsumerHandle { source, stop, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) -> Result<(), AmqpError> {
        let tracer = global::tracer(CONSUMER_TRACER);
        let queue = self.queue.as_str();
        let role = self.role;

        loop {
            if *stop.borrow() {
                return Ok(());
            }

            let stream = match self.source.start().await {
                Ok(s) => s,
                Err(AmqpError::SessionClosedError(_)) => return Ok(()),
                Err(err) if err.is_connectivity() => {
                    warn!(error = err.to_string(), queue, "broker unavailable, retrying");
                    self.source.discard().await;
                    if self.pause(&mut stop).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => {
                    error!(error = err.to_string(), queue, %role, "consumer stopped");
                    return Err(err);
                }
            };

            let DeliveryStream {
                channel,
                mut deliveries,
            } = stream;
            let context = ConsumerContext::new(queue, channel, self.backoff.clone(), &self.handler);

            loop {
                let next = tokio::select! {
                    biased;
                    _ = stop_requested(&mut stop) => {
                        info!(queue, %role, "consumer stopped on request");
                        return Ok(());
                    }
                    next = deliveries.next() => next,
                };

                match next {
                    Some(Ok(message)) => context.consume(&tracer, message).await,
                    Some(Err(_)) | None => break,
                }
            }

            if self.source.is_closed() {
                info!(queue, %role, "consumer closed");
                return Ok(());
            }

            warn!(queue, %role, "consumer stream ended, reconnecting");
            self.source.stream_lost();
            self.source.discard().await;
            if self.pause(&mut stop).await {
                return Ok(());
            }
        }
    }

    /// Waits `reconnect_delay`. Returns true when a stop was requested meanwhile.
    async fn pause(&self, stop: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = stop_requested(stop) => true,
            _ = sleep(self.reconnect_delay) => false,
        }
    }
}

async fn declare_consumer(
    channel: &Channel,
    queue: &str,
    consumer_tag: &str,
) -> Result<Consumer, AmqpError> {
    channel
        .basic_consume(
            queue,
            consumer_tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), queue, "error to create the consumer");
            AmqpError::ConsumerDeclarationError(queue.to_owned())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockBrokerChannel,
        errors::HandlerError,
        handler::SenderDelivery,
        retry::BackoffSequence,
    };
    use futures_util::stream;
    use mockall::Sequence;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn message(tag: u64) -> Message {
        Message::new(tag, "payments", false, FieldTable::default(), b"{}".to_vec())
    }

    fn deliveries(
        channel: MockBrokerChannel,
        items: Vec<Result<Message, AmqpError>>,
    ) -> DeliveryStream {
        DeliveryStream {
            channel: Arc::new(channel),
            deliveries: stream::iter(items).boxed(),
        }
    }

    fn noop_handler() -> RoleHandler {
        RoleHandler::Sender {
            handler: Arc::new(|_delivery: SenderDelivery| async move { Ok::<(), HandlerError>(()) }),
            resend_timeout: Duration::from_secs(60),
        }
    }

    fn dispatcher(source: MockDeliverySource, handler: RoleHandler) -> Dispatcher {
        Dispatcher::new(
            Arc::new(source),
            "payments",
            Role::Sender,
            handler,
            Arc::new(BackoffSequence::default()),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn connectivity_errors_are_retried() {
        let mut source = MockDeliverySource::new();
        let mut seq = Sequence::new();

        source
            .expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(AmqpError::ConnectionLostError("payments-retry".into())));
        source
            .expect_discard()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| ());
        source
            .expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(AmqpError::SessionClosedError("payments".into())));

        let result = dispatcher(source, noop_handler()).spawn().wait().await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn topology_errors_stop_the_loop() {
        let mut source = MockDeliverySource::new();
        source
            .expect_start()
            .times(1)
            .returning(|| Err(AmqpError::DeclareQueueError("payments".into())));
        source.expect_discard().never();

        let result = dispatcher(source, noop_handler()).spawn().wait().await;
        assert_eq!(result, Err(AmqpError::DeclareQueueError("payments".into())));
    }

    #[tokio::test]
    async fn closed_session_ends_the_loop_cleanly() {
        let mut source = MockDeliverySource::new();
        source
            .expect_start()
            .times(1)
            .return_once(|| Ok(deliveries(MockBrokerChannel::new(), vec![])));
        source.expect_is_closed().return_const(true);
        source.expect_stream_lost().never();
        source.expect_discard().never();

        let result = dispatcher(source, noop_handler()).spawn().wait().await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn ended_stream_reconnects() {
        let mut source = MockDeliverySource::new();
        let mut seq = Sequence::new();

        source
            .expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|| {
                Ok(deliveries(
                    MockBrokerChannel::new(),
                    vec![Err(AmqpError::ConsumerError("payments".into()))],
                ))
            });
        source
            .expect_is_closed()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(false);
        source
            .expect_stream_lost()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| ());
        source
            .expect_discard()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| ());
        source
            .expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(AmqpError::SessionClosedError("payments".into())));

        let result = dispatcher(source, noop_handler()).spawn().wait().await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn handler_calls_never_overlap() {
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let handled = Arc::new(AtomicUsize::new(0));

        let (flag, overlap, count) = (in_flight.clone(), overlapped.clone(), handled.clone());
        let handler = move |_delivery: SenderDelivery| {
            let (flag, overlap, count) = (flag.clone(), overlap.clone(), count.clone());
            async move {
                if flag.swap(true, Ordering::SeqCst) {
                    overlap.store(true, Ordering::SeqCst);
                }
                sleep(Duration::from_millis(20)).await;
                flag.store(false, Ordering::SeqCst);
                count.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        };

        let mut source = MockDeliverySource::new();
        source.expect_start().times(1).return_once(|| {
            Ok(deliveries(
                MockBrokerChannel::new(),
                vec![Ok(message(1)), Ok(message(2))],
            ))
        });
        source.expect_is_closed().return_const(true);

        let handler = RoleHandler::Sender {
            handler: Arc::new(handler),
            resend_timeout: Duration::from_secs(60),
        };

        let result = dispatcher(source, handler).spawn().wait().await;

        assert_eq!(result, Ok(()));
        assert_eq!(handled.load(Ordering::SeqCst), 2);
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_lets_the_handler_in_flight_settle() {
        let started = Arc::new(Notify::new());
        let acked = Arc::new(AtomicBool::new(false));

        let mut channel = MockBrokerChannel::new();
        let ack_flag = acked.clone();
        channel.expect_ack().times(1).returning(move |_| {
            ack_flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let mut source = MockDeliverySource::new();
        source.expect_start().times(1).return_once(move || {
            Ok(DeliveryStream {
                channel: Arc::new(channel),
                deliveries: stream::iter(vec![Ok(message(3))])
                    .chain(stream::pending())
                    .boxed(),
            })
        });
        let closed_after_ack = acked.clone();
        source
            .expect_close()
            .times(1)
            .returning(move || assert!(closed_after_ack.load(Ordering::SeqCst)));

        let notify = started.clone();
        let handler = move |delivery: SenderDelivery| {
            let notify = notify.clone();
            async move {
                notify.notify_one();
                sleep(Duration::from_millis(20)).await;
                delivery.ack().await?;
                Ok::<(), HandlerError>(())
            }
        };

        let handle = dispatcher(
            source,
            RoleHandler::Sender {
                handler: Arc::new(handler),
                resend_timeout: Duration::from_secs(60),
            },
        )
        .spawn();

        started.notified().await;
        assert_eq!(handle.shutdown().await, Ok(()));
        assert!(acked.load(Ordering::SeqCst));
    }
}
