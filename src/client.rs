// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client
//!
//! Entry point for application workers. An `AmqpClient` owns the connection
//! manager and opens one channel session per role:
//!
//! - [`AmqpClient::open_producer`]: watcher role, publish only
//! - [`AmqpClient::open_consumer`]: sender role, consume with retry and
//!   transaction resend
//! - [`AmqpClient::open_worker`]: worker role, consume with retry and forward
//!   results to a sender queue
//!
//! ```no_run
//! use txqueue::{
//!     client::AmqpClient, configs::AmqpConfigs, errors::HandlerError, handler::SenderDelivery,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = AmqpClient::new(AmqpConfigs::from_env()?)?;
//! if !client.is_attached().await {
//!     return Ok(());
//! }
//!
//! let consumer = client
//!     .open_consumer("payments", |delivery: SenderDelivery| async move {
//!         if delivery.message().retries() >= 5 {
//!             delivery.ack().await?;
//!         } else {
//!             delivery.schedule_retry().await?;
//!         }
//!         Ok::<(), HandlerError>(())
//!     })
//!     .await?;
//!
//! consumer.wait().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    configs::AmqpConfigs,
    connection::{ConnectionManager, ConnectionObserver, TracingObserver},
    consumer::RoleHandler,
    dispatcher::{ConsumerHandle, Dispatcher},
    errors::AmqpError,
    handler::{SenderHandler, WorkerHandler},
    publisher::Producer,
    retry::{Backoff, BackoffSequence},
    session::{ChannelSession, Role},
    topology::Topology,
};
use std::sync::Arc;
use tracing::info;

/// Opens role sessions on one shared broker connection.
pub struct AmqpClient {
    manager: Arc<ConnectionManager>,
    backoff: Arc<dyn Backoff>,
}

impl AmqpClient {
    /// Creates a client logging connection events through `tracing`.
    ///
    /// # Parameters
    /// * `configs` - Broker URL, reconnect delay, retry backoff and resend timeout
    ///
    /// # Returns
    /// The client, or `ConfigurationError` when the retry backoff is empty
    pub fn new(configs: AmqpConfigs) -> Result<Self, AmqpError> {
        AmqpClient::with_observer(configs, Arc::new(TracingObserver))
    }

    /// Creates a client reporting connection events to `observer`.
    ///
    /// # Parameters
    /// * `configs` - Broker and scheduling settings
    /// * `observer` - Receiver of connect and disconnect notifications
    ///
    /// # Returns
    /// The client, or `ConfigurationError` when the retry backoff is empty
    pub fn with_observer(
        configs: AmqpConfigs,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Self, AmqpError> {
        let backoff = Arc::new(BackoffSequence::new(configs.retry_backoff.clone())?);

        Ok(AmqpClient {
            manager: Arc::new(ConnectionManager::with_observer(configs, observer)),
            backoff,
        })
    }

    /// Replaces the retry backoff policy.
    ///
    /// # Parameters
    /// * `backoff` - Maps a retry attempt to its delay in seconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Whether a broker URL is configured and its host resolves.
    ///
    /// This is a name lookup, not a protocol handshake, and is never retried.
    ///
    /// # Returns
    /// false when the client is detached from any broker
    pub async fn is_attached(&self) -> bool {
        self.manager.is_reachable().await
    }

    /// Opens a watcher session publishing to `queue` and optionally `worker_queue`.
    ///
    /// # Parameters
    /// * `queue` - The work queue, declared durable
    /// * `worker_queue` - An optional second queue, declared durable
    ///
    /// # Returns
    /// A producer, or the error of the first channel setup
    pub async fn open_producer(
        &self,
        queue: &str,
        worker_queue: Option<&str>,
    ) -> Result<Producer, AmqpError> {
        let session = ChannelSession::open(
            Role::Watcher,
            queue,
            self.manager.clone(),
            Topology::producer(queue, worker_queue),
        )
        .await?;

        info!(queue, worker_queue, "producer opened");
        Ok(Producer::new(session, queue, worker_queue))
    }

    /// Opens a sender session consuming `queue` and starts its consumer loop.
    ///
    /// # Parameters
    /// * `queue` - The work queue, bound to its `<queue>-retry` dead-letter exchange
    /// * `handler` - Business logic run for each delivery
    ///
    /// # Returns
    /// A handle on the consumer loop, or the error of the first channel setup
    pub async fn open_consumer<H>(&self, queue: &str, handler: H) -> Result<ConsumerHandle, AmqpError>
    where
        H: SenderHandler,
    {
        let session = ChannelSession::open(
            Role::Sender,
            queue,
            self.manager.clone(),
            Topology::consumer(queue),
        )
        .await?;

        let handler = RoleHandler::Sender {
            handler: Arc::new(handler),
            resend_timeout: self.manager.configs().transaction_resend_timeout,
        };

        Ok(self.dispatch(session, handler))
    }

    /// Opens a worker session consuming `queue` and starts its consumer loop.
    ///
    /// # Parameters
    /// * `queue` - The work queue, bound to its `<queue>-retry` dead-letter exchange
    /// * `sender_queue` - The durable queue results are forwarded to
    /// * `handler` - Business logic run for each delivery
    ///
    /// # Returns
    /// A handle on the consumer loop, or the error of the first channel setup
    pub async fn open_worker<H>(
        &self,
        queue: &str,
        sender_queue: &str,
        handler: H,
    ) -> Result<ConsumerHandle, AmqpError>
    where
        H: WorkerHandler,
    {
        let session = ChannelSession::open(
            Role::Worker,
            queue,
            self.manager.clone(),
            Topology::worker(queue, sender_queue),
        )
        .await?;

        let handler = RoleHandler::Worker {
            handler: Arc::new(handler),
            sender_queue: sender_queue.to_owned(),
        };

        Ok(self.dispatch(session, handler))
    }

    /// Closes the broker connection. Open sessions reconnect on next use.
    pub async fn close(&self) {
        self.manager.close().await;
    }

    fn dispatch(&self, session: Arc<ChannelSession>, handler: RoleHandler) -> ConsumerHandle {
        Dispatcher::for_session(
            session,
            handler,
            self.backoff.clone(),
            self.manager.configs().reconnect_delay,
        )
        .spawn()
    }
}
