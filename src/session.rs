// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Sessions
//!
//! A session is the channel of one role together with its setup routine.
//! The channel is created on first use and recreated whenever the previous
//! one is no longer open; every time, the role's [`Topology`] is installed
//! before the channel is handed out.

use crate::{connection::ConnectionManager, errors::AmqpError, topology::Topology};
use lapin::Channel;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Connection roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Publishes into a work queue, never consumes.
    Watcher,
    /// Consumes a work queue; may retry or schedule transaction resends.
    Sender,
    /// Consumes a work queue and forwards results to a sender queue.
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Watcher => write!(f, "watcher"),
            Role::Sender => write!(f, "sender"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// Channel of one role plus the topology installed on it.
pub struct ChannelSession {
    role: Role,
    queue: String,
    manager: Arc<ConnectionManager>,
    topology: Topology,
    current: Mutex<Option<Channel>>,
    closed: AtomicBool,
}

impl ChannelSession {
    /// Opens the session and installs its topology once.
    ///
    /// # Parameters
    /// * `role` - The role the channel serves
    /// * `queue` - The work queue of the session
    /// * `manager` - The shared connection manager
    /// * `topology` - Declarations installed on every new channel
    ///
    /// # Returns
    /// The session, or the first setup failure, including a declaration conflict
    pub async fn open(
        role: Role,
        queue: &str,
        manager: Arc<ConnectionManager>,
        topology: Topology,
    ) -> Result<Arc<ChannelSession>, AmqpError> {
        let session = Arc::new(ChannelSession {
            role,
            queue: queue.to_owned(),
            manager,
            topology,
            current: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        session.channel().await?;
        Ok(session)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The work queue the session was opened for.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the open channel, creating it and installing the topology if needed.
    ///
    /// # Returns
    /// The channel, `SessionClosedError` after `close`, or the connection or
    /// setup error
    pub async fn channel(&self) -> Result<Channel, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::SessionClosedError(self.queue.clone()));
        }

        let mut current = self.current.lock().await;
        if let Some(channel) = current.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.manager.create_channel().await?;
        if let Err(err) = self.topology.install(&channel).await {
            error!(
                error = err.to_string(),
                role = %self.role,
                queue = %self.queue,
                "failure to setup the channel"
            );
            close_channel(&channel).await;
            return Err(err);
        }

        debug!(role = %self.role, queue = %self.queue, "channel session ready");
        *current = Some(channel.clone());
        Ok(channel)
    }

    /// Drops the current channel so the next `channel()` call builds a new one.
    pub(crate) async fn invalidate(&self) {
        if let Some(channel) = self.current.lock().await.take() {
            close_channel(&channel).await;
        }
    }

    /// Closes the session. Subsequent sends fail and consumer loops stop.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.invalidate().await;
        debug!(role = %self.role, queue = %self.queue, "channel session closed");
    }
}

async fn close_channel(channel: &Channel) {
    if channel.status().connected() {
        if let Err(err) = channel.close(200, "OK").await {
            warn!(error = err.to_string(), "error to close the channel");
        }
    }
}
