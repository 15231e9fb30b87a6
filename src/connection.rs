// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! One `ConnectionManager` owns the single broker connection of a process and
//! hands out channels on it. The connection is opened lazily and reopened on
//! the next request after lapin reports it broken; lifecycle changes are
//! published through a `watch` channel and reported to a
//! [`ConnectionObserver`].
//!
//! The manager is an ordinary value: construct it at startup, share it behind
//! an `Arc`, and call [`ConnectionManager::close`] at shutdown.

use crate::{configs::AmqpConfigs, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::{
    net::lookup_host,
    sync::{watch, Mutex},
};
use tracing::{debug, error, info, warn};
use url::{Host, Url};

/// Port used when the broker URL does not carry one.
pub const DEFAULT_AMQP_PORT: u16 = 5672;
/// Port used for `amqps` URLs that do not carry one.
pub const DEFAULT_AMQPS_PORT: u16 = 5671;

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Receives connection lifecycle notifications.
pub trait ConnectionObserver: Send + Sync {
    /// Called after a connection is established. `url` has its password redacted.
    fn on_connect(&self, url: &str);

    /// Called when an established connection breaks or is closed.
    fn on_disconnect(&self, reason: &str);
}

/// Observer that writes lifecycle events to the `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ConnectionObserver for TracingObserver {
    fn on_connect(&self, url: &str) {
        info!(url, "amqp connected");
    }

    fn on_disconnect(&self, reason: &str) {
        warn!(reason, "amqp disconnected");
    }
}

/// Owner of the process-wide broker connection.
pub struct ConnectionManager {
    configs: AmqpConfigs,
    observer: Arc<dyn ConnectionObserver>,
    connection: Mutex<Option<Arc<Connection>>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionManager {
    pub fn new(configs: AmqpConfigs) -> Self {
        ConnectionManager::with_observer(configs, Arc::new(TracingObserver))
    }

    /// Creates a manager reporting lifecycle events to `observer`.
    ///
    /// # Parameters
    /// * `configs` - Broker URL and connection name
    /// * `observer` - Receiver of connect and disconnect notifications
    ///
    /// # Returns
    /// A disconnected manager; the connection opens on first use
    pub fn with_observer(configs: AmqpConfigs, observer: Arc<dyn ConnectionObserver>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        ConnectionManager {
            configs,
            observer,
            connection: Mutex::new(None),
            state: Arc::new(state),
        }
    }

    pub fn configs(&self) -> &AmqpConfigs {
        &self.configs
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Checks the configured broker, see [`is_reachable`].
    pub async fn is_reachable(&self) -> bool {
        is_reachable(self.configs.url.as_deref()).await
    }

    /// Returns the live connection, opening a new one if there is none or the
    /// previous one broke. Makes a single attempt; callers decide whether and
    /// when to try again.
    ///
    /// # Returns
    /// The shared connection, or `NotConfiguredError`, `InvalidUrlError` or
    /// `ConnectionError`
    pub async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        let url = self
            .configs
            .url
            .as_deref()
            .ok_or(AmqpError::NotConfiguredError)?;

        if let Err(err) = Url::parse(url) {
            error!(error = err.to_string(), "invalid amqp url");
            return Err(AmqpError::InvalidUrlError(err.to_string()));
        }

        let mut current = self.connection.lock().await;
        if let Some(conn) = current.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
        }

        self.state.send_replace(ConnectionState::Connecting);
        let redacted = redact_url(url);

        debug!(url = %redacted, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.configs.connection_name.clone()));

        let conn = match Connection::connect(url, options).await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), url = %redacted, "failure to connect");
                *current = None;
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(AmqpError::ConnectionError);
            }
        };

        let state = self.state.clone();
        let observer = self.observer.clone();
        conn.on_error(move |err| {
            state.send_replace(ConnectionState::Disconnected);
            observer.on_disconnect(&err.to_string());
        });

        let conn = Arc::new(conn);
        *current = Some(conn.clone());
        self.state.send_replace(ConnectionState::Connected);
        self.observer.on_connect(&redacted);

        Ok(conn)
    }

    /// Creates a channel on the live connection.
    ///
    /// # Returns
    /// A new channel, or the connection error, or `ChannelError`
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        let conn = self.connection().await?;

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(c) => {
                debug!(channel = c.id(), "channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Reports a consumer stream that ended while the connection still looked healthy.
    pub(crate) fn report_stream_loss(&self, queue: &str) {
        if self.state() == ConnectionState::Connected {
            self.observer
                .on_disconnect(&format!("consumer stream of `{}` ended", queue));
        }
    }

    /// Closes the connection. A later `connection()` call opens a new one.
    pub async fn close(&self) {
        let Some(conn) = self.connection.lock().await.take() else {
            return;
        };

        if conn.status().connected() {
            if let Err(err) = conn.close(200, "closed by client").await {
                warn!(error = err.to_string(), "error to close the connection");
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        self.observer.on_disconnect("closed by client");
    }
}

/// Liveness check for a broker URL.
///
/// Host names are resolved, IP literals need no lookup. This is not a
/// protocol handshake and is never retried.
///
/// # Parameters
/// * `url` - The configured broker URL, if any
///
/// # Returns
/// false when no URL is given, when it cannot be parsed or has no host, or
/// when the host name does not resolve
pub async fn is_reachable(url: Option<&str>) -> bool {
    let Some(url) = url else {
        debug!("amqp url is not configured");
        return false;
    };

    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(err) => {
            warn!(error = err.to_string(), "invalid amqp url");
            return false;
        }
    };

    let port = parsed.port().unwrap_or(match parsed.scheme() {
        "amqps" => DEFAULT_AMQPS_PORT,
        _ => DEFAULT_AMQP_PORT,
    });

    match parsed.host() {
        Some(Host::Domain(domain)) => match lookup_host((domain, port)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(err) => {
                warn!(error = err.to_string(), host = domain, "amqp host does not resolve");
                false
            }
        },
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => true,
        None => false,
    }
}

/// Replaces the password of `url` for logging.
pub(crate) fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
                return "<redacted>".to_owned();
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_owned(),
    }
}
