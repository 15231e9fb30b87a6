// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Settings read from the process environment. A missing `AMQP_URL` is a valid
//! state meaning "not attached"; it never fails the load.

use crate::errors::AmqpError;
use std::time::Duration;

pub const AMQP_URL_ENV: &str = "AMQP_URL";
pub const AMQP_CONNECTION_NAME_ENV: &str = "AMQP_CONNECTION_NAME";
pub const AMQP_RECONNECT_DELAY_ENV: &str = "AMQP_RECONNECT_DELAY_MS";
pub const AMQP_RETRY_BACKOFF_ENV: &str = "AMQP_RETRY_BACKOFF";
pub const TRANSACTION_RESEND_TIMEOUT_ENV: &str = "TRANSACTION_RESEND_TIMEOUT";

pub const DEFAULT_CONNECTION_NAME: &str = "txqueue";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
/// Delay before a transaction status is checked again, in milliseconds.
pub const TRANSACTION_RESEND_TIMEOUT_MS: u64 = 60_000;
/// Retry wait in seconds, indexed by attempt number starting at 1.
pub const DEFAULT_RETRY_BACKOFF: [u64; 8] = [1, 5, 10, 30, 60, 120, 300, 600];

/// Connection and scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpConfigs {
    pub url: Option<String>,
    pub connection_name: String,
    pub reconnect_delay: Duration,
    pub retry_backoff: Vec<u64>,
    pub transaction_resend_timeout: Duration,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        AmqpConfigs {
            url: None,
            connection_name: DEFAULT_CONNECTION_NAME.to_owned(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            retry_backoff: DEFAULT_RETRY_BACKOFF.to_vec(),
            transaction_resend_timeout: Duration::from_millis(TRANSACTION_RESEND_TIMEOUT_MS),
        }
    }
}

impl AmqpConfigs {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary key lookup.
    ///
    /// # Parameters
    /// * `lookup` - Returns the raw value of a variable, or None when unset
    ///
    /// # Returns
    /// The configuration, or `ConfigurationError` naming the first malformed variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = AmqpConfigs::default();

        cfg.url = lookup(AMQP_URL_ENV)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty());

        if let Some(name) = lookup(AMQP_CONNECTION_NAME_ENV).filter(|v| !v.trim().is_empty()) {
            cfg.connection_name = name.trim().to_owned();
        }

        if let Some(raw) = lookup(AMQP_RECONNECT_DELAY_ENV) {
            cfg.reconnect_delay = Duration::from_millis(parse_u64(AMQP_RECONNECT_DELAY_ENV, &raw)?);
        }

        if let Some(raw) = lookup(AMQP_RETRY_BACKOFF_ENV) {
            cfg.retry_backoff = parse_backoff(&raw)?;
        }

        if let Some(raw) = lookup(TRANSACTION_RESEND_TIMEOUT_ENV) {
            let millis = parse_u64(TRANSACTION_RESEND_TIMEOUT_ENV, &raw)?;
            if millis == 0 {
                return Err(AmqpError::ConfigurationError(
                    TRANSACTION_RESEND_TIMEOUT_ENV.to_owned(),
                ));
            }
            cfg.transaction_resend_timeout = Duration::from_millis(millis);
        }

        Ok(cfg)
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, AmqpError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| AmqpError::ConfigurationError(key.to_owned()))
}

fn parse_backoff(raw: &str) -> Result<Vec<u64>, AmqpError> {
    let seq = raw
        .split(',')
        .map(|item| parse_u64(AMQP_RETRY_BACKOFF_ENV, item))
        .collect::<Result<Vec<_>, _>>()?;

    if seq.is_empty() {
        return Err(AmqpError::ConfigurationError(AMQP_RETRY_BACKOFF_ENV.to_owned()));
    }

    Ok(seq)
}
