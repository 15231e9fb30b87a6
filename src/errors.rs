// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! The `AmqpError` enum covers every failure the crate reports: configuration,
//! connectivity, topology declaration, publishing and message settlement.
//! Variants are grouped by how the caller is expected to react, see
//! [`AmqpError::is_connectivity`].

use thiserror::Error;

/// Errors returned by handlers. Logged and recorded on the message span; the
/// consumer loop never settles a message on the handler's behalf.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// An environment variable holds a value that cannot be parsed
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// No broker URL is configured
    #[error("amqp url is not configured")]
    NotConfiguredError,

    /// The configured broker URL cannot be parsed
    #[error("invalid amqp url `{0}`")]
    InvalidUrlError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The connection or channel went away while declaring the named target
    #[error("connection lost while declaring `{0}`")]
    ConnectionLostError(String),

    /// The session was closed by the caller
    #[error("session `{0}` is closed")]
    SessionClosedError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// The producer was opened without a worker queue
    #[error("worker queue is not configured")]
    WorkerQueueNotConfigured,

    /// Error encoding a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// The delivery stream of a consumer failed
    #[error("failure to consume from `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the error comes from the network or the broker connection
    /// rather than from configuration or topology. Connectivity errors are
    /// retried by the consumer loop; everything else ends the session.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError
                | AmqpError::ChannelError
                | AmqpError::ConnectionLostError(_)
                | AmqpError::ConsumerError(_)
                | AmqpError::ConsumerDeclarationError(_)
                | AmqpError::PublishingError(_)
                | AmqpError::AckMessageError
                | AmqpError::NackMessageError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_errors_are_not_retried() {
        assert!(!AmqpError::DeclareQueueError("payments".into()).is_connectivity());
        assert!(!AmqpError::DeclareExchangeError("payments-retry".into()).is_connectivity());
        assert!(!AmqpError::BindingExchangeToQueueError("a".into(), "b".into()).is_connectivity());
        assert!(!AmqpError::NotConfiguredError.is_connectivity());
        assert!(AmqpError::ConnectionError.is_connectivity());
        assert!(AmqpError::ChannelError.is_connectivity());
        assert!(AmqpError::ConnectionLostError("payments-retry".into()).is_connectivity());
        assert!(AmqpError::ConsumerDeclarationError("payments".into()).is_connectivity());
        assert!(!AmqpError::InvalidUrlError("relative URL without a base".into()).is_connectivity());
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("payments-retry".into(), "payments".into());
        assert_eq!(
            err.to_string(),
            "failure to binding exchange `payments-retry` to queue `payments`"
        );
    }
}
