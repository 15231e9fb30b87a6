// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Role-based RabbitMQ channels with broker-timed retries.
//!
//! Watchers publish, senders and workers consume one message at a time.
//! Consumers can push a message back to their queue after a backoff delay or,
//! for senders, after a fixed transaction status check delay. Both delays are
//! implemented with self-expiring TTL queues that dead-letter into a fanout
//! exchange bound to the work queue, so no scheduler runs outside the broker.

mod consumer;
mod otel;

pub mod channel;
pub mod client;
pub mod configs;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod session;
pub mod topology;
