// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumed Messages
//!
//! The broker-independent view of a delivery handed to handlers: the JSON
//! payload, the retry count carried in the `retries` header and the identity
//! needed to settle it.

use crate::errors::AmqpError;
use lapin::{
    message::Delivery,
    types::{AMQPValue, FieldTable},
};
use serde::de::DeserializeOwned;
use tracing::error;

/// Reserved header holding the number of retries a message went through.
pub const RETRIES_HEADER: &str = "retries";

/// A message received from a work queue.
#[derive(Debug, Clone)]
pub struct Message {
    delivery_tag: u64,
    queue: String,
    redelivered: bool,
    headers: FieldTable,
    payload: Vec<u8>,
}

impl Message {
    pub(crate) fn new(
        delivery_tag: u64,
        queue: &str,
        redelivered: bool,
        headers: FieldTable,
        payload: Vec<u8>,
    ) -> Message {
        Message {
            delivery_tag,
            queue: queue.to_owned(),
            redelivered,
            headers,
            payload,
        }
    }

    pub(crate) fn from_delivery(queue: &str, delivery: Delivery) -> Message {
        Message::new(
            delivery.delivery_tag,
            queue,
            delivery.redelivered,
            delivery.properties.headers().clone().unwrap_or_default(),
            delivery.data,
        )
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// The queue the message was consumed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the broker delivered this message before, e.g. after a nack.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn headers(&self) -> &FieldTable {
        &self.headers
    }

    /// Decodes the JSON payload.
    ///
    /// # Returns
    /// The decoded value or `ParsePayloadError`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.payload).map_err(|err| {
            error!(error = err.to_string(), queue = %self.queue, "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }

    /// Retries recorded in the `retries` header, 0 when absent.
    pub fn retries(&self) -> u32 {
        self.headers
            .inner()
            .get(RETRIES_HEADER)
            .and_then(header_as_u32)
            .unwrap_or_default()
    }
}

// Publishers in other stacks write the counter with whatever integer width
// their client picks.
fn header_as_u32(value: &AMQPValue) -> Option<u32> {
    let n: i64 = match value {
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.parse().ok()?,
        _ => return None,
    };

    u32::try_from(n).ok()
}
