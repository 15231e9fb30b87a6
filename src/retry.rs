// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Retry and Transaction Resend
//!
//! The broker is used as the timer. A message that must come back later is
//! published into a delay queue whose per-message TTL is the wanted delay and
//! whose dead-letter exchange is the fanout `<queue>-retry` bound to the work
//! queue. When the TTL elapses the broker dead-letters the message into that
//! exchange, which routes it back into the work queue.
//!
//! Delay queues are keyed by their delay, so every message waiting for the
//! same delay shares one queue. They expire after ten times their TTL without
//! use, which lets the broker collect delays that are no longer needed.
//!
//! Two schedulers sit on top of the [`DelayQueueProvisioner`]:
//! - [`RetryScheduler`]: escalating delay from a pluggable [`Backoff`],
//!   queue `<queue>-retry-<delay ms>`, `retries` header incremented
//! - [`TransactionResendScheduler`]: one fixed delay, queue
//!   `<queue>-check-tx-status`, no `retries` header

use crate::{
    channel::BrokerChannel,
    configs::{DEFAULT_RETRY_BACKOFF, TRANSACTION_RESEND_TIMEOUT_ENV},
    errors::AmqpError,
    exchange::dead_letter_exchange_name,
    message::RETRIES_HEADER,
    publisher::publish_to_queue,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, LongLongInt, ShortString};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info};

/// Delay queues are deleted after this many TTLs without use.
pub const DELAY_QUEUE_EXPIRY_FACTOR: u64 = 10;
/// Lower bound for `x-expires`, which the broker requires to be positive.
pub const MIN_DELAY_QUEUE_EXPIRY_MS: u64 = 1_000;
/// Setting named by errors about the retry backoff.
pub const RETRY_BACKOFF_SETTING: &str = "retry backoff";
/// Suffix of the queue holding messages waiting for a transaction status check.
pub const TRANSACTION_CHECK_QUEUE_SUFFIX: &str = "-check-tx-status";

/// Maps a retry attempt (starting at 1) to the wait before it, in seconds.
pub trait Backoff: Send + Sync {
    fn delay_secs(&self, attempt: u32) -> u64;
}

impl<F> Backoff for F
where
    F: Fn(u32) -> u64 + Send + Sync,
{
    fn delay_secs(&self, attempt: u32) -> u64 {
        self(attempt)
    }
}

/// Backoff given as a list of waits. Attempts past the end of the list reuse
/// the last wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSequence {
    steps: Vec<u64>,
}

impl BackoffSequence {
    /// Creates a backoff from a list of waits in seconds.
    ///
    /// # Parameters
    /// * `steps` - Wait before attempt 1, 2, ... ; the last one repeats
    ///
    /// # Returns
    /// The backoff, or `ConfigurationError` when `steps` is empty
    pub fn new(steps: Vec<u64>) -> Result<Self, AmqpError> {
        if steps.is_empty() {
            return Err(AmqpError::ConfigurationError(RETRY_BACKOFF_SETTING.to_owned()));
        }

        Ok(BackoffSequence { steps })
    }

    pub fn steps(&self) -> &[u64] {
        &self.steps
    }
}

impl Default for BackoffSequence {
    fn default() -> Self {
        BackoffSequence {
            steps: DEFAULT_RETRY_BACKOFF.to_vec(),
        }
    }
}

impl Backoff for BackoffSequence {
    fn delay_secs(&self, attempt: u32) -> u64 {
        let idx = (attempt.saturating_sub(1) as usize).min(self.steps.len() - 1);
        self.steps[idx]
    }
}

/// Name of the retry queue for `queue` and a delay.
///
/// # Parameters
/// * `queue` - The work queue
/// * `delay_ms` - The delay in milliseconds
///
/// # Returns
/// `<queue>-retry-<delay_ms>`
pub fn retry_queue_name(queue: &str, delay_ms: u64) -> String {
    format!("{}-{}", dead_letter_exchange_name(queue), delay_ms)
}

/// Name of the transaction status check queue for `queue`.
pub fn transaction_check_queue_name(queue: &str) -> String {
    format!("{}{}", queue, TRANSACTION_CHECK_QUEUE_SUFFIX)
}

/// Idle expiry of a delay queue with the given TTL.
pub fn delay_queue_expiry(ttl_ms: u64) -> u64 {
    ttl_ms
        .saturating_mul(DELAY_QUEUE_EXPIRY_FACTOR)
        .max(MIN_DELAY_QUEUE_EXPIRY_MS)
}

/// TTL and idle expiry of a delay queue for `delay`.
///
/// # Parameters
/// * `delay` - How long messages wait in the queue
/// * `setting` - The configuration the delay comes from, named in the error
///
/// # Returns
/// `(ttl_ms, expires_ms)`, or `ConfigurationError(setting)` when either value
/// does not fit the broker's signed 64-bit millisecond arguments
pub fn delay_queue_timing(delay: Duration, setting: &str) -> Result<(u64, u64), AmqpError> {
    let out_of_range = || AmqpError::ConfigurationError(setting.to_owned());

    let ttl_ms = u64::try_from(delay.as_millis()).map_err(|_| out_of_range())?;
    let expires_ms = delay_queue_expiry(ttl_ms);

    i64::try_from(ttl_ms).map_err(|_| out_of_range())?;
    i64::try_from(expires_ms).map_err(|_| out_of_range())?;

    Ok((ttl_ms, expires_ms))
}

/// A delay queue ready to receive messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub ttl_ms: u64,
    pub expires_ms: u64,
}

/// Provides queues whose messages come back to the work queue after a delay.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DelayQueueProvisioner: Send + Sync {
    /// Declares (or re-declares) the delay queue `key`. Must be idempotent for
    /// identical arguments.
    async fn ensure_delay_queue(
        &self,
        key: &str,
        ttl_ms: u64,
        expires_ms: u64,
    ) -> Result<QueueHandle, AmqpError>;
}

/// Delay queues built from per-message TTL, queue expiry and dead-lettering.
pub struct TtlDelayQueues {
    channel: Arc<dyn BrokerChannel>,
    dead_letter_exchange: String,
}

impl TtlDelayQueues {
    /// Delay queues dead-lettering into the exchange bound to `queue`.
    ///
    /// # Parameters
    /// * `channel` - The channel the queues are declared on
    /// * `queue` - The work queue expired messages return to
    ///
    /// # Returns
    /// A provisioner for `queue`
    pub fn new(channel: Arc<dyn BrokerChannel>, queue: &str) -> Self {
        TtlDelayQueues {
            channel,
            dead_letter_exchange: dead_letter_exchange_name(queue),
        }
    }
}

#[async_trait]
impl DelayQueueProvisioner for TtlDelayQueues {
    async fn ensure_delay_queue(
        &self,
        key: &str,
        ttl_ms: u64,
        expires_ms: u64,
    ) -> Result<QueueHandle, AmqpError> {
        let def = QueueDefinition::new(key)
            .durable()
            .dead_letter_to(&self.dead_letter_exchange)
            .ttl(ttl_ms)
            .expires_after(expires_ms);

        self.channel.declare_queue(&def).await?;

        Ok(QueueHandle {
            name: key.to_owned(),
            ttl_ms,
            expires_ms,
        })
    }
}

/// Outcome of a scheduled retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    /// Value written to the `retries` header.
    pub retries: u32,
    pub delay: Duration,
    pub queue: String,
}

/// Schedules a message back into its work queue after a backoff delay.
pub struct RetryScheduler {
    queue: String,
    backoff: Arc<dyn Backoff>,
    channel: Arc<dyn BrokerChannel>,
    delay_queues: Arc<dyn DelayQueueProvisioner>,
}

impl RetryScheduler {
    /// Creates a scheduler declaring its delay queues on `channel`.
    ///
    /// # Parameters
    /// * `queue` - The work queue messages return to
    /// * `backoff` - Maps the next attempt to its delay in seconds
    /// * `channel` - The channel used to declare and publish
    ///
    /// # Returns
    /// A retry scheduler for `queue`
    pub fn new(queue: &str, backoff: Arc<dyn Backoff>, channel: Arc<dyn BrokerChannel>) -> Self {
        let delay_queues = Arc::new(TtlDelayQueues::new(channel.clone(), queue));
        RetryScheduler::with_provisioner(queue, backoff, channel, delay_queues)
    }

    /// Creates a scheduler with a custom delay-queue provisioner.
    ///
    /// # Parameters
    /// * `queue` - The work queue messages return to
    /// * `backoff` - Maps the next attempt to its delay in seconds
    /// * `channel` - The channel used to publish
    /// * `delay_queues` - Declares the delay queues
    ///
    /// # Returns
    /// A retry scheduler for `queue`
    pub fn with_provisioner(
        queue: &str,
        backoff: Arc<dyn Backoff>,
        channel: Arc<dyn BrokerChannel>,
        delay_queues: Arc<dyn DelayQueueProvisioner>,
    ) -> Self {
        RetryScheduler {
            queue: queue.to_owned(),
            backoff,
            channel,
            delay_queues,
        }
    }

    /// Computes where and how long a message that went through `current`
    /// retries waits next.
    ///
    /// # Parameters
    /// * `current` - Retries the message already went through
    ///
    /// # Returns
    /// The next retry count, its delay and its delay queue
    pub fn plan(&self, current: u32) -> RetryPlan {
        let retries = current.saturating_add(1);
        let delay_ms = self.backoff.delay_secs(retries).saturating_mul(1_000);

        RetryPlan {
            retries,
            delay: Duration::from_millis(delay_ms),
            queue: retry_queue_name(&self.queue, delay_ms),
        }
    }

    /// Publishes `payload` into the delay queue for its next attempt.
    ///
    /// The message never goes straight back to the work queue: it waits at
    /// least the backoff delay in the retry queue first.
    ///
    /// # Parameters
    /// * `payload` - The encoded message body
    /// * `current` - Retries the message already went through
    ///
    /// # Returns
    /// The plan that was applied, or `ConfigurationError` when the delay does
    /// not fit the broker's arguments, or the declaration or publish error
    pub async fn schedule_retry(&self, payload: &[u8], current: u32) -> Result<RetryPlan, AmqpError> {
        let plan = self.plan(current);
        let (ttl_ms, expires_ms) = delay_queue_timing(plan.delay, RETRY_BACKOFF_SETTING)?;

        let handle = self
            .delay_queues
            .ensure_delay_queue(&plan.queue, ttl_ms, expires_ms)
            .await?;

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(RETRIES_HEADER),
            AMQPValue::LongLongInt(LongLongInt::from(plan.retries)),
        );

        publish_to_queue(self.channel.as_ref(), &handle.name, payload, headers).await?;

        info!(
            queue = %self.queue,
            retry_queue = %handle.name,
            retries = plan.retries,
            delay_ms = ttl_ms,
            "message scheduled for retry"
        );

        Ok(plan)
    }
}

/// Schedules a message back into its work queue after the fixed transaction
/// status check delay.
pub struct TransactionResendScheduler {
    queue: String,
    timeout: Duration,
    channel: Arc<dyn BrokerChannel>,
    delay_queues: Arc<dyn DelayQueueProvisioner>,
}

impl TransactionResendScheduler {
    /// Creates a scheduler declaring its check queue on `channel`.
    ///
    /// # Parameters
    /// * `queue` - The work queue messages return to
    /// * `timeout` - How long a message waits before its transaction is checked again
    /// * `channel` - The channel used to declare and publish
    ///
    /// # Returns
    /// A transaction resend scheduler for `queue`
    pub fn new(queue: &str, timeout: Duration, channel: Arc<dyn BrokerChannel>) -> Self {
        let delay_queues = Arc::new(TtlDelayQueues::new(channel.clone(), queue));
        TransactionResendScheduler::with_provisioner(queue, timeout, channel, delay_queues)
    }

    /// Creates a scheduler with a custom delay-queue provisioner.
    ///
    /// # Parameters
    /// * `queue` - The work queue messages return to
    /// * `timeout` - How long a message waits before its transaction is checked again
    /// * `channel` - The channel used to publish
    /// * `delay_queues` - Declares the check queue
    ///
    /// # Returns
    /// A transaction resend scheduler for `queue`
    pub fn with_provisioner(
        queue: &str,
        timeout: Duration,
        channel: Arc<dyn BrokerChannel>,
        delay_queues: Arc<dyn DelayQueueProvisioner>,
    ) -> Self {
        TransactionResendScheduler {
            queue: queue.to_owned(),
            timeout,
            channel,
            delay_queues,
        }
    }

    /// Publishes `payload` into `<queue>-check-tx-status`. No retry count is attached.
    ///
    /// # Parameters
    /// * `payload` - The encoded message body
    ///
    /// # Returns
    /// The check queue, or `ConfigurationError` when the timeout does not fit the
    /// broker's arguments, or the declaration or publish error
    pub async fn schedule_resend(&self, payload: &[u8]) -> Result<QueueHandle, AmqpError> {
        let (ttl_ms, expires_ms) =
            delay_queue_timing(self.timeout, TRANSACTION_RESEND_TIMEOUT_ENV)?;

        let handle = self
            .delay_queues
            .ensure_delay_queue(&transaction_check_queue_name(&self.queue), ttl_ms, expires_ms)
            .await?;

        publish_to_queue(self.channel.as_ref(), &handle.name, payload, BTreeMap::new()).await?;

        debug!(queue = %self.queue, check_queue = %handle.name, "transaction resend scheduled");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockBrokerChannel,
        queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_EXPIRES, AMQP_HEADERS_MESSAGE_TTL},
    };
    use lapin::{types::LongString, BasicProperties};

    fn retries_header(props: &BasicProperties) -> Option<AMQPValue> {
        props
            .headers()
            .as_ref()
            .and_then(|h| h.inner().get(RETRIES_HEADER).cloned())
    }

    fn payments_backoff() -> Arc<dyn Backoff> {
        Arc::new(BackoffSequence::new(vec![5, 15, 60]).unwrap())
    }

    #[test]
    fn backoff_sequence_clamps_to_last_step() {
        let backoff = BackoffSequence::new(vec![5, 15, 60]).unwrap();

        assert_eq!(backoff.delay_secs(1), 5);
        assert_eq!(backoff.delay_secs(2), 15);
        assert_eq!(backoff.delay_secs(3), 60);
        assert_eq!(backoff.delay_secs(40), 60);
        assert_eq!(backoff.delay_secs(0), 5);
        assert!(BackoffSequence::new(vec![]).is_err());
    }

    #[test]
    fn closures_are_backoff_policies() {
        let exponential = |attempt: u32| 2u64.pow(attempt);
        assert_eq!(exponential.delay_secs(3), 8);
    }

    #[test]
    fn plans_follow_the_backoff() {
        let scheduler = RetryScheduler::with_provisioner(
            "payments",
            payments_backoff(),
            Arc::new(MockBrokerChannel::new()),
            Arc::new(MockDelayQueueProvisioner::new()),
        );

        assert_eq!(
            scheduler.plan(0),
            RetryPlan {
                retries: 1,
                delay: Duration::from_secs(5),
                queue: "payments-retry-5000".into()
            }
        );
        assert_eq!(scheduler.plan(1).queue, "payments-retry-15000");
        assert_eq!(scheduler.plan(2).retries, 3);
        assert_eq!(scheduler.plan(9).delay, Duration::from_secs(60));
    }

    #[test]
    fn delay_queue_expiry_is_ten_ttls() {
        assert_eq!(delay_queue_expiry(5_000), 50_000);
        assert_eq!(delay_queue_expiry(0), MIN_DELAY_QUEUE_EXPIRY_MS);
    }

    #[tokio::test]
    async fn first_retry_goes_through_a_five_second_queue() {
        let mut channel = MockBrokerChannel::new();

        channel
            .expect_declare_queue()
            .withf(|def| {
                let args = def.arguments();
                let args = args.inner();

                def.name() == "payments-retry-5000"
                    && def.is_durable()
                    && args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
                        == Some(&AMQPValue::LongString(LongString::from("payments-retry")))
                    && args.get(AMQP_HEADERS_MESSAGE_TTL) == Some(&AMQPValue::LongLongInt(5_000))
                    && args.get(AMQP_HEADERS_EXPIRES) == Some(&AMQPValue::LongLongInt(50_000))
            })
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange, routing_key, payload, props| {
                exchange.is_empty()
                    && routing_key == "payments-retry-5000"
                    && payload.to_vec() == b"{\"id\":1}".to_vec()
                    && props.delivery_mode() == &Some(2)
                    && retries_header(props) == Some(AMQPValue::LongLongInt(1))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
        let scheduler = RetryScheduler::new("payments", payments_backoff(), channel);

        let plan = scheduler.schedule_retry(b"{\"id\":1}", 0).await.unwrap();
        assert_eq!(plan.retries, 1);
    }

    #[tokio::test]
    async fn same_delay_reuses_the_same_queue() {
        let mut provisioner = MockDelayQueueProvisioner::new();
        provisioner
            .expect_ensure_delay_queue()
            .withf(|key, ttl, expires| key == "payments-retry-60000" && *ttl == 60_000 && *expires == 600_000)
            .times(2)
            .returning(|key, ttl_ms, expires_ms| {
                Ok(QueueHandle {
                    name: key.to_owned(),
                    ttl_ms,
                    expires_ms,
                })
            });

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|_, routing_key, _, _| routing_key == "payments-retry-60000")
            .times(2)
            .returning(|_, _, _, _| Ok(()));

        let scheduler = RetryScheduler::with_provisioner(
            "payments",
            payments_backoff(),
            Arc::new(channel),
            Arc::new(provisioner),
        );

        assert_eq!(scheduler.schedule_retry(b"a", 2).await.unwrap().retries, 3);
        assert_eq!(scheduler.schedule_retry(b"b", 7).await.unwrap().retries, 8);
    }

    #[tokio::test]
    async fn out_of_range_backoff_is_refused_before_declaring() {
        let mut provisioner = MockDelayQueueProvisioner::new();
        provisioner.expect_ensure_delay_queue().never();

        let mut channel = MockBrokerChannel::new();
        channel.expect_publish().never();

        let scheduler = RetryScheduler::with_provisioner(
            "payments",
            Arc::new(|_attempt: u32| u64::MAX / 100),
            Arc::new(channel),
            Arc::new(provisioner),
        );

        assert_eq!(
            scheduler.schedule_retry(b"a", 0).await.unwrap_err(),
            AmqpError::ConfigurationError(RETRY_BACKOFF_SETTING.into())
        );
    }

    #[test]
    fn delay_queue_timing_bounds() {
        assert_eq!(
            delay_queue_timing(Duration::from_secs(5), RETRY_BACKOFF_SETTING),
            Ok((5_000, 50_000))
        );
        assert_eq!(
            delay_queue_timing(Duration::from_millis(i64::MAX as u64), "x"),
            Err(AmqpError::ConfigurationError("x".into()))
        );
        assert_eq!(
            delay_queue_timing(Duration::MAX, "x"),
            Err(AmqpError::ConfigurationError("x".into()))
        );
    }

    #[tokio::test]
    async fn declaration_failure_skips_the_publish() {
        let mut provisioner = MockDelayQueueProvisioner::new();
        provisioner
            .expect_ensure_delay_queue()
            .returning(|key, _, _| Err(AmqpError::DeclareQueueError(key.to_owned())));

        let mut channel = MockBrokerChannel::new();
        channel.expect_publish().never();

        let scheduler = RetryScheduler::with_provisioner(
            "payments",
            payments_backoff(),
            Arc::new(channel),
            Arc::new(provisioner),
        );

        assert_eq!(
            scheduler.schedule_retry(b"a", 0).await.unwrap_err(),
            AmqpError::DeclareQueueError("payments-retry-5000".into())
        );
    }

    #[tokio::test]
    async fn resend_uses_fixed_delay_and_no_retries_header() {
        let mut channel = MockBrokerChannel::new();

        channel
            .expect_declare_queue()
            .withf(|def| {
                def.name() == "payments-check-tx-status"
                    && def.message_ttl() == Some(60_000)
                    && def.expires() == Some(600_000)
                    && def.dead_letter_exchange() == Some("payments-retry")
            })
            .times(2)
            .returning(|_| Ok(()));
        channel
            .expect_publish()
            .withf(|_, routing_key, _, props| {
                routing_key == "payments-check-tx-status" && retries_header(props).is_none()
            })
            .times(2)
            .returning(|_, _, _, _| Ok(()));

        let scheduler = TransactionResendScheduler::new(
            "payments",
            Duration::from_secs(60),
            Arc::new(channel),
        );

        let first = scheduler.schedule_resend(b"tx").await.unwrap();
        let second = scheduler.schedule_resend(b"tx").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.ttl_ms, 60_000);
    }
}
