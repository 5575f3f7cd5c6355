// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead Letter and Retry
//!
//! A protected queue `q` is paired with:
//!
//! - `q.dlx`: direct exchange the queue dead-letters into, routing key `q`
//! - `q.dlq`: queue bound to `q.dlx` holding messages for manual inspection
//! - `q.retry`: holding queue for delayed retries, dead-lettering back into
//!   `q` through the default exchange once a message expiration elapses
//!
//! A failed message is re-sent as a new envelope with an incremented retry
//! counter and the original acknowledged. Once the counter reached the retry
//! limit the message is rejected without requeue and the broker moves it to
//! `q.dlq`. Queues declared elsewhere may lack the dead-letter arguments, so
//! for them the envelope is published to `q.dlx` and then acknowledged.
//! Each message walks
//! `Pending -> Processing -> {Completed | Retrying -> Pending | DeadLettered}`.
//!
//! Dead-letter consumers are terminal: a failure there is logged and the
//! message acknowledged.

use crate::{
    consumer::{AckHandle, ConsumerHandler, FailureAction, ManualConsumerHandler},
    envelope::{Backoff, MessageEnvelope, RetryPolicy, HEADER_RETRY_DELAY},
    errors::{AmqpError, HandlerError},
    exchange::ExchangeDefinition,
    operations::{ConsumeOptions, ConsumerHandle, PublishOptions, QueueOperations},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::{debug, error, info, warn};

/// Dead-letter exchange of `queue`, as `<queue>.dlx`.
pub fn dead_letter_exchange_name(queue: &str) -> String {
    format!("{queue}.dlx")
}

/// Dead-letter queue of `queue`, as `<queue>.dlq`.
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// Holding queue for delayed retries of `queue`, as `<queue>.retry`.
pub fn retry_queue_name(queue: &str) -> String {
    format!("{queue}.retry")
}

/// Retry and dead-letter settings of one protected queue.
#[derive(Debug, Clone)]
pub struct DeadLetterOptions {
    /// Attempts after the first delivery before a message is dead-lettered.
    pub max_retries: u32,
    /// Message TTL of the protected queue in milliseconds; expired messages
    /// are dead-lettered as well.
    pub message_ttl: Option<u32>,
    /// Route retries through the `.retry` holding queue, which holds each
    /// message for its computed delay.
    pub delayed_retry: bool,
    /// Delay between attempts.
    pub backoff: Backoff,
}

impl Default for DeadLetterOptions {
    fn default() -> Self {
        DeadLetterOptions {
            max_retries: 3,
            message_ttl: None,
            delayed_retry: true,
            backoff: Backoff::default(),
        }
    }
}

impl DeadLetterOptions {
    fn policy(&self, max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries).with_backoff(self.backoff.clone())
    }
}

/// What happened to a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Re-sent with the incremented count, after `delay_ms`.
    Scheduled { retry_count: u32, delay_ms: u64 },
    /// Retries exhausted; the message went to the dead-letter queue.
    DeadLettered,
}

/// Re-sends failed envelopes of one queue.
struct Retrier {
    ops: Arc<QueueOperations>,
    queue: String,
    policy: RetryPolicy,
    delayed_retry: bool,
    /// The queue has no `x-dead-letter-exchange` of its own.
    republish_dead_letters: bool,
}

impl Retrier {
    async fn dead_letter(&self, envelope: &MessageEnvelope, ack: &AckHandle) -> Result<(), AmqpError> {
        if !self.republish_dead_letters {
            return ack.reject(false).await;
        }

        self.ops
            .publish_envelope(
                &dead_letter_exchange_name(&self.queue),
                &self.queue,
                envelope,
                &PublishOptions::default(),
            )
            .await?;
        ack.ack().await
    }

    async fn schedule(&self, next: &MessageEnvelope) -> Result<(), AmqpError> {
        let delay_ms = next.delay.unwrap_or_default();

        if self.delayed_retry {
            let opts = PublishOptions::default().expiration(delay_ms);
            self.ops
                .publish_envelope("", &retry_queue_name(&self.queue), next, &opts)
                .await?;
        } else {
            let mut next = next.clone();
            next.headers
                .get_or_insert_with(Default::default)
                .insert(HEADER_RETRY_DELAY.to_owned(), Value::from(delay_ms));

            self.ops
                .publish_envelope("", &self.queue, &next, &PublishOptions::default())
                .await?;
        }

        Ok(())
    }

    async fn retry_or_dead_letter(&self, envelope: &MessageEnvelope, ack: &AckHandle) -> Result<RetryOutcome, AmqpError> {
        if envelope.retry_count >= self.policy.max_retries {
            error!(
                queue = self.queue,
                id = envelope.id.as_str(),
                original_id = envelope.original_id(),
                retry_count = envelope.retry_count,
                "retry limit reached, dead-lettering message"
            );
            self.dead_letter(envelope, ack).await?;
            return Ok(RetryOutcome::DeadLettered);
        }

        let next = envelope.next_retry_with(&self.policy)?;
        self.schedule(&next).await?;
        ack.ack().await?;

        let delay_ms = next.delay.unwrap_or_default();
        warn!(
            queue = self.queue,
            id = next.id.as_str(),
            original_id = next.original_id(),
            retry_count = next.retry_count,
            delay_ms,
            "message scheduled for retry"
        );

        Ok(RetryOutcome::Scheduled {
            retry_count: next.retry_count,
            delay_ms,
        })
    }
}

/// Wraps an automatic handler with the retry state machine.
struct RetryingHandler {
    inner: Arc<dyn ConsumerHandler>,
    retrier: Arc<Retrier>,
}

#[async_trait]
impl ManualConsumerHandler for RetryingHandler {
    async fn exec(&self, envelope: &MessageEnvelope, ack: AckHandle) -> Result<(), HandlerError> {
        match self.inner.exec(envelope).await {
            Ok(_) => {
                ack.ack().await?;
                Ok(())
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue = self.retrier.queue,
                    retry_count = envelope.retry_count,
                    "handler failed"
                );
                self.retrier.retry_or_dead_letter(envelope, &ack).await?;
                Ok(())
            }
        }
    }
}

/// Per-message settlement for handlers driving retries themselves.
///
/// Exactly one of [`ack`](Self::ack), [`retry`](Self::retry) or
/// [`dead_letter`](Self::dead_letter) should be called. A handler failing
/// without settling is retried.
#[derive(Clone)]
pub struct RetryAckHandle {
    ack: AckHandle,
    envelope: MessageEnvelope,
    retrier: Arc<Retrier>,
}

impl RetryAckHandle {
    /// Acknowledges the message as processed.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.ack.ack().await
    }

    /// Schedules the next attempt, or dead-letters once the limit is reached.
    pub async fn retry(&self) -> Result<RetryOutcome, AmqpError> {
        if self.ack.is_settled() {
            return Err(AmqpError::AlreadySettled);
        }

        self.retrier.retry_or_dead_letter(&self.envelope, &self.ack).await
    }

    /// Rejects the message without requeue, sending it to the dead-letter queue
    /// whatever its retry count.
    pub async fn dead_letter(&self) -> Result<(), AmqpError> {
        info!(
            queue = self.retrier.queue,
            id = self.envelope.id.as_str(),
            "dead-lettering message on request"
        );
        self.retrier.dead_letter(&self.envelope, &self.ack).await
    }

    pub fn is_settled(&self) -> bool {
        self.ack.is_settled()
    }
}

/// Handler settling each message through a [`RetryAckHandle`].
///
/// Implemented for async closures taking the envelope and the handle.
#[async_trait]
pub trait RetryConsumerHandler: Send + Sync {
    /// Processes one message.
    ///
    /// # Parameters
    /// * `envelope` - Decoded message
    /// * `ack` - Settlement handle; an error returned without settling retries the message
    async fn exec(&self, envelope: &MessageEnvelope, ack: RetryAckHandle) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> RetryConsumerHandler for F
where
    F: Fn(MessageEnvelope, RetryAckHandle) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, envelope: &MessageEnvelope, ack: RetryAckHandle) -> Result<(), HandlerError> {
        (self)(envelope.clone(), ack).await
    }
}

struct ManualRetryingHandler {
    inner: Arc<dyn RetryConsumerHandler>,
    retrier: Arc<Retrier>,
}

#[async_trait]
impl ManualConsumerHandler for ManualRetryingHandler {
    async fn exec(&self, envelope: &MessageEnvelope, ack: AckHandle) -> Result<(), HandlerError> {
        let handle = RetryAckHandle {
            ack: ack.clone(),
            envelope: envelope.clone(),
            retrier: self.retrier.clone(),
        };

        let result = self.inner.exec(envelope, handle).await;

        if ack.is_settled() {
            return result;
        }

        if let Err(err) = result {
            warn!(error = err.to_string(), queue = self.retrier.queue, "handler failed");
            self.retrier.retry_or_dead_letter(envelope, &ack).await?;
        }

        Ok(())
    }
}

/// Retry and dead-letter handling for protected queues.
///
/// Each protected queue `q` gets a direct exchange `q.dlx`, a queue `q.dlq`
/// bound with the routing key `q` and, with delayed retries, a holding queue
/// `q.retry` dead-lettering back into `q`.
pub struct DeadLetterService {
    ops: Arc<QueueOperations>,
    protected: Mutex<HashMap<String, Protection>>,
}

#[derive(Debug, Clone)]
struct Protection {
    opts: DeadLetterOptions,
    /// Declared elsewhere; only its pairing was declared here.
    adopted: bool,
}

impl DeadLetterService {
    /// Creates a service with no protected queue.
    pub fn new(ops: Arc<QueueOperations>) -> DeadLetterService {
        DeadLetterService {
            ops,
            protected: Mutex::new(HashMap::new()),
        }
    }

    /// Declares the dead-letter pairing of `queue` and the queue itself.
    ///
    /// The queue must not already exist with other arguments, or the broker
    /// answers with a topology conflict.
    ///
    /// # Parameters
    /// * `queue` - Name of the protected queue
    /// * `opts` - Retry and TTL settings remembered for later consumers
    pub async fn setup(&self, queue: &str, opts: DeadLetterOptions) -> Result<(), AmqpError> {
        self.declare_pairing(queue, &opts).await?;

        let dlx = dead_letter_exchange_name(queue);
        let mut def = QueueDefinition::new(queue).durable().dead_letter(&dlx, queue);
        if let Some(ttl) = opts.message_ttl {
            def = def.ttl(ttl);
        }
        self.ops.declare_queue(&def).await?;

        debug!(queue, dlx, "dead letter topology declared");
        self.protected
            .lock()
            .insert(queue.to_owned(), Protection { opts, adopted: false });

        Ok(())
    }

    /// Options registered for `queue` by [`setup`](Self::setup), or the
    /// defaults.
    pub fn options(&self, queue: &str) -> DeadLetterOptions {
        self.protected
            .lock()
            .get(queue)
            .map(|protection| protection.opts.clone())
            .unwrap_or_default()
    }

    /// Declares everything around `queue` but the queue itself. None of it
    /// touches the arguments of an existing protected queue.
    async fn declare_pairing(&self, queue: &str, opts: &DeadLetterOptions) -> Result<(), AmqpError> {
        let dlx = dead_letter_exchange_name(queue);
        let dlq = dead_letter_queue_name(queue);

        self.ops
            .declare_exchange(&ExchangeDefinition::new(&dlx).direct().durable())
            .await?;
        self.ops
            .declare_queue(&QueueDefinition::new(&dlq).durable())
            .await?;
        self.ops.bind(&dlq, &dlx, queue).await?;

        if opts.delayed_retry {
            self.ops
                .declare_queue(
                    &QueueDefinition::new(&retry_queue_name(queue))
                        .durable()
                        .dead_letter("", queue),
                )
                .await?;
        }

        Ok(())
    }

    /// Builds the retrier of `queue`.
    ///
    /// A queue set up by another process, or before a restart, is unknown
    /// here; its retry path is declared with the default options before the
    /// first message can be retried into it, and its dead letters are
    /// published to the pairing explicitly.
    async fn retrier(&self, queue: &str, max_retries: u32) -> Result<Arc<Retrier>, AmqpError> {
        let registered = self.protected.lock().get(queue).cloned();

        let protection = match registered {
            Some(protection) => protection,
            None => {
                let protection = Protection {
                    opts: DeadLetterOptions::default(),
                    adopted: true,
                };
                warn!(queue, "queue not set up by this service, declaring its retry path");
                self.declare_pairing(queue, &protection.opts).await?;
                self.protected.lock().insert(queue.to_owned(), protection.clone());
                protection
            }
        };

        Ok(Arc::new(Retrier {
            ops: self.ops.clone(),
            queue: queue.to_owned(),
            policy: protection.opts.policy(max_retries),
            delayed_retry: protection.opts.delayed_retry,
            republish_dead_letters: protection.adopted,
        }))
    }

    /// Consumes `queue`, retrying failed messages up to `max_retries` times
    /// before dead-lettering them.
    pub async fn consume_with_retry(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        max_retries: u32,
    ) -> Result<ConsumerHandle, AmqpError> {
        let wrapped = RetryingHandler {
            inner: handler,
            retrier: self.retrier(queue, max_retries).await?,
        };

        self.ops
            .consume_manual(queue, Arc::new(wrapped), ConsumeOptions::default())
            .await
    }

    /// Consumes `queue` handing each message a [`RetryAckHandle`].
    pub async fn consume_manual_with_retry(
        &self,
        queue: &str,
        handler: Arc<dyn RetryConsumerHandler>,
        max_retries: u32,
        opts: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        let wrapped = ManualRetryingHandler {
            inner: handler,
            retrier: self.retrier(queue, max_retries).await?,
        };

        self.ops.consume_manual(queue, Arc::new(wrapped), opts).await
    }

    /// Consumes the dead-letter queue of `queue`. Failures are logged and the
    /// message dropped.
    pub async fn consume_dead_letter(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<ConsumerHandle, AmqpError> {
        self.ops
            .consume(
                &dead_letter_queue_name(queue),
                handler,
                ConsumeOptions::default().on_failure(FailureAction::Discard),
            )
            .await
    }
}
