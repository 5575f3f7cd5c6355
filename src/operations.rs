// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Core Queue Operations
//!
//! [`QueueOperations`] is the minimal set of broker primitives every pattern
//! is built from: declarations and bindings, publishing of enveloped
//! payloads, consumption in automatic or manual acknowledgment mode and the
//! administrative queue operations.
//!
//! Every consumer runs in its own task. The task survives reconnections: when
//! its delivery stream ends it waits for the connection manager to report a
//! new channel and subscribes again with the same settings. Consumers of
//! ephemeral queues end instead, since their queue died with the connection.
//!
//! Queue inspection and the administrative operations run on a scoped
//! channel. A lookup of a missing entity then closes that channel only,
//! leaving the operational channel and its consumers alone.

use crate::{
    broker::{
        Broker, ConsumerSettings, DeliveryStream, HeaderTable, HeaderValue, MessageProperties, QueueInfo,
        PERSISTENT_DELIVERY_MODE, TRANSIENT_DELIVERY_MODE,
    },
    channel::JSON_CONTENT_TYPE,
    connection::ConnectionManager,
    consumer::{self, ConsumerHandler, Dispatch, FailureAction, ManualConsumerHandler},
    envelope::{EnvelopeHeaders, EnvelopeOptions, MessageEnvelope},
    exchange::{ExchangeDefinition, AMQP_HEADERS_DELAY},
    errors::AmqpError,
    otel,
    queue::{QueueBinding, QueueDefinition},
};
use futures_util::StreamExt;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Per-publish options.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    /// Message priority, honored by queues declared with `x-max-priority`.
    pub priority: Option<u8>,
    /// Delay in milliseconds, recorded on the envelope and in the `x-delay`
    /// header read by delayed exchanges.
    pub delay: Option<u64>,
    /// Per-message TTL in milliseconds.
    pub expiration: Option<u64>,
    /// Headers copied onto both the envelope and the message properties.
    pub headers: Option<EnvelopeHeaders>,
    /// Delivery mode 2 when set, which is the default.
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            priority: None,
            delay: None,
            expiration: None,
            headers: None,
            persistent: true,
        }
    }
}

impl PublishOptions {
    /// Sets the message priority.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the delay in milliseconds.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delay(mut self, delay_ms: u64) -> Self {
        self.delay = Some(delay_ms);
        self
    }

    /// Sets the per-message TTL in milliseconds.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn expiration(mut self, ttl_ms: u64) -> Self {
        self.expiration = Some(ttl_ms);
        self
    }

    pub fn headers(mut self, headers: EnvelopeHeaders) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Publishes with delivery mode 1; the message does not survive a broker
    /// restart.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    fn envelope_options(&self) -> EnvelopeOptions {
        EnvelopeOptions {
            delay: self.delay,
            priority: self.priority,
            headers: self.headers.clone(),
        }
    }
}

/// Per-consumer options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Unacknowledged deliveries this consumer may hold; `None` keeps the
    /// channel ceiling.
    pub prefetch: Option<u16>,
    /// The broker considers deliveries settled as soon as it sends them.
    pub no_ack: bool,
    /// No other consumer may subscribe to the queue meanwhile.
    pub exclusive: bool,
    /// Consumer tag; a unique one is generated when unset.
    pub tag: Option<String>,
    /// Settlement of failed deliveries in automatic mode.
    pub on_failure: FailureAction,
    /// The queue lives only as long as the connection that declared it; the
    /// consumer ends on reconnection instead of re-subscribing.
    pub ephemeral: bool,
}

impl ConsumeOptions {
    /// Sets the per-consumer prefetch.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Uses `tag` instead of a generated one. Work queues use it as the worker
    /// tag prefix.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_owned());
        self
    }

    /// Sets how failed deliveries are settled.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_failure(mut self, action: FailureAction) -> Self {
        self.on_failure = action;
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }
}

/// Running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    tag: String,
    queue: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Consumer tag registered with the broker.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the consumer task ended, either stopped or because its queue is gone.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the consumer and waits for the in-flight delivery, if any.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            error!(error = err.to_string(), tag = self.tag, "consumer task failed");
        }
    }
}

/// Low-level broker operations shared by every pattern service.
///
/// Consumers run as tracked tasks that follow reconnections until they are
/// stopped or [`shutdown`](QueueOperations::shutdown) is called.
pub struct QueueOperations {
    manager: Arc<ConnectionManager>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    tags: AtomicU64,
}

impl QueueOperations {
    /// Creates the operations on top of `manager`.
    ///
    /// # Returns
    /// The operations, shared behind an [`Arc`]
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<QueueOperations> {
        Arc::new(QueueOperations {
            manager,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            tags: AtomicU64::new(0),
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Generates a consumer tag unique for the lifetime of this instance.
    ///
    /// RabbitMQ refuses a tag already in use on the channel with a
    /// connection-level error, so every subscription takes a fresh one.
    ///
    /// # Parameters
    /// * `prefix` - Leading part of the tag, usually derived from the queue
    ///
    /// # Returns
    /// The tag `<prefix>.<sequence>`
    pub fn consumer_tag(&self, prefix: &str) -> String {
        format!("{}.{}", prefix, self.tags.fetch_add(1, Ordering::Relaxed))
    }

    async fn scoped_channel(&self) -> Result<Arc<dyn Broker>, AmqpError> {
        self.manager.channel()?.open_channel().await
    }

    /// Declares an exchange on the operational channel.
    ///
    /// # Parameters
    /// * `def` - Name, type and flags of the exchange
    ///
    /// # Errors
    /// [`AmqpError::NotReady`] when disconnected, or the broker refusal
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!(exchange = def.name(), kind = def.exchange_kind().as_str(), "declaring exchange");
        self.manager.channel()?.declare_exchange(def).await
    }

    /// Declares a queue on the operational channel.
    ///
    /// # Parameters
    /// * `def` - Name, flags and arguments; an empty name lets the broker pick one
    ///
    /// # Returns
    /// The counters of the queue, carrying the generated name when asked for one
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        debug!(queue = def.name(), "declaring queue");
        self.manager.channel()?.declare_queue(def).await
    }

    /// Binds `queue` to `exchange`.
    ///
    /// # Parameters
    /// * `queue` - Queue to bind
    /// * `exchange` - Source exchange
    /// * `routing_key` - Key or pattern; ignored by fanout exchanges
    pub async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        debug!(queue, exchange, routing_key, "binding queue");

        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key);

        self.manager.channel()?.bind_queue(&binding).await
    }

    /// Removes the binding created by [`bind`](QueueOperations::bind) with the same arguments.
    pub async fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        debug!(queue, exchange, routing_key, "unbinding queue");
        self.manager.unbind(queue, exchange, routing_key).await
    }

    /// Wraps `payload` into a fresh envelope and publishes it.
    ///
    /// Returns whether the broker client accepted the frame, which is not a
    /// delivery confirmation.
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        opts: &PublishOptions,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let envelope = MessageEnvelope::new(payload, opts.envelope_options())?;
        self.publish_envelope(exchange, routing_key, &envelope, opts).await
    }

    /// Publishes through the default exchange straight into `queue`.
    pub async fn send_to_queue<T>(&self, queue: &str, payload: &T, opts: &PublishOptions) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish("", queue, payload, opts).await
    }

    /// Publishes an already built envelope.
    ///
    /// Envelope headers become message headers. Priority and persistence come
    /// from `opts`, falling back to the envelope priority.
    pub async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
        opts: &PublishOptions,
    ) -> Result<bool, AmqpError> {
        let body = envelope.encode()?;

        let mut headers: HeaderTable = envelope
            .headers
            .iter()
            .flatten()
            .map(|(key, value)| (key.clone(), HeaderValue::from_json(value)))
            .collect();

        if let Some(delay) = envelope.delay {
            headers.insert(AMQP_HEADERS_DELAY.to_owned(), HeaderValue::Int(delay as i64));
        }

        otel::inject_context(&mut headers);

        let properties = MessageProperties {
            message_id: Some(envelope.id.clone()),
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            timestamp: Some((envelope.timestamp / 1000) as u64),
            priority: opts.priority.or(envelope.priority),
            delivery_mode: Some(if opts.persistent {
                PERSISTENT_DELIVERY_MODE
            } else {
                TRANSIENT_DELIVERY_MODE
            }),
            expiration: opts.expiration,
            headers,
        };

        let accepted = self
            .manager
            .channel()?
            .publish(exchange, routing_key, body, properties)
            .await
            .inspect_err(|err| {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message")
            })?;

        debug!(exchange, routing_key, id = envelope.id.as_str(), accepted, "message published");

        Ok(accepted)
    }

    /// Starts an automatic acknowledgment consumer.
    ///
    /// The subscription is registered before returning, so a missing queue
    /// fails here instead of inside the task.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        opts: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        let dispatch = Dispatch::Auto {
            handler,
            on_failure: opts.on_failure,
        };
        self.spawn_consumer(queue, dispatch, opts).await
    }

    /// Starts a manual acknowledgment consumer.
    pub async fn consume_manual(
        &self,
        queue: &str,
        handler: Arc<dyn ManualConsumerHandler>,
        opts: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        if opts.no_ack {
            return Err(AmqpError::ValidationError(
                "manual acknowledgment is incompatible with no_ack".to_owned(),
            ));
        }

        self.spawn_consumer(queue, Dispatch::Manual { handler }, opts).await
    }

    async fn spawn_consumer(
        &self,
        queue: &str,
        dispatch: Dispatch,
        opts: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        if self.shutdown.is_cancelled() {
            return Err(AmqpError::ShuttingDown);
        }

        let tag = opts
            .tag
            .clone()
            .unwrap_or_else(|| self.consumer_tag(&format!("{queue}.consumer")));

        let settings = ConsumerSettings {
            tag: tag.clone(),
            prefetch: opts.prefetch,
            no_ack: opts.no_ack,
            exclusive: opts.exclusive,
        };

        let broker = self.manager.channel()?;
        inspect_queue(broker.as_ref(), queue).await?;

        let stream = broker
            .consume(queue, &settings)
            .await
            .inspect_err(|err| error!(error = err.to_string(), queue, "error to create the consumer"))?;

        info!(queue, tag = tag.as_str(), "consumer started");

        let token = self.shutdown.child_token();
        let task = self.tracker.spawn(run_consumer(
            self.manager.clone(),
            queue.to_owned(),
            settings,
            dispatch,
            stream,
            opts.ephemeral,
            token.clone(),
        ));

        Ok(ConsumerHandle {
            tag,
            queue: queue.to_owned(),
            token,
            task,
        })
    }

    /// Inspects a queue without declaring it.
    ///
    /// # Parameters
    /// * `queue` - Name of the queue to look up
    ///
    /// # Returns
    /// The message and consumer counters, or [`AmqpError::QueueNotFound`]
    pub async fn queue_info(&self, queue: &str) -> Result<QueueInfo, AmqpError> {
        inspect_queue(self.manager.channel()?.as_ref(), queue).await
    }

    /// Removes every ready message from `queue`.
    ///
    /// # Returns
    /// The number of purged messages
    pub async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        let scoped = self.scoped_channel().await?;
        let purged = scoped.purge_queue(queue).await;
        release(scoped).await;

        let purged = purged?;
        info!(queue, purged, "queue purged");
        Ok(purged)
    }

    /// Deletes `queue` along with its messages.
    ///
    /// # Returns
    /// The number of messages deleted with the queue
    pub async fn delete_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        let scoped = self.scoped_channel().await?;
        let deleted = scoped.delete_queue(queue).await;
        release(scoped).await;

        let deleted = deleted?;
        info!(queue, deleted, "queue deleted");
        Ok(deleted)
    }

    /// Deletes `exchange` on a scoped channel, so a missing exchange does not
    /// affect running consumers.
    pub async fn delete_exchange(&self, exchange: &str) -> Result<(), AmqpError> {
        let scoped = self.scoped_channel().await?;
        let deleted = scoped.delete_exchange(exchange, false).await;
        release(scoped).await;

        deleted?;
        info!(exchange, "exchange deleted");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops accepting consumers, cancels the running ones, waits up to
    /// `grace` for in-flight handlers and disconnects.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), AmqpError> {
        info!("shutting down queue operations");

        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                pending = self.tracker.len(),
                "grace period elapsed with handlers still running"
            );
        }

        self.manager.disconnect().await
    }
}

/// Passive declaration on a scoped channel of `broker`.
async fn inspect_queue(broker: &dyn Broker, queue: &str) -> Result<QueueInfo, AmqpError> {
    let scoped = broker.open_channel().await?;
    let info = scoped
        .declare_queue(&QueueDefinition::new(queue).passive())
        .await;
    release(scoped).await;

    info
}

async fn release(scoped: Arc<dyn Broker>) {
    if let Err(err) = scoped.close().await {
        debug!(error = err.to_string(), "failure to close scoped channel");
    }
}

async fn run_consumer(
    manager: Arc<ConnectionManager>,
    queue: String,
    settings: ConsumerSettings,
    dispatch: Dispatch,
    mut stream: DeliveryStream,
    ephemeral: bool,
    token: CancellationToken,
) {
    loop {
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    if let Ok(broker) = manager.channel() {
                        if let Err(err) = broker.cancel(&settings.tag).await {
                            debug!(error = err.to_string(), tag = settings.tag, "failure to cancel consumer");
                        }
                    }
                    info!(queue, tag = settings.tag, "consumer stopped");
                    return;
                }

                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(err) = consumer::consume(&queue, delivery, &dispatch).await {
                            error!(error = err.to_string(), queue, "error consume msg");
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), queue, "errors consume msg");
                        break;
                    }
                    None => break,
                },
            }
        }

        if ephemeral {
            info!(queue, tag = settings.tag, "delivery stream ended, ephemeral consumer stopped");
            return;
        }

        warn!(queue, tag = settings.tag, "delivery stream ended, re-subscribing");

        stream = loop {
            let broker = tokio::select! {
                _ = token.cancelled() => return,
                broker = manager.wait_channel() => broker,
            };

            let subscribed = match inspect_queue(broker.as_ref(), &queue).await {
                Ok(_) => broker.consume(&queue, &settings).await,
                Err(AmqpError::QueueNotFound(_)) => {
                    error!(queue, tag = settings.tag, "queue no longer exists, consumer stopped");
                    return;
                }
                Err(err) => Err(err),
            };

            match subscribed {
                Ok(stream) => {
                    info!(queue, tag = settings.tag, "consumer re-subscribed");
                    break stream;
                }
                Err(err) => {
                    warn!(error = err.to_string(), queue, "failure to re-subscribe");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    }
                }
            }
        };
    }
}
