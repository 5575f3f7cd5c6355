// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Delivery
//!
//! Two strategies deliver a message to `delay.queue.<name>` once its delay
//! elapsed:
//!
//! - [`DelayStrategy::Plugin`] publishes to an `x-delayed-message` exchange
//!   with the delay in the `x-delay` header.
//! - [`DelayStrategy::TtlFallback`] parks the message in a holding queue
//!   `delay.hold.<name>.<ms>` whose message TTL is the delay and whose
//!   dead-letter target is the real exchange. One holding queue exists per
//!   distinct delay so that a long delay never holds back a shorter one.
//!
//! Unless a strategy is forced, plugin support is checked once on a detached
//! session: declaring an unknown exchange type closes the whole connection,
//! which must not be the shared one.

use super::{PatternKind, QueuePattern, SendOptions};
use crate::{
    consumer::ConsumerHandler,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    operations::{ConsumeOptions, ConsumerHandle, PublishOptions, QueueOperations},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tracing::{debug, info, warn};

const PLUGIN_CHECK_EXCHANGE: &str = "delay.exchange.plugin-check";

/// How delayed messages are held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DelayStrategy {
    /// Broker-side `x-delayed-message` exchange.
    Plugin,
    /// Per-delay holding queues with a message TTL and dead-lettering.
    TtlFallback,
}

/// Delayed and scheduled delivery to `delay.queue.<name>`.
pub struct DelayQueue {
    ops: Arc<QueueOperations>,
    strategy: Mutex<Option<DelayStrategy>>,
    holding: Mutex<HashSet<String>>,
}

impl DelayQueue {
    /// Detects the strategy on first use.
    pub fn new(ops: Arc<QueueOperations>) -> DelayQueue {
        DelayQueue {
            ops,
            strategy: Mutex::new(None),
            holding: Mutex::new(HashSet::new()),
        }
    }

    /// Uses `strategy` without asking the broker.
    ///
    /// # Parameters
    /// * `ops` - Shared queue operations
    /// * `strategy` - Strategy to use for every send
    pub fn with_strategy(ops: Arc<QueueOperations>, strategy: DelayStrategy) -> DelayQueue {
        DelayQueue {
            ops,
            strategy: Mutex::new(Some(strategy)),
            holding: Mutex::new(HashSet::new()),
        }
    }

    pub fn queue_name(name: &str) -> String {
        PatternKind::Delay.queue_name(name)
    }

    /// Destination exchange, as `delay.exchange.<name>`.
    pub fn exchange_name(name: &str) -> String {
        PatternKind::Delay.exchange_name(name)
    }

    /// Holding queue used by the TTL fallback for one delay value.
    ///
    /// # Returns
    /// `delay.hold.<name>.<delay_ms>`
    pub fn holding_queue_name(name: &str, delay_ms: u64) -> String {
        format!("delay.hold.{name}.{delay_ms}")
    }

    /// Strategy in use, if already known.
    pub fn strategy(&self) -> Option<DelayStrategy> {
        *self.strategy.lock()
    }

    /// Returns the strategy, asking the broker the first time.
    pub async fn detect_strategy(&self) -> DelayStrategy {
        if let Some(strategy) = self.strategy() {
            return strategy;
        }

        let detected = self.check_plugin().await;
        info!(strategy = ?detected, "delay strategy selected");

        *self.strategy.lock().get_or_insert(detected)
    }

    async fn check_plugin(&self) -> DelayStrategy {
        let session = match self.ops.manager().open_detached().await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = err.to_string(), "failure to open plugin check session");
                return DelayStrategy::TtlFallback;
            }
        };

        let exchange = ExchangeDefinition::new(PLUGIN_CHECK_EXCHANGE)
            .delayed(ExchangeKind::Direct)
            .auto_delete();

        let strategy = match session.declare_exchange(&exchange).await {
            Ok(_) => {
                if let Err(err) = session.delete_exchange(PLUGIN_CHECK_EXCHANGE, false).await {
                    debug!(error = err.to_string(), "failure to delete plugin check exchange");
                }
                DelayStrategy::Plugin
            }
            Err(err) => {
                warn!(error = err.to_string(), "delayed exchange unavailable, using ttl fallback");
                DelayStrategy::TtlFallback
            }
        };

        if let Err(err) = session.close().await {
            debug!(error = err.to_string(), "failure to close plugin check session");
        }

        strategy
    }

    /// Declares the destination exchange, queue and binding.
    ///
    /// # Parameters
    /// * `name` - Logical queue name, also used as the routing key
    ///
    /// # Returns
    /// The strategy the exchange was declared for
    pub async fn setup(&self, name: &str) -> Result<DelayStrategy, AmqpError> {
        let strategy = self.detect_strategy().await;
        let exchange_name = Self::exchange_name(name);
        let queue_name = Self::queue_name(name);

        let exchange = match strategy {
            DelayStrategy::Plugin => ExchangeDefinition::new(&exchange_name).delayed(ExchangeKind::Direct),
            DelayStrategy::TtlFallback => ExchangeDefinition::new(&exchange_name).direct(),
        };

        self.ops.declare_exchange(&exchange.durable()).await?;
        self.ops
            .declare_queue(&QueueDefinition::new(&queue_name).durable())
            .await?;
        self.ops.bind(&queue_name, &exchange_name, name).await?;

        Ok(strategy)
    }

    /// Publishes `payload` for delivery after `delay`.
    ///
    /// # Parameters
    /// * `name` - Logical queue name
    /// * `payload` - Message body, serialized as JSON
    /// * `delay` - Time to hold the message back; zero delivers at once
    /// * `opts` - Publish properties
    ///
    /// # Returns
    /// Whether the broker confirmed the message
    pub async fn send<T>(&self, name: &str, payload: &T, delay: Duration, opts: &PublishOptions) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let delay_ms = u64::try_from(delay.as_millis())
            .map_err(|_| AmqpError::ValidationError("delay out of range".to_owned()))?;

        let opts = PublishOptions {
            delay: Some(delay_ms),
            ..opts.clone()
        };

        match self.detect_strategy().await {
            DelayStrategy::Plugin => {
                self.ops
                    .publish(&Self::exchange_name(name), name, payload, &opts)
                    .await
            }
            DelayStrategy::TtlFallback if delay_ms == 0 => {
                self.ops
                    .publish(&Self::exchange_name(name), name, payload, &opts)
                    .await
            }
            DelayStrategy::TtlFallback => {
                let holding = self.holding_queue(name, delay_ms).await?;
                self.ops.send_to_queue(&holding, payload, &opts).await
            }
        }
    }

    /// Publishes `payload` for delivery at `at`, which must not be in the
    /// past.
    pub async fn schedule_at<T>(&self, name: &str, payload: &T, at: SystemTime, opts: &PublishOptions) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let delay = at
            .duration_since(SystemTime::now())
            .map_err(|_| AmqpError::ValidationError("scheduled time is in the past".to_owned()))?;

        self.send(name, payload, delay, opts).await
    }

    /// Starts a consumer on `delay.queue.<name>`. Messages arrive once their
    /// delay has elapsed.
    pub async fn consume(
        &self,
        name: &str,
        handler: Arc<dyn ConsumerHandler>,
        opts: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        self.ops.consume(&Self::queue_name(name), handler, opts).await
    }

    /// Withdrawing an in-flight delayed message has no broker primitive.
    pub async fn cancel_delay_message(&self, message_id: &str) -> Result<(), AmqpError> {
        Err(AmqpError::Unsupported(format!(
            "cannot cancel delayed message {message_id}"
        )))
    }

    async fn holding_queue(&self, name: &str, delay_ms: u64) -> Result<String, AmqpError> {
        let queue = Self::holding_queue_name(name, delay_ms);

        if self.holding.lock().contains(&queue) {
            return Ok(queue);
        }

        let ttl = u32::try_from(delay_ms)
            .map_err(|_| AmqpError::ValidationError(format!("delay {delay_ms}ms exceeds queue ttl range")))?;

        let def = QueueDefinition::new(&queue)
            .durable()
            .ttl(ttl)
            .dead_letter(&Self::exchange_name(name), name);

        self.ops.declare_queue(&def).await?;
        debug!(queue, ttl, "holding queue declared");

        self.holding.lock().insert(queue.clone());
        Ok(queue)
    }
}

#[async_trait]
impl QueuePattern for DelayQueue {
    fn kind(&self) -> PatternKind {
        PatternKind::Delay
    }

    async fn setup(&self, name: &str) -> Result<(), AmqpError> {
        DelayQueue::setup(self, name).await.map(|_| ())
    }

    async fn send(&self, name: &str, payload: &Value, opts: &SendOptions) -> Result<bool, AmqpError> {
        let delay = Duration::from_millis(opts.delay_ms.unwrap_or_default());
        let publish = PublishOptions {
            headers: opts.headers.clone(),
            ..Default::default()
        };

        DelayQueue::send(self, name, payload, delay, &publish).await
    }

    async fn consume(&self, name: &str, handler: Arc<dyn ConsumerHandler>) -> Result<ConsumerHandle, AmqpError> {
        DelayQueue::consume(self, name, handler, ConsumeOptions::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Broker, HeaderValue, MockBroker, MockConnector, QueueInfo},
        connection::{ConnectionManager, ConnectionSettings},
        exchange::AMQP_HEADERS_DELAY,
        queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_MESSAGE_TTL},
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn ops_with(broker: MockBroker, detached: Option<MockBroker>) -> Arc<QueueOperations> {
        let mut connector = MockConnector::new();
        let mut seq = mockall::Sequence::new();

        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(move |_, _| Ok(Arc::new(broker) as Arc<dyn Broker>));

        if let Some(detached) = detached {
            connector
                .expect_connect()
                .times(1)
                .in_sequence(&mut seq)
                .return_once(move |_, _| Ok(Arc::new(detached) as Arc<dyn Broker>));
        }

        let manager = ConnectionManager::new(Arc::new(connector), ConnectionSettings::default());
        manager.connect().await.unwrap();

        QueueOperations::new(manager)
    }

    #[tokio::test]
    async fn plugin_selected_when_delayed_declare_succeeds() {
        let mut detached = MockBroker::new();
        detached
            .expect_declare_exchange()
            .withf(|def| *def.exchange_kind() == ExchangeKind::XMessageDelayed)
            .returning(|_| Ok(()));
        detached.expect_delete_exchange().returning(|_, _| Ok(()));
        detached.expect_close().times(1).returning(|| Ok(()));

        let delay = DelayQueue::new(ops_with(MockBroker::new(), Some(detached)).await);

        assert_eq!(delay.detect_strategy().await, DelayStrategy::Plugin);
        assert_eq!(delay.strategy(), Some(DelayStrategy::Plugin));
    }

    #[tokio::test]
    async fn falls_back_to_ttl_when_plugin_missing() {
        let mut detached = MockBroker::new();
        detached
            .expect_declare_exchange()
            .returning(|_| Err(AmqpError::ConnectionError("COMMAND_INVALID".into())));
        detached.expect_close().returning(|| Ok(()));

        let delay = DelayQueue::new(ops_with(MockBroker::new(), Some(detached)).await);

        assert_eq!(delay.detect_strategy().await, DelayStrategy::TtlFallback);
        assert_eq!(delay.detect_strategy().await, DelayStrategy::TtlFallback);
    }

    #[tokio::test]
    async fn plugin_send_uses_delay_header() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .withf(|exchange, key, _, props| {
                exchange == "delay.exchange.jobs"
                    && key == "jobs"
                    && props.headers.get(AMQP_HEADERS_DELAY) == Some(&HeaderValue::Int(2_000))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(true));

        let delay = DelayQueue::with_strategy(ops_with(broker, None).await, DelayStrategy::Plugin);

        delay
            .send("jobs", &json!({}), Duration::from_secs(2), &PublishOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fallback_send_parks_in_holding_queue_once() {
        let mut broker = MockBroker::new();
        broker
            .expect_declare_queue()
            .withf(|def| {
                let args = def.arguments();
                def.name() == "delay.hold.jobs.1500"
                    && args.get(AMQP_HEADERS_MESSAGE_TTL) == Some(&HeaderValue::Int(1_500))
                    && args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
                        == Some(&HeaderValue::from("delay.exchange.jobs"))
            })
            .times(1)
            .returning(|_| Ok(QueueInfo::default()));
        broker
            .expect_publish()
            .withf(|exchange, key, _, _| exchange.is_empty() && key == "delay.hold.jobs.1500")
            .times(2)
            .returning(|_, _, _, _| Ok(true));

        let delay = DelayQueue::with_strategy(ops_with(broker, None).await, DelayStrategy::TtlFallback);

        for _ in 0..2 {
            delay
                .send("jobs", &json!({}), Duration::from_millis(1_500), &PublishOptions::default())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn schedule_in_the_past_is_rejected() {
        let delay = DelayQueue::with_strategy(ops_with(MockBroker::new(), None).await, DelayStrategy::Plugin);
        let past = SystemTime::now() - Duration::from_secs(60);

        assert!(matches!(
            delay
                .schedule_at("jobs", &json!({}), past, &PublishOptions::default())
                .await,
            Err(AmqpError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_is_unsupported() {
        let delay = DelayQueue::with_strategy(ops_with(MockBroker::new(), None).await, DelayStrategy::Plugin);

        assert!(matches!(
            delay.cancel_delay_message("abc").await,
            Err(AmqpError::Unsupported(_))
        ));
    }
}
