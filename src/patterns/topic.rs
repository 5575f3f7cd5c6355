// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Routing by dotted keys against wildcard binding patterns: `*` matches
//! exactly one word and `#` matches zero or more words. A queue may be bound
//! with several patterns; it still receives a single copy of a message that
//! matches more than one of them.

use super::{PatternKind, QueuePattern, SendOptions};
use crate::{
    broker::QueueInfo,
    consumer::ConsumerHandler,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    operations::{ConsumeOptions, ConsumerHandle, PublishOptions, QueueOperations},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Whether `routing_key` matches the binding `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();

    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some((&"#", rest)), _) => {
            matches_words(rest, key) || (!key.is_empty() && matches_words(pattern, &key[1..]))
        }
        (Some(_), None) => false,
        (Some((&"*", rest)), Some((_, key_rest))) => matches_words(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => word == key_word && matches_words(rest, key_rest),
    }
}

fn validate_routing_key(routing_key: &str) -> Result<(), AmqpError> {
    if routing_key.split('.').any(|word| word == "*" || word == "#") {
        return Err(AmqpError::ValidationError(format!(
            "routing key {routing_key} must not contain wildcards"
        )));
    }

    Ok(())
}

fn validate_pattern(pattern: &str) -> Result<(), AmqpError> {
    if pattern.is_empty() {
        return Err(AmqpError::ValidationError("binding pattern is empty".to_owned()));
    }

    Ok(())
}

/// Publish/subscribe over a topic exchange with wildcard bindings.
pub struct TopicQueue {
    ops: Arc<QueueOperations>,
}

impl TopicQueue {
    pub fn new(ops: Arc<QueueOperations>) -> TopicQueue {
        TopicQueue { ops }
    }

    /// Exchange name for `name`, as `topic.exchange.<name>`.
    pub fn exchange_name(name: &str) -> String {
        PatternKind::Topic.exchange_name(name)
    }

    /// Queue name for `name`, as `topic.queue.<name>`.
    pub fn queue_name(name: &str) -> String {
        PatternKind::Topic.queue_name(name)
    }

    /// Declares the durable topic exchange `topic.exchange.<exchange>`.
    ///
    /// # Parameters
    /// * `exchange` - Logical exchange name
    ///
    /// # Errors
    /// [`AmqpError::TopologyConflict`] when the exchange exists with another type
    pub async fn setup(&self, exchange: &str) -> Result<(), AmqpError> {
        self.ops
            .declare_exchange(&ExchangeDefinition::new(&Self::exchange_name(exchange)).topic().durable())
            .await
    }

    /// Declares `topic.queue.<queue>` and binds it with `pattern`. Binding the
    /// same queue again with another pattern adds to its subscriptions.
    pub async fn bind(&self, exchange: &str, queue: &str, pattern: &str) -> Result<QueueInfo, AmqpError> {
        validate_pattern(pattern)?;

        let queue_name = Self::queue_name(queue);
        let info = self
            .ops
            .declare_queue(&QueueDefinition::new(&queue_name).durable())
            .await?;

        self.ops
            .bind(&queue_name, &Self::exchange_name(exchange), pattern)
            .await?;

        Ok(info)
    }

    /// Binds `queue` once per pattern, stopping at the first failure.
    ///
    /// # Parameters
    /// * `exchange` - Logical exchange name
    /// * `queue` - Logical queue name
    /// * `patterns` - Binding patterns, each validated like [`bind`](TopicQueue::bind)
    pub async fn bind_patterns(&self, exchange: &str, queue: &str, patterns: &[&str]) -> Result<(), AmqpError> {
        for pattern in patterns {
            self.bind(exchange, queue, pattern).await?;
        }

        Ok(())
    }

    /// Removes one binding pattern from `queue`. Other patterns stay in place.
    ///
    /// # Parameters
    /// * `exchange` - Logical exchange name
    /// * `queue` - Logical queue name
    /// * `pattern` - The pattern used when binding
    pub async fn unbind(&self, exchange: &str, queue: &str, pattern: &str) -> Result<(), AmqpError> {
        self.ops
            .unbind(&Self::queue_name(queue), &Self::exchange_name(exchange), pattern)
            .await
    }

    /// Publishes `payload` with a concrete routing key.
    ///
    /// # Parameters
    /// * `exchange` - Logical exchange name
    /// * `routing_key` - Dotted key; wildcards are rejected
    /// * `payload` - Message body, serialized as JSON
    /// * `opts` - Publish properties
    ///
    /// # Returns
    /// Whether the broker confirmed the message
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
        validate_routing_key(routing_key)?;

        self.ops
            .publish(&Self::exchange_name(exchange), routing_key, payload, opts)
            .await
    }

    /// Starts a consumer on `topic.queue.<queue>`.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        opts: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        self.ops.consume(&Self::queue_name(queue), handler, opts).await
    }
}

#[async_trait]
impl QueuePattern for TopicQueue {
    fn kind(&self) -> PatternKind {
        PatternKind::Topic
    }

    async fn setup(&self, name: &str) -> Result<(), AmqpError> {
        TopicQueue::setup(self, name).await
    }

    async fn send(&self, name: &str, payload: &Value, opts: &SendOptions) -> Result<bool, AmqpError> {
        let Some(routing_key) = &opts.routing_key else {
            return Err(AmqpError::ValidationError(
                "topic messages need a routing key".to_owned(),
            ));
        };

        let publish = PublishOptions {
            headers: opts.headers.clone(),
            ..Default::default()
        };

        self.publish(name, routing_key, payload, &publish).await
    }

    async fn consume(&self, name: &str, handler: Arc<dyn ConsumerHandler>) -> Result<ConsumerHandle, AmqpError> {
        TopicQueue::consume(self, name, handler, ConsumeOptions::default()).await
    }
}
