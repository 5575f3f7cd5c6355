// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Broadcast through fanout exchanges: every bound queue gets its own copy of
//! each message. Transient listeners subscribe through a server-named,
//! exclusive, auto-delete queue that disappears with their connection.

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
use tracing::info;

/// Broadcast through a fanout exchange.
pub struct FanoutQueue {
    ops: Arc<QueueOperations>,
}

impl FanoutQueue {
    pub fn new(ops: Arc<QueueOperations>) -> FanoutQueue {
        FanoutQueue { ops }
    }

    /// Exchange name for `name`, as `fanout.exchange.<name>`.
    pub fn exchange_name(name: &str) -> String {
        PatternKind::Fanout.exchange_name(name)
    }

    pub fn queue_name(name: &str) -> String {
        PatternKind::Fanout.queue_name(name)
    }

    /// Declares the durable fanout exchange `fanout.exchange.<exchange>`.
    ///
    /// # Parameters
    /// * `exchange` - Logical exchange name
    ///
    /// # Errors
    /// [`AmqpError::TopologyConflict`] when the exchange exists with another type
    pub async fn setup(&self, exchange: &str) -> Result<(), AmqpError> {
        self.ops
            .declare_exchange(&ExchangeDefinition::new(&Self::exchange_name(exchange)).fanout().durable())
            .await
    }

    /// Declares the durable queue `fanout.queue.<queue>` and binds it.
    pub async fn bind(&self, exchange: &str, queue: &str) -> Result<QueueInfo, AmqpError> {
        let queue_name = Self::queue_name(queue);

        let info = self
            .ops
            .declare_queue(&QueueDefinition::new(&queue_name).durable())
            .await?;
        self.ops
            .bind(&queue_name, &Self::exchange_name(exchange), "")
            .await?;

        Ok(info)
    }

    /// Publishes `payload` to every queue bound to the exchange. The routing key
    /// is always empty.
    ///
    /// # Parameters
    /// * `exchange` - Logical exchange name
    /// * `payload` - Message body, serialized as JSON
    /// * `opts` - Publish properties
    ///
    /// # Returns
    /// Whether the broker confirmed the message
    pub async fn broadcast<T>(&self, exchange: &str, payload: &T, opts: &PublishOptions) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.ops
            .publish(&Self::exchange_name(exchange), "", payload, opts)
            .await
    }

    /// Starts a consumer on the durable subscriber queue `fanout.queue.<queue>`.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        opts: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        self.ops.consume(&Self::queue_name(queue), handler, opts).await
    }

    /// Subscribes a transient listener and returns the generated queue name
    /// with the consumer.
    pub async fn subscribe_ephemeral(
        &self,
        exchange: &str,
        handler: Arc<dyn ConsumerHandler>,
        opts: ConsumeOptions,
    ) -> Result<(String, ConsumerHandle), AmqpError> {
        let info = self
            .ops
            .declare_queue(&QueueDefinition::new("").exclusive().auto_delete())
            .await?;

        self.ops
            .bind(&info.name, &Self::exchange_name(exchange), "")
            .await?;

        let handle = self
            .ops
            .consume(&info.name, handler, opts.exclusive().ephemeral())
            .await?;

        info!(exchange, queue = info.name, "ephemeral subscriber attached");

        Ok((info.name, handle))
    }
}

#[async_trait]
impl QueuePattern for FanoutQueue {
    fn kind(&self) -> PatternKind {
        PatternKind::Fanout
    }

    async fn setup(&self, name: &str) -> Result<(), AmqpError> {
        FanoutQueue::setup(self, name).await
    }

    async fn send(&self, name: &str, payload: &Value, opts: &SendOptions) -> Result<bool, AmqpError> {
        let publish = PublishOptions {
            headers: opts.headers.clone(),
            ..Default::default()
        };
        self.broadcast(name, payload, &publish).await
    }

    /// Attaches an ephemeral subscriber to the exchange `name`.
    async fn consume(&self, name: &str, handler: Arc<dyn ConsumerHandler>) -> Result<ConsumerHandle, AmqpError> {
        self.subscribe_ephemeral(name, handler, ConsumeOptions::default())
            .await
            .map(|(_, handle)| handle)
    }
}
