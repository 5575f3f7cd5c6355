// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Priority queues backed by the broker `x-max-priority` argument.
//!
//! Among the messages available when a worker asks for the next one, the
//! highest priority wins. This is not a global order over the queue history.

use super::{PatternKind, QueuePattern, SendOptions};
use crate::{
    broker::QueueInfo,
    consumer::ConsumerHandler,
    errors::AmqpError,
    operations::{ConsumeOptions, ConsumerHandle, PublishOptions, QueueOperations},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// `x-max-priority` used when the queue is set up through the registry.
pub const DEFAULT_MAX_PRIORITY: u8 = 10;

/// Named priority tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    /// Priority 1.
    Low,
    /// Priority 5.
    #[default]
    Normal,
    /// Priority 8.
    High,
    /// Priority 10.
    Urgent,
}

impl PriorityLevel {
    /// Numeric priority sent with the message.
    pub fn value(self) -> u8 {
        match self {
            PriorityLevel::Low => 1,
            PriorityLevel::Normal => 5,
            PriorityLevel::High => 8,
            PriorityLevel::Urgent => 10,
        }
    }
}

impl From<PriorityLevel> for u8 {
    fn from(level: PriorityLevel) -> u8 {
        level.value()
    }
}

/// Accepts priorities in `0..=255`.
pub fn validate_priority(priority: i64) -> Result<u8, AmqpError> {
    u8::try_from(priority).map_err(|_| AmqpError::InvalidPriority(priority))
}

/// Durable queues whose messages carry a priority.
pub struct PriorityQueue {
    ops: Arc<QueueOperations>,
}

impl PriorityQueue {
    pub fn new(ops: Arc<QueueOperations>) -> PriorityQueue {
        PriorityQueue { ops }
    }

    /// Queue name for `name`, as `priority.queue.<name>`.
    pub fn queue_name(name: &str) -> String {
        PatternKind::Priority.queue_name(name)
    }

    /// Declares `priority.queue.<name>` with `x-max-priority`.
    ///
    /// # Parameters
    /// * `name` - Logical queue name
    /// * `max_priority` - Highest priority the broker will order by; higher
    ///   values are treated as equal to it
    ///
    /// # Returns
    /// The queue counters after the declaration
    ///
    /// # Errors
    /// [`AmqpError::TopologyConflict`] when the queue exists with other arguments
    pub async fn setup(&self, name: &str, max_priority: u8) -> Result<QueueInfo, AmqpError> {
        self.ops
            .declare_queue(
                &QueueDefinition::new(&Self::queue_name(name))
                    .durable()
                    .max_priority(max_priority),
            )
            .await
    }

    /// Sends with an explicit priority; out-of-range values are rejected
    /// before anything reaches the broker.
    pub async fn send<T>(
        &self,
        name: &str,
        payload: &T,
        priority: i64,
        opts: &PublishOptions,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let priority = validate_priority(priority)?;

        let opts = PublishOptions {
            priority: Some(priority),
            ..opts.clone()
        };

        self.ops.send_to_queue(&Self::queue_name(name), payload, &opts).await
    }

    /// Sends with the numeric value of a named tier.
    ///
    /// # Parameters
    /// * `name` - Logical queue name
    /// * `payload` - Message body, serialized as JSON
    /// * `level` - Priority tier
    /// * `opts` - Publish properties; any priority in it is overridden
    ///
    /// # Returns
    /// Whether the broker confirmed the message
    pub async fn send_level<T>(
        &self,
        name: &str,
        payload: &T,
        level: PriorityLevel,
        opts: &PublishOptions,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.send(name, payload, level.value().into(), opts).await
    }

    /// Starts a consumer on `priority.queue.<name>`.
    pub async fn consume(
        &self,
        name: &str,
        handler: Arc<dyn ConsumerHandler>,
        opts: ConsumeOptions,
    ) -> Result<ConsumerHandle, AmqpError> {
        self.ops.consume(&Self::queue_name(name), handler, opts).await
    }
}

#[async_trait]
impl QueuePattern for PriorityQueue {
    fn kind(&self) -> PatternKind {
        PatternKind::Priority
    }

    async fn setup(&self, name: &str) -> Result<(), AmqpError> {
        PriorityQueue::setup(self, name, DEFAULT_MAX_PRIORITY).await.map(|_| ())
    }

    async fn send(&self, name: &str, payload: &Value, opts: &SendOptions) -> Result<bool, AmqpError> {
        let priority = opts
            .priority
            .unwrap_or_else(|| PriorityLevel::default().value().into());

        let publish = PublishOptions {
            headers: opts.headers.clone(),
            ..Default::default()
        };

        PriorityQueue::send(self, name, payload, priority, &publish).await
    }

    async fn consume(&self, name: &str, handler: Arc<dyn ConsumerHandler>) -> Result<ConsumerHandle, AmqpError> {
        PriorityQueue::consume(self, name, handler, ConsumeOptions::default()).await
    }
}
