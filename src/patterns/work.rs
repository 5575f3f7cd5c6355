// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Competing consumers on one durable queue. Workers take one message at a
//! time unless told otherwise, so the broker hands the next message to
//! whichever worker is free.

use super::{PatternKind, QueuePattern, SendOptions};
use crate::{
    broker::QueueInfo,
    consumer::ConsumerHandler,
    errors::AmqpError,
    operations::{ConsumeOptions, ConsumerHandle, PublishOptions, QueueOperations},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Prefetch applied to each worker when none is given.
pub const DEFAULT_WORKER_PREFETCH: u16 = 1;

/// Competing consumers on a durable queue. Each message reaches one worker.
pub struct WorkQueue {
    ops: Arc<QueueOperations>,
}

impl WorkQueue {
    pub fn new(ops: Arc<QueueOperations>) -> WorkQueue {
        WorkQueue { ops }
    }

    /// Queue name for `name`, as `work.queue.<name>`.
    pub fn queue_name(name: &str) -> String {
        PatternKind::Work.queue_name(name)
    }

    /// Declares the durable queue `work.queue.<name>`.
    ///
    /// # Returns
    /// The queue counters after the declaration
    pub async fn setup(&self, name: &str) -> Result<QueueInfo, AmqpError> {
        self.ops
            .declare_queue(&QueueDefinition::new(&Self::queue_name(name)).durable())
            .await
    }

    /// Publishes a task through the default exchange, persistent unless `opts`
    /// say otherwise.
    ///
    /// # Parameters
    /// * `name` - Logical queue name
    /// * `payload` - Task body, serialized as JSON
    /// * `opts` - Publish properties
    ///
    /// # Returns
    /// Whether the broker confirmed the message
    pub async fn send<T>(&self, name: &str, payload: &T, opts: &PublishOptions) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.ops.send_to_queue(&Self::queue_name(name), payload, opts).await
    }

    /// Starts `count` consumers on the queue.
    ///
    /// Workers are tagged `<prefix>.worker.<n>`, where the prefix is the tag
    /// given in `opts` or the queue name and `n` comes from the consumer tag
    /// sequence, so calling this again for the same queue adds workers. If
    /// one of them cannot start, the ones already running are stopped.
    ///
    /// # Parameters
    /// * `name` - Logical queue name, without the `work.queue.` prefix
    /// * `handler` - Handler shared by every worker
    /// * `count` - Number of workers, at least one
    /// * `opts` - Consumer options; prefetch defaults to [`DEFAULT_WORKER_PREFETCH`]
    ///
    /// # Returns
    /// One handle per started worker
    pub async fn start_workers(
        &self,
        name: &str,
        handler: Arc<dyn ConsumerHandler>,
        count: usize,
        opts: ConsumeOptions,
    ) -> Result<Vec<ConsumerHandle>, AmqpError> {
        if count == 0 {
            return Err(AmqpError::ValidationError(
                "worker count must be at least 1".to_owned(),
            ));
        }

        let queue = Self::queue_name(name);
        let prefetch = opts.prefetch.unwrap_or(DEFAULT_WORKER_PREFETCH);
        let mut workers = Vec::with_capacity(count);

        let prefix = format!("{}.worker", opts.tag.as_deref().unwrap_or(&queue));

        for n in 0..count {
            let worker_opts = ConsumeOptions {
                prefetch: Some(prefetch),
                tag: Some(self.ops.consumer_tag(&prefix)),
                ..opts.clone()
            };

            match self.ops.consume(&queue, handler.clone(), worker_opts).await {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    warn!(error = err.to_string(), queue, worker = n, "failure to start worker");
                    for worker in workers {
                        worker.stop().await;
                    }
                    return Err(err);
                }
            }
        }

        info!(queue, count, prefetch, "workers started");

        Ok(workers)
    }
}

#[async_trait]
impl QueuePattern for WorkQueue {
    fn kind(&self) -> PatternKind {
        PatternKind::Work
    }

    async fn setup(&self, name: &str) -> Result<(), AmqpError> {
        WorkQueue::setup(self, name).await.map(|_| ())
    }

    async fn send(&self, name: &str, payload: &Value, opts: &SendOptions) -> Result<bool, AmqpError> {
        let publish = PublishOptions {
            headers: opts.headers.clone(),
            ..Default::default()
        };
        WorkQueue::send(self, name, payload, &publish).await
    }

    async fn consume(&self, name: &str, handler: Arc<dyn ConsumerHandler>) -> Result<ConsumerHandle, AmqpError> {
        let mut workers = self
            .start_workers(name, handler, 1, ConsumeOptions::default())
            .await?;

        workers
            .pop()
            .ok_or_else(|| AmqpError::InternalError("worker did not start".to_owned()))
    }
}
