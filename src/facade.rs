// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Client
//!
//! [`MessagingClient`] wires the whole stack around one connection manager
//! and exposes the application-level operations. Convenience operations
//! never return errors: they answer with an [`OperationResult`] telling
//! success from failure with a readable message.

use crate::{
    broker::{Connector, QueueInfo},
    channel::LapinConnector,
    configs::RabbitMQConfigs,
    connection::{ConnectionManager, ConnectionSettings, ConnectionState, HealthReport, HealthStatus},
    dead_letter::DeadLetterService,
    errors::AmqpError,
    operations::{PublishOptions, QueueOperations},
    patterns::{
        delay::DelayQueue,
        fanout::FanoutQueue,
        priority::{PriorityLevel, PriorityQueue},
        topic::TopicQueue,
        work::WorkQueue,
        PatternRegistry,
    },
    topology::{default_topology, QueueTopology, TopologyRegistrar, TopologyStatus},
};
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{error, info};

/// Work queue receiving email tasks.
pub const EMAIL_QUEUE: &str = "email";
/// Priority queue receiving generic tasks.
pub const TASKS_QUEUE: &str = "tasks";
/// Fanout exchange for notifications.
pub const NOTIFICATIONS_EXCHANGE: &str = "notifications";
/// Topic exchange for domain events.
pub const EVENTS_EXCHANGE: &str = "events";
/// Delay queue for deferred and scheduled tasks.
pub const SCHEDULED_QUEUE: &str = "scheduled";

/// Outcome of a convenience operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    /// Whether the operation reached the broker.
    pub success: bool,
    /// Human readable outcome.
    pub message: String,
    /// Operation specific details, absent on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl OperationResult {
    /// Successful outcome carrying `data`.
    pub fn ok(message: &str, data: Value) -> OperationResult {
        OperationResult {
            success: true,
            message: message.to_owned(),
            data: Some(data),
        }
    }

    /// Failed outcome carrying only the reason.
    pub fn failed(message: String) -> OperationResult {
        OperationResult {
            success: false,
            message,
            data: None,
        }
    }

    fn from_publish(result: Result<bool, AmqpError>, message: &str, data: Value) -> OperationResult {
        match result {
            Ok(true) => OperationResult::ok(message, data),
            Ok(false) => OperationResult::failed("broker did not accept the message".to_owned()),
            Err(err) => {
                error!(error = err.to_string(), "messaging operation failed");
                OperationResult::failed(err.to_string())
            }
        }
    }
}

/// Aggregate counters over the declared queues.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemOverview {
    /// Number of queues that could be inspected.
    pub total_queues: usize,
    /// Ready messages summed over [`queues`](SystemOverview::queues).
    pub total_messages: u64,
    pub total_consumers: u64,
    /// Per-queue counters.
    pub queues: Vec<QueueInfo>,
    /// Queues that could not be inspected, as `"<queue>: <error>"`.
    pub errors: Vec<String>,
    pub connection: ConnectionState,
    pub topology: TopologyStatus,
}

/// Application-facing client bundling every messaging pattern over one
/// connection.
///
/// The client is cheap to share behind an [`Arc`]; pattern services are
/// reachable through accessors for callers that need the full API.
pub struct MessagingClient {
    manager: Arc<ConnectionManager>,
    ops: Arc<QueueOperations>,
    topology: TopologyRegistrar,
    work: Arc<WorkQueue>,
    priority: Arc<PriorityQueue>,
    delay: Arc<DelayQueue>,
    fanout: Arc<FanoutQueue>,
    topic: Arc<TopicQueue>,
    dead_letter: DeadLetterService,
    registry: PatternRegistry,
}

impl MessagingClient {
    /// Builds the client on top of the lapin connector with the default
    /// topology.
    pub fn from_configs(cfg: &RabbitMQConfigs) -> MessagingClient {
        MessagingClient::new(
            Arc::new(LapinConnector::from_configs(cfg)),
            cfg.connection_settings(),
            default_topology(),
        )
    }

    /// Creates a client without connecting.
    ///
    /// # Parameters
    /// * `connector` - Opens broker sessions for the connection manager
    /// * `settings` - Reconnection and heartbeat settings
    /// * `table` - Topology installed by [`start`](MessagingClient::start)
    ///
    /// # Returns
    /// The client, idle until [`start`](MessagingClient::start) is called
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings, table: Vec<QueueTopology>) -> MessagingClient {
        let manager = ConnectionManager::new(connector, settings);
        let ops = QueueOperations::new(manager.clone());

        let work = Arc::new(WorkQueue::new(ops.clone()));
        let priority = Arc::new(PriorityQueue::new(ops.clone()));
        let delay = Arc::new(DelayQueue::new(ops.clone()));
        let fanout = Arc::new(FanoutQueue::new(ops.clone()));
        let topic = Arc::new(TopicQueue::new(ops.clone()));

        let registry = PatternRegistry::new()
            .register(work.clone())
            .register(priority.clone())
            .register(delay.clone())
            .register(fanout.clone())
            .register(topic.clone());

        MessagingClient {
            topology: TopologyRegistrar::new(ops.clone(), table),
            dead_letter: DeadLetterService::new(ops.clone()),
            manager,
            ops,
            work,
            priority,
            delay,
            fanout,
            topic,
            registry,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Low-level queue operations shared by every pattern.
    pub fn operations(&self) -> &Arc<QueueOperations> {
        &self.ops
    }

    pub fn topology(&self) -> &TopologyRegistrar {
        &self.topology
    }

    pub fn work(&self) -> &WorkQueue {
        &self.work
    }

    pub fn priority(&self) -> &PriorityQueue {
        &self.priority
    }

    pub fn delay(&self) -> &DelayQueue {
        &self.delay
    }

    pub fn fanout(&self) -> &FanoutQueue {
        &self.fanout
    }

    pub fn topic(&self) -> &TopicQueue {
        &self.topic
    }

    pub fn dead_letter(&self) -> &DeadLetterService {
        &self.dead_letter
    }

    /// Registered patterns, for lookups by [`PatternKind`](crate::patterns::PatternKind).
    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    /// Connects, installs the topology and prepares the scheduled queue.
    pub async fn start(&self) -> Result<(), AmqpError> {
        self.manager.connect().await?;
        self.topology.initialize().await?;
        let strategy = self.delay.setup(SCHEDULED_QUEUE).await?;

        info!(delay_strategy = ?strategy, "messaging client started");
        Ok(())
    }

    /// Stops every consumer and closes the connection.
    ///
    /// # Parameters
    /// * `grace` - How long in-flight handlers may run before being cancelled
    pub async fn shutdown(&self, grace: Duration) -> Result<(), AmqpError> {
        self.ops.shutdown(grace).await
    }

    /// Queues an email task on the work queue.
    ///
    /// # Parameters
    /// * `payload` - Task body, serialized as JSON
    ///
    /// # Returns
    /// An [`OperationResult`] whose data names the target queue
    pub async fn send_email_task(&self, payload: &Value) -> OperationResult {
        let result = self
            .work
            .send(EMAIL_QUEUE, payload, &PublishOptions::default())
            .await;

        OperationResult::from_publish(
            result,
            "email task queued",
            json!({"queue": WorkQueue::queue_name(EMAIL_QUEUE)}),
        )
    }

    /// Queues a task on the priority queue.
    ///
    /// # Parameters
    /// * `payload` - Task body, serialized as JSON
    /// * `level` - Priority the task is published with
    ///
    /// # Returns
    /// An [`OperationResult`] whose data holds the queue and numeric priority
    pub async fn send_priority_task(&self, payload: &Value, level: PriorityLevel) -> OperationResult {
        let result = self
            .priority
            .send_level(TASKS_QUEUE, payload, level, &PublishOptions::default())
            .await;

        OperationResult::from_publish(
            result,
            "priority task queued",
            json!({"queue": PriorityQueue::queue_name(TASKS_QUEUE), "priority": level.value()}),
        )
    }

    /// Shorthand for [`send_priority_task`](MessagingClient::send_priority_task)
    /// at [`PriorityLevel::Urgent`].
    pub async fn send_urgent_task(&self, payload: &Value) -> OperationResult {
        self.send_priority_task(payload, PriorityLevel::Urgent).await
    }

    /// Broadcasts a notification to every bound subscriber.
    ///
    /// # Parameters
    /// * `payload` - Notification body, serialized as JSON
    ///
    /// # Returns
    /// An [`OperationResult`] whose data names the fanout exchange
    pub async fn broadcast_notification(&self, payload: &Value) -> OperationResult {
        let result = self
            .fanout
            .broadcast(NOTIFICATIONS_EXCHANGE, payload, &PublishOptions::default())
            .await;

        OperationResult::from_publish(
            result,
            "notification broadcast",
            json!({"exchange": FanoutQueue::exchange_name(NOTIFICATIONS_EXCHANGE)}),
        )
    }

    /// Publishes a domain event on the topic exchange.
    ///
    /// # Parameters
    /// * `routing_key` - Dotted key matched against subscriber patterns
    /// * `payload` - Event body, serialized as JSON
    ///
    /// # Returns
    /// An [`OperationResult`] whose data holds the exchange and routing key
    pub async fn publish_event(&self, routing_key: &str, payload: &Value) -> OperationResult {
        let result = self
            .topic
            .publish(EVENTS_EXCHANGE, routing_key, payload, &PublishOptions::default())
            .await;

        OperationResult::from_publish(
            result,
            "event published",
            json!({"exchange": TopicQueue::exchange_name(EVENTS_EXCHANGE), "routingKey": routing_key}),
        )
    }

    /// Queues a task delivered once `delay` has elapsed.
    ///
    /// # Parameters
    /// * `payload` - Task body, serialized as JSON
    /// * `delay` - Time to hold the message back
    ///
    /// # Returns
    /// An [`OperationResult`] whose data holds the queue and the delay in milliseconds
    pub async fn send_delayed_task(&self, payload: &Value, delay: Duration) -> OperationResult {
        let result = self
            .delay
            .send(SCHEDULED_QUEUE, payload, delay, &PublishOptions::default())
            .await;

        OperationResult::from_publish(
            result,
            "delayed task queued",
            json!({"queue": DelayQueue::queue_name(SCHEDULED_QUEUE), "delayMs": delay.as_millis() as u64}),
        )
    }

    /// Queues a task delivered at `at`. Times in the past deliver immediately.
    ///
    /// # Returns
    /// An [`OperationResult`] whose data holds the queue and the target epoch milliseconds
    pub async fn schedule_task(&self, payload: &Value, at: SystemTime) -> OperationResult {
        let result = self
            .delay
            .schedule_at(SCHEDULED_QUEUE, payload, at, &PublishOptions::default())
            .await;

        let at_ms = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        OperationResult::from_publish(
            result,
            "task scheduled",
            json!({"queue": DelayQueue::queue_name(SCHEDULED_QUEUE), "scheduledAt": at_ms}),
        )
    }

    /// Connection health, degraded while the topology is not installed.
    pub fn health(&self) -> HealthReport {
        let mut report = self.manager.health();

        if !self.topology.is_initialized() {
            report.status = HealthStatus::Unhealthy;
            report.errors.push("topology not initialized".to_owned());
        }

        report
    }

    /// Message and consumer counts of one queue.
    ///
    /// # Errors
    /// [`AmqpError::QueueNotFound`] when the queue does not exist
    pub async fn queue_stats(&self, queue: &str) -> Result<QueueInfo, AmqpError> {
        self.ops.queue_info(queue).await
    }

    /// Counters over every queue of the topology table. Queues that cannot
    /// be inspected are reported in `errors`.
    pub async fn overview(&self) -> SystemOverview {
        let mut queues = vec![];
        let mut errors = vec![];

        for name in self.topology.queue_names() {
            match self.ops.queue_info(&name).await {
                Ok(info) => queues.push(info),
                Err(err) => errors.push(format!("{name}: {err}")),
            }
        }

        SystemOverview {
            total_queues: queues.len(),
            total_messages: queues.iter().map(|q| u64::from(q.message_count)).sum(),
            total_consumers: queues.iter().map(|q| u64::from(q.consumer_count)).sum(),
            queues,
            errors,
            connection: self.manager.state(),
            topology: self.topology.status(),
        }
    }

    /// Purges every named queue, reporting per-queue counts.
    pub async fn purge_queues(&self, queues: &[&str]) -> OperationResult {
        let mut purged = serde_json::Map::new();
        let mut failures = vec![];

        for queue in queues {
            match self.ops.purge_queue(queue).await {
                Ok(count) => {
                    purged.insert((*queue).to_owned(), Value::from(count));
                }
                Err(err) => failures.push(format!("{queue}: {err}")),
            }
        }

        if failures.is_empty() {
            return OperationResult::ok("queues purged", Value::Object(purged));
        }

        OperationResult {
            success: false,
            message: format!("failed to purge {}", failures.join(", ")),
            data: Some(Value::Object(purged)),
        }
    }
}
