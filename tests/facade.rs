// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{eventually, recorder, settings, MemoryCluster};
use pretty_assertions::assert_eq;
use rabbitmq_patterns::{
    facade::{MessagingClient, EMAIL_QUEUE},
    patterns::{
        delay::{DelayQueue, DelayStrategy},
        priority::PriorityLevel,
        PatternKind, QueuePattern, SendOptions,
    },
    topology::default_topology,
};
use serde_json::json;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

async fn started(cluster: &Arc<MemoryCluster>) -> MessagingClient {
    let client = MessagingClient::new(cluster.connector(), settings(), default_topology());
    client.start().await.unwrap();
    client
}

#[tokio::test]
async fn start_installs_topology_and_reports_healthy() {
    let cluster = MemoryCluster::new();
    let client = MessagingClient::new(cluster.connector(), settings(), default_topology());

    assert!(!client.health().is_healthy());

    client.start().await.unwrap();

    let health = client.health();
    assert!(health.is_healthy(), "{:?}", health.errors);
    assert!(client.topology().is_initialized());
    assert_eq!(client.delay().strategy(), Some(DelayStrategy::TtlFallback));
    assert!(cluster.queue_exists(&DelayQueue::queue_name("scheduled")));
}

#[tokio::test]
async fn convenience_operations_report_success() {
    let cluster = MemoryCluster::new();
    let client = started(&cluster).await;
    client.work().setup(EMAIL_QUEUE).await.unwrap();
    client.priority().setup("tasks", 10).await.unwrap();

    let email = client.send_email_task(&json!({"to": "a@b.c"})).await;
    assert!(email.success, "{}", email.message);
    assert_eq!(email.data, Some(json!({"queue": "work.queue.email"})));
    assert_eq!(cluster.ready_count("work.queue.email"), 1);

    let urgent = client.send_urgent_task(&json!({"job": "page"})).await;
    assert!(urgent.success);
    assert_eq!(urgent.data, Some(json!({"queue": "priority.queue.tasks", "priority": 10})));

    let normal = client
        .send_priority_task(&json!({"job": "batch"}), PriorityLevel::Normal)
        .await;
    assert!(normal.success);
    assert_eq!(cluster.ready_count("priority.queue.tasks"), 2);

    let broadcast = client.broadcast_notification(&json!({"title": "hi"})).await;
    assert!(broadcast.success);
    assert_eq!(cluster.ready_count("fanout.queue.notifications.email"), 1);
    assert_eq!(cluster.ready_count("fanout.queue.notifications.sms"), 1);

    let event = client.publish_event("user.created", &json!({"id": 1})).await;
    assert!(event.success);
    assert_eq!(cluster.ready_count("topic.queue.events.user"), 1);
    assert_eq!(cluster.ready_count("topic.queue.events.all"), 1);
}

#[tokio::test]
async fn delayed_and_scheduled_tasks_arrive_later() {
    let cluster = MemoryCluster::new();
    let client = started(&cluster).await;

    let (seen, handler) = recorder();
    let consumer = client
        .delay()
        .consume("scheduled", handler, Default::default())
        .await
        .unwrap();

    let delayed = client
        .send_delayed_task(&json!({"job": "later"}), Duration::from_millis(50))
        .await;
    assert!(delayed.success);
    assert_eq!(delayed.data.as_ref().unwrap()["delayMs"], json!(50));

    let at = SystemTime::now() + Duration::from_millis(100);
    assert!(client.schedule_task(&json!({"job": "at"}), at).await.success);

    assert!(eventually(Duration::from_secs(2), || seen.lock().len() == 2).await);

    let past = SystemTime::now() - Duration::from_secs(60);
    let refused = client.schedule_task(&json!({}), past).await;
    assert!(!refused.success);
    assert!(refused.message.contains("past"));

    consumer.stop().await;
}

#[tokio::test]
async fn failures_are_reported_not_raised() {
    let cluster = MemoryCluster::new();
    let client = MessagingClient::new(cluster.connector(), settings(), default_topology());

    let result = client.send_email_task(&json!({})).await;

    assert!(!result.success);
    assert_eq!(result.message, "connection not ready");
    assert_eq!(result.data, None);
}

#[tokio::test]
async fn overview_and_purge() {
    let cluster = MemoryCluster::new();
    let client = started(&cluster).await;

    client.broadcast_notification(&json!({"n": 1})).await;
    client.broadcast_notification(&json!({"n": 2})).await;

    let overview = client.overview().await;
    assert_eq!(overview.total_queues, 6);
    assert_eq!(overview.total_messages, 4);
    assert_eq!(overview.total_consumers, 0);
    assert!(overview.errors.is_empty());
    assert!(overview.connection.connected);
    assert!(overview.topology.initialized);

    let stats = client
        .queue_stats("fanout.queue.notifications.sms")
        .await
        .unwrap();
    assert_eq!(stats.message_count, 2);

    assert!(client.queue_stats("nope").await.is_err());
    let overview = client.overview().await;
    assert!(overview.errors.is_empty(), "{:?}", overview.errors);
    assert_eq!(overview.total_messages, 4);
    assert_eq!(cluster.connects(), 1);

    let purged = client
        .purge_queues(&["fanout.queue.notifications.email", "missing"])
        .await;
    assert!(!purged.success);
    assert_eq!(purged.data, Some(json!({"fanout.queue.notifications.email": 2})));
    assert_eq!(cluster.ready_count("fanout.queue.notifications.email"), 0);
}

#[tokio::test]
async fn registry_dispatches_by_pattern_kind() {
    let cluster = MemoryCluster::new();
    let client = started(&cluster).await;

    assert_eq!(client.registry().kinds().len(), PatternKind::ALL.len());

    let topic = client.registry().get(PatternKind::Topic).unwrap();
    let opts = SendOptions {
        routing_key: Some("user.deleted".to_owned()),
        ..Default::default()
    };
    assert!(topic.send("events", &json!({"id": 2}), &opts).await.unwrap());
    assert_eq!(cluster.ready_count("topic.queue.events.user"), 1);

    let work = client.registry().get(PatternKind::Work).unwrap();
    work.setup("reports").await.unwrap();
    assert!(work
        .send("reports", &json!({}), &SendOptions::default())
        .await
        .unwrap());
    assert_eq!(cluster.ready_count("work.queue.reports"), 1);
}

#[tokio::test]
async fn shutdown_closes_the_connection() {
    let cluster = MemoryCluster::new();
    let client = started(&cluster).await;

    client.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(cluster.live_sessions(), 0);
    assert!(!client.health().is_healthy());
}
