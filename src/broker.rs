// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Seam
//!
//! This module defines the narrow interface every higher layer uses to talk to
//! the broker. [`Connector`] opens a connection with one operational channel,
//! [`Broker`] exposes the channel primitives on that connection and [`Acker`]
//! settles a single inbound delivery.
//!
//! The production implementation lives in [`crate::channel`] and is backed by
//! `lapin`. Keeping the seam as traits lets the connection manager, the
//! topology registrar and the pattern services run unchanged against any
//! other implementation.

use crate::{errors::AmqpError, exchange::ExchangeDefinition, queue::QueueBinding, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::mpsc;
use tracing::debug;

/// AMQP delivery mode marking a message as persistent.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// AMQP delivery mode marking a message as transient.
pub const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// A header or broker argument value.
///
/// Only the value shapes the messaging layer needs are modelled: booleans,
/// signed integers and strings. The serialized form is the bare JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl HeaderValue {
    /// Converts an arbitrary JSON value, stringifying shapes without a direct
    /// counterpart.
    pub fn from_json(value: &serde_json::Value) -> HeaderValue {
        match value {
            serde_json::Value::Bool(b) => HeaderValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => HeaderValue::Int(i),
                None => HeaderValue::String(n.to_string()),
            },
            serde_json::Value::String(s) => HeaderValue::String(s.clone()),
            other => HeaderValue::String(other.to_string()),
        }
    }

    /// JSON counterpart of the value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            HeaderValue::Bool(b) => serde_json::Value::Bool(*b),
            HeaderValue::Int(i) => serde_json::Value::from(*i),
            HeaderValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Integer value, parsing strings as some brokers stringify numeric headers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::String(s) => s.parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Header or argument table keyed by name.
pub type HeaderTable = BTreeMap<String, HeaderValue>;

/// Transport-level properties attached to a published or delivered message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// Seconds since epoch, as carried by the AMQP timestamp property.
    pub timestamp: Option<u64>,
    pub priority: Option<u8>,
    /// `2` for persistent messages, `1` for transient ones.
    pub delivery_mode: Option<u8>,
    /// Per-message TTL in milliseconds.
    pub expiration: Option<u64>,
    pub headers: HeaderTable,
}

impl MessageProperties {
    /// Whether the message survives a broker restart.
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(PERSISTENT_DELIVERY_MODE)
    }
}

/// Queue counters reported by a declaration or a passive inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    /// Queue name, generated by the broker for server-named queues.
    pub name: String,
    /// Messages ready for delivery, excluding unacknowledged ones.
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Consumer registration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub tag: String,
    /// Per-consumer prefetch; `None` keeps the channel ceiling.
    pub prefetch: Option<u16>,
    /// Broker-side acknowledgment on delivery.
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Settles one inbound delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acker: Send + Sync {
    /// Acknowledges the delivery.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Negatively acknowledges the delivery, requeueing it when `requeue` is set.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;

    /// Rejects the delivery. Without requeue the broker dead-letters it when the
    /// queue has a dead-letter exchange.
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Acker for deliveries the broker already considers settled (`no_ack`).
pub struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// A message handed over by the broker to a consumer.
pub struct Delivery {
    /// Channel-scoped sequence number of the delivery.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    /// Set when the broker delivered this message before without a settlement.
    pub redelivered: bool,
    pub properties: MessageProperties,
    /// Raw message body.
    pub data: Vec<u8>,
    /// Settles the delivery on the channel it arrived on.
    pub acker: Box<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer; it ends when the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Channel primitives of one live broker connection.
///
/// All declarations are idempotent on the broker side: declaring the same
/// entity twice with identical parameters succeeds, declaring it with
/// conflicting parameters fails with [`AmqpError::TopologyConflict`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError>;

    /// Declares the queue, or only inspects it when the definition is passive.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Returns the number of purged messages.
    async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError>;

    /// Returns the number of messages deleted along with the queue.
    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError>;

    /// Returns whether the broker client accepted the frame into its buffers.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool, AmqpError>;

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        settings: &ConsumerSettings,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Opens a short-lived channel on the same connection.
    ///
    /// RabbitMQ answers a lookup of a missing entity by closing the channel
    /// it was issued on. Inspections and administrative calls go through a
    /// scoped channel so that such a close never reaches the operational
    /// channel or the connection manager.
    ///
    /// # Returns
    /// A broker whose [`close`](Broker::close) only closes the scoped channel
    async fn open_channel(&self) -> Result<Arc<dyn Broker>, AmqpError>;

    /// Closes the channel and then the connection, tolerating either being
    /// already gone. A scoped channel only closes itself.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Signals observed on a connection or its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    ConnectionClosed,
    ConnectionError(String),
    ChannelClosed,
    ChannelError(String),
    Blocked(String),
    Unblocked,
}

impl ConnectionEventKind {
    /// Whether the event means the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConnectionEventKind::Blocked(_) | ConnectionEventKind::Unblocked
        )
    }
}

/// A [`ConnectionEventKind`] tagged with the connection generation it
/// originates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Connection generation, incremented on every connection.
    pub generation: u64,
    pub kind: ConnectionEventKind,
}

/// Cheaply cloneable sink through which a [`Connector`] reports events of the
/// connection it opened.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    generation: u64,
    sender: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl ConnectionEvents {
    pub(crate) fn new(generation: u64, sender: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        ConnectionEvents {
            generation,
            sender: Some(sender),
        }
    }

    /// Sink for sessions nobody watches.
    pub fn detached() -> Self {
        ConnectionEvents {
            generation: 0,
            sender: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports `kind` to the connection manager. Events sent after the manager
    /// is gone are dropped.
    pub fn emit(&self, kind: ConnectionEventKind) {
        let Some(sender) = &self.sender else {
            return;
        };

        if sender
            .send(ConnectionEvent {
                generation: self.generation,
                kind,
            })
            .is_err()
        {
            debug!("connection event dropped, manager is gone");
        }
    }
}

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes a connection and one operational channel with the given
    /// prefetch ceiling. Close and error signals of both must be reported
    /// through `events`.
    async fn connect(
        &self,
        prefetch: u16,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn Broker>, AmqpError>;
}

/// Lets `broker` hand out scoped channels that find every queue they are
/// asked about.
#[cfg(test)]
pub(crate) fn expect_scoped_channels(broker: &mut MockBroker) {
    broker.expect_open_channel().returning(|| {
        let mut scoped = MockBroker::new();
        scoped
            .expect_declare_queue()
            .withf(|def| def.is_passive())
            .returning(|def| {
                Ok(QueueInfo {
                    name: def.name().to_owned(),
                    ..Default::default()
                })
            });
        scoped.expect_close().returning(|| Ok(()));
        Ok(Arc::new(scoped) as Arc<dyn Broker>)
    });
}
