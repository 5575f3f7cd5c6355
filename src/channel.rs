// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the broker seam on top of `lapin`. [`LapinConnector`]
//! establishes a connection to RabbitMQ, creates the operational channel,
//! applies the prefetch ceiling and registers the error listeners that feed
//! the connection manager. [`LapinBroker`] maps every channel primitive to its
//! AMQP method.

use crate::{
    broker::{
        Acker, Broker, ConnectionEventKind, ConnectionEvents, Connector, ConsumerSettings,
        Delivery, DeliveryStream, HeaderTable, HeaderValue, MessageProperties, NoopAcker,
        QueueInfo,
    },
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
        QueuePurgeOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Error as LapinError,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Opens lapin connections to the configured RabbitMQ node.
pub struct LapinConnector {
    uri: String,
    connection_name: String,
}

impl LapinConnector {
    /// Creates a connector for `uri`.
    ///
    /// # Parameters
    /// * `uri` - AMQP URI, credentials included
    /// * `connection_name` - Name shown for the connection in the management UI
    pub fn new(uri: &str, connection_name: &str) -> LapinConnector {
        LapinConnector {
            uri: uri.to_owned(),
            connection_name: connection_name.to_owned(),
        }
    }

    pub fn from_configs(cfg: &RabbitMQConfigs) -> LapinConnector {
        LapinConnector::new(&cfg.uri(), &cfg.connection_name)
    }
}

#[async_trait]
impl Connector for LapinConnector {
    /// Creates the AMQP connection and its operational channel.
    ///
    /// Connection and channel errors are forwarded to `events`; lapin reports
    /// a broker-initiated close through the same error callbacks.
    async fn connect(
        &self,
        prefetch: u16,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn Broker>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()))
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let conn_events = events.clone();
        conn.on_error(move |err| match err {
            LapinError::InvalidConnectionState(_) => {
                conn_events.emit(ConnectionEventKind::ConnectionClosed)
            }
            err => conn_events.emit(ConnectionEventKind::ConnectionError(err.to_string())),
        });

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        if let Err(err) = channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        let channel_events = events;
        channel.on_error(move |err| match err {
            LapinError::InvalidChannelState(_) => {
                channel_events.emit(ConnectionEventKind::ChannelClosed)
            }
            err => channel_events.emit(ConnectionEventKind::ChannelError(err.to_string())),
        });

        Ok(Arc::new(LapinBroker {
            connection: Arc::new(conn),
            channel,
            prefetch: AsyncMutex::new(prefetch),
            scoped: false,
        }))
    }
}

/// Channel primitives over one lapin connection.
pub struct LapinBroker {
    connection: Arc<Connection>,
    channel: Channel,
    /// Channel prefetch ceiling; also serializes the qos + consume pair so
    /// that per-consumer prefetch settings never interleave.
    prefetch: AsyncMutex<u16>,
    /// Short-lived channel with no listeners; closing it leaves the
    /// connection open.
    scoped: bool,
}

#[async_trait]
impl Broker for LapinBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                lapin_exchange_kind(&def.kind),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                field_table(&def.params),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(conflict_or(&def.name, err, AmqpError::DeclareExchangeError))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(
                name,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "failure to delete exchange");
                conflict_or(name, err, AmqpError::DeleteExchangeError)
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                field_table(&def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "failure to declare queue");
                if def.passive && is_soft(&err, AMQPSoftError::NOTFOUND) {
                    return Err(AmqpError::QueueNotFound(def.name.clone()));
                }
                Err(conflict_or(&def.name, err, AmqpError::DeclareQueueError))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(QueueInfo {
                    name: queue.name().to_string(),
                    message_count: queue.message_count(),
                    consumer_count: queue.consumer_count(),
                })
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to unbind queue from exchange");
                AmqpError::UnbindingExchangeFromQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(name, QueuePurgeOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "failure to purge queue");
                not_found_or(name, err, AmqpError::QueueManagementError)
            })
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "failure to delete queue");
                AmqpError::QueueManagementError(name.to_owned())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool, AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &body,
                basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(true),
        }
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), AmqpError> {
        let mut current = self.prefetch.lock().await;

        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))?;

        *current = prefetch;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        settings: &ConsumerSettings,
    ) -> Result<DeliveryStream, AmqpError> {
        let default_prefetch = self.prefetch.lock().await;

        if let Some(prefetch) = settings.prefetch {
            self.channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
                .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))?;
        }

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &settings.tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: settings.no_ack,
                    exclusive: settings.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await;

        if settings.prefetch.is_some() {
            if let Err(err) = self
                .channel
                .basic_qos(*default_prefetch, BasicQosOptions { global: false })
                .await
            {
                error!(error = err.to_string(), "failure to restore channel prefetch");
            }
        }

        let consumer = consumer.map_err(|err| {
            error!(error = err.to_string(), "error to create the consumer");
            not_found_or(queue, err, AmqpError::BindingConsumerError)
        })?;

        let no_ack = settings.no_ack;
        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(into_delivery(delivery, no_ack)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }

    async fn open_channel(&self) -> Result<Arc<dyn Broker>, AmqpError> {
        let channel = self.connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the scoped channel");
            AmqpError::ChannelError(err.to_string())
        })?;
        debug!(id = channel.id(), "scoped channel created");

        Ok(Arc::new(LapinBroker {
            connection: self.connection.clone(),
            channel,
            prefetch: AsyncMutex::new(0),
            scoped: true,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match self.channel.close(200, "closing").await {
            Ok(_) | Err(LapinError::InvalidChannelState(_)) => {}
            Err(err) => error!(error = err.to_string(), "failure to close channel"),
        }

        if self.scoped {
            return Ok(());
        }

        match self.connection.close(200, "closing").await {
            Ok(_) => info!("closed amqp connection"),
            Err(LapinError::InvalidConnectionState(_)) => {
                info!("discarded a previously lost amqp connection")
            }
            Err(err) => return Err(AmqpError::ConnectionError(err.to_string())),
        }

        Ok(())
    }
}

struct DeliveryAcker {
    acker: LapinAcker,
}

#[async_trait]
impl Acker for DeliveryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|_| AmqpError::NackMessageError)
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|_| AmqpError::RejectMessageError)
    }
}

fn into_delivery(delivery: lapin::message::Delivery, no_ack: bool) -> Delivery {
    let acker: Box<dyn Acker> = if no_ack {
        Box::new(NoopAcker)
    } else {
        Box::new(DeliveryAcker {
            acker: delivery.acker,
        })
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: message_properties(&delivery.properties),
        data: delivery.data,
        acker,
    }
}

fn lapin_exchange_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::XMessageDelayed => lapin::ExchangeKind::Custom(kind.as_str().to_owned()),
    }
}

fn is_soft(err: &LapinError, expected: AMQPSoftError) -> bool {
    match err {
        LapinError::ProtocolError(amqp) => {
            matches!(amqp.kind(), AMQPErrorKind::Soft(kind) if *kind == expected)
        }
        _ => false,
    }
}

fn not_found_or(queue: &str, err: LapinError, fallback: fn(String) -> AmqpError) -> AmqpError {
    if is_soft(&err, AMQPSoftError::NOTFOUND) {
        AmqpError::QueueNotFound(queue.to_owned())
    } else {
        fallback(queue.to_owned())
    }
}

/// Maps a `PRECONDITION_FAILED` reply to a topology conflict.
fn conflict_or(name: &str, err: LapinError, fallback: fn(String) -> AmqpError) -> AmqpError {
    if is_soft(&err, AMQPSoftError::PRECONDITIONFAILED) {
        AmqpError::TopologyConflict(name.to_owned(), err.to_string())
    } else {
        fallback(name.to_owned())
    }
}

fn amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        HeaderValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
    }
}

fn header_value(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::ShortShortUInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::ShortInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::ShortUInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::LongInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::LongUInt(i) => HeaderValue::Int((*i).into()),
        AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
        AMQPValue::ShortString(s) => HeaderValue::String(s.to_string()),
        AMQPValue::LongString(s) => {
            HeaderValue::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        other => HeaderValue::String(format!("{:?}", other)),
    }
}

fn field_table(table: &HeaderTable) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = table
        .iter()
        .map(|(k, v)| (ShortString::from(k.clone()), amqp_value(v)))
        .collect();

    FieldTable::from(btree)
}

fn basic_properties(props: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_content_type(ShortString::from(
            props.content_type.unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
        ))
        .with_headers(field_table(&props.headers));

    if let Some(id) = props.message_id {
        basic = basic.with_message_id(ShortString::from(id));
    }
    if let Some(ts) = props.timestamp {
        basic = basic.with_timestamp(ts);
    }
    if let Some(priority) = props.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(mode) = props.delivery_mode {
        basic = basic.with_delivery_mode(mode);
    }
    if let Some(expiration) = props.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.to_string()));
    }

    basic
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    let headers: HeaderTable = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.to_string(), header_value(v)))
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        timestamp: *props.timestamp(),
        priority: *props.priority(),
        delivery_mode: *props.delivery_mode(),
        expiration: props
            .expiration()
            .as_ref()
            .and_then(|v| v.as_str().parse().ok()),
        headers,
    }
}
