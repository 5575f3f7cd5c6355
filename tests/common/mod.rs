// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker behind the public connector seam.
//!
//! It models the broker behaviour the messaging layer relies on: default,
//! direct, fanout and topic routing, the delayed exchange extension, priority
//! queues, queue and per-message TTL, dead-lettering, prefetch-bounded
//! round-robin dispatch, requeue on connection loss and server-named queues.
//! Like RabbitMQ, a lookup of a missing queue on the operational channel
//! closes it, while scoped channels fail on their own.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use rabbitmq_patterns::{
    broker::{
        Acker, Broker, ConnectionEventKind, ConnectionEvents, Connector, ConsumerSettings, Delivery,
        DeliveryStream, HeaderTable, HeaderValue, MessageProperties, NoopAcker, QueueInfo,
    },
    connection::{ConnectionManager, ConnectionSettings},
    consumer::ConsumerHandler,
    envelope::MessageEnvelope,
    errors::{AmqpError, HandlerError},
    exchange::{ExchangeDefinition, ExchangeKind, AMQP_HEADERS_DELAY, AMQP_HEADERS_DELAYED_EXCHANGE_TYPE},
    operations::QueueOperations,
    patterns::topic::topic_matches,
    queue::{
        QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
        AMQP_HEADERS_MAX_PRIORITY, AMQP_HEADERS_MESSAGE_TTL,
    },
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;

/// Fast reconnect settings for tests.
pub fn settings() -> ConnectionSettings {
    ConnectionSettings {
        prefetch: 10,
        max_reconnect_attempts: 5,
        reconnect_delay_base: Duration::from_millis(20),
    }
}

/// Connects a manager to `cluster` and builds the operations layer on it.
pub async fn connected(cluster: &Arc<MemoryCluster>) -> Arc<QueueOperations> {
    let manager = ConnectionManager::new(cluster.connector(), settings());
    manager.connect().await.unwrap();
    QueueOperations::new(manager)
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Envelopes seen by a handler, in arrival order.
pub type Seen = Arc<Mutex<Vec<MessageEnvelope>>>;

/// Handler recording every envelope it receives.
pub fn recorder() -> (Seen, Arc<dyn ConsumerHandler>) {
    let seen: Seen = Arc::default();
    let sink = seen.clone();

    let handler = move |envelope: MessageEnvelope| {
        let sink = sink.clone();
        async move {
            sink.lock().push(envelope);
            Ok::<(), HandlerError>(())
        }
    };

    (seen, Arc::new(handler))
}

#[derive(Clone)]
struct StoredMessage {
    seq: u64,
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Clone, PartialEq)]
struct QueueConfig {
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    arguments: HeaderTable,
}

struct Consumer {
    tag: String,
    session: u64,
    prefetch: u16,
    no_ack: bool,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    session: u64,
    consumer: String,
    message: StoredMessage,
}

struct QueueState {
    config: QueueConfig,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

impl QueueState {
    fn ttl(&self) -> Option<u64> {
        self.config
            .arguments
            .get(AMQP_HEADERS_MESSAGE_TTL)
            .and_then(HeaderValue::as_i64)
            .map(|ttl| ttl.max(0) as u64)
    }

    fn is_priority(&self) -> bool {
        self.config.arguments.contains_key(AMQP_HEADERS_MAX_PRIORITY)
    }

    fn dead_letter_target(&self) -> Option<(String, Option<String>)> {
        let exchange = self
            .config
            .arguments
            .get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)?
            .as_str()?
            .to_owned();
        let key = self
            .config
            .arguments
            .get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            .and_then(HeaderValue::as_str)
            .map(str::to_owned);

        Some((exchange, key))
    }

    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_owned(),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    /// Index of the next message to hand out: the earliest one of the
    /// highest priority on priority queues, the head otherwise.
    fn next_position(&self) -> usize {
        if !self.is_priority() {
            return 0;
        }

        let mut best = 0;
        let mut best_priority = None;
        for (idx, message) in self.ready.iter().enumerate() {
            let priority = message.properties.priority.unwrap_or_default();
            if best_priority.map_or(true, |p| priority > p) {
                best = idx;
                best_priority = Some(priority);
            }
        }
        best
    }
}

struct SessionState {
    alive: bool,
    prefetch: u16,
    events: ConnectionEvents,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    sessions: HashMap<u64, SessionState>,
    delayed_plugin: bool,
    unreachable: bool,
    seq: u64,
    connects: usize,
}

enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

/// Shared broker state; every connector and session points at one cluster.
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Arc<MemoryCluster> {
        Arc::new(MemoryCluster {
            state: Mutex::new(State::default()),
        })
    }

    /// A cluster with the delayed message exchange plugin enabled.
    pub fn with_delayed_plugin() -> Arc<MemoryCluster> {
        let cluster = MemoryCluster::new();
        cluster.state.lock().delayed_plugin = true;
        cluster
    }

    pub fn connector(self: &Arc<Self>) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            cluster: self.clone(),
        })
    }

    /// Makes new connection attempts fail or succeed.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Number of connection attempts, successful or not.
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.values().filter(|s| s.alive).count()
    }

    /// Drops every open connection as a network failure would.
    pub fn kill_connections(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.alive)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            self.drop_session(&mut state, id);
            if let Some(session) = state.sessions.get(&id) {
                session.events.emit(ConnectionEventKind::ConnectionClosed);
            }
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state
            .lock()
            .exchanges
            .get(name)
            .map(|def| def.exchange_kind().clone())
    }

    pub fn queue_arguments(&self, name: &str) -> Option<HeaderTable> {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|q| q.config.arguments.clone())
    }

    pub fn ready_count(&self, name: &str) -> usize {
        self.state.lock().queues.get(name).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, name: &str) -> usize {
        self.state.lock().queues.get(name).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.state.lock().queues.get(name).map_or(0, |q| q.consumers.len())
    }

    /// Envelopes waiting in the queue, in queue order.
    pub fn ready_envelopes(&self, name: &str) -> Vec<MessageEnvelope> {
        self.state.lock().queues.get(name).map_or_else(Vec::new, |q| {
            q.ready
                .iter()
                .filter_map(|m| MessageEnvelope::decode(&m.body).ok())
                .collect()
        })
    }

    /// `(exchange, routing key)` pairs bound to the queue.
    pub fn bindings_of(&self, queue: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue_name() == queue)
            .map(|b| (b.exchange_name().to_owned(), b.key().to_owned()))
            .collect()
    }

    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }

    /// Enqueues a raw frame through the default exchange.
    pub fn inject(self: &Arc<Self>, queue: &str, body: &[u8]) {
        let mut state = self.state.lock();
        let message = StoredMessage {
            seq: 0,
            exchange: String::new(),
            routing_key: queue.to_owned(),
            properties: MessageProperties::default(),
            body: body.to_vec(),
            redelivered: false,
        };
        self.deliver(&mut state, "", queue, message);
    }

    fn alive(state: &State, session: u64) -> bool {
        state.sessions.get(&session).is_some_and(|s| s.alive)
    }

    fn route(state: &State, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return if state.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            };
        }

        let Some(def) = state.exchanges.get(exchange) else {
            return vec![];
        };

        let kind = match def.exchange_kind() {
            ExchangeKind::XMessageDelayed => match def
                .arguments()
                .get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)
                .and_then(HeaderValue::as_str)
            {
                Some("fanout") => ExchangeKind::Fanout,
                Some("topic") => ExchangeKind::Topic,
                _ => ExchangeKind::Direct,
            },
            kind => kind.clone(),
        };

        let mut targets: Vec<String> = vec![];
        for binding in state.bindings.iter().filter(|b| b.exchange_name() == exchange) {
            let hit = match kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(binding.key(), routing_key),
                ExchangeKind::Direct => binding.key() == routing_key,
                _ => false,
            };

            if hit && !targets.iter().any(|t| t == binding.queue_name()) {
                targets.push(binding.queue_name().to_owned());
            }
        }
        targets
    }

    fn publish_into(self: &Arc<Self>, state: &mut State, exchange: &str, routing_key: &str, message: StoredMessage) {
        let delay = state
            .exchanges
            .get(exchange)
            .filter(|def| *def.exchange_kind() == ExchangeKind::XMessageDelayed)
            .and_then(|_| message.properties.headers.get(AMQP_HEADERS_DELAY))
            .and_then(HeaderValue::as_i64)
            .filter(|delay| *delay > 0);

        let Some(delay) = delay else {
            self.deliver(state, exchange, routing_key, message);
            return;
        };

        let cluster = self.clone();
        let exchange = exchange.to_owned();
        let routing_key = routing_key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            let mut state = cluster.state.lock();
            cluster.deliver(&mut state, &exchange, &routing_key, message);
        });
    }

    fn deliver(self: &Arc<Self>, state: &mut State, exchange: &str, routing_key: &str, message: StoredMessage) {
        for queue in Self::route(state, exchange, routing_key) {
            self.enqueue(state, &queue, message.clone());
        }
    }

    fn enqueue(self: &Arc<Self>, state: &mut State, queue: &str, mut message: StoredMessage) {
        state.seq += 1;
        let seq = state.seq;
        message.seq = seq;

        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };

        let ttl = match (q.ttl(), message.properties.expiration) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        q.ready.push_back(message);

        if let Some(ttl) = ttl {
            let cluster = self.clone();
            let queue = queue.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ttl)).await;
                cluster.expire(&queue, seq);
            });
        }

        self.dispatch(state, queue);
    }

    fn expire(self: &Arc<Self>, queue: &str, seq: u64) {
        let mut state = self.state.lock();
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(pos) = q.ready.iter().position(|m| m.seq == seq) else {
            return;
        };
        let Some(message) = q.ready.remove(pos) else {
            return;
        };

        self.dead_letter(&mut state, queue, message);
    }

    fn dead_letter(self: &Arc<Self>, state: &mut State, queue: &str, mut message: StoredMessage) {
        let Some((exchange, key)) = state.queues.get(queue).and_then(QueueState::dead_letter_target) else {
            return;
        };

        message.properties.expiration = None;
        message.redelivered = false;
        let routing_key = key.unwrap_or_else(|| message.routing_key.clone());
        self.deliver(state, &exchange, &routing_key, message);
    }

    fn dispatch(self: &Arc<Self>, state: &mut State, queue: &str) {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };

        while !q.ready.is_empty() && !q.consumers.is_empty() {
            let n = q.consumers.len();
            let Some(idx) = (0..n)
                .map(|i| (q.next_consumer + i) % n)
                .find(|idx| q.consumers[*idx].has_capacity())
            else {
                break;
            };
            q.next_consumer = (idx + 1) % n;

            let pos = q.next_position();
            let Some(message) = q.ready.remove(pos) else {
                break;
            };

            q.next_tag += 1;
            let tag = q.next_tag;
            let consumer = &mut q.consumers[idx];

            let acker: Box<dyn Acker> = if consumer.no_ack {
                Box::new(NoopAcker)
            } else {
                Box::new(MemoryAcker {
                    cluster: self.clone(),
                    queue: queue.to_owned(),
                    tag,
                })
            };

            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.body.clone(),
                acker,
            };

            if consumer.tx.send(Ok(delivery)).is_err() {
                q.consumers.remove(idx);
                q.next_consumer = 0;
                q.ready.push_front(message);
                continue;
            }

            if !consumer.no_ack {
                consumer.in_flight += 1;
                let unacked = Unacked {
                    session: consumer.session,
                    consumer: consumer.tag.clone(),
                    message,
                };
                q.unacked.insert(tag, unacked);
            }
        }
    }

    fn settle(self: &Arc<Self>, queue: &str, tag: u64, action: Settle) -> bool {
        let mut state = self.state.lock();

        let message = {
            let Some(q) = state.queues.get_mut(queue) else {
                return false;
            };
            let Some(entry) = q.unacked.remove(&tag) else {
                return false;
            };
            if let Some(consumer) = q
                .consumers
                .iter_mut()
                .find(|c| c.tag == entry.consumer && c.session == entry.session)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
            entry.message
        };

        match action {
            Settle::Ack => {}
            Settle::Requeue => {
                if let Some(q) = state.queues.get_mut(queue) {
                    let mut message = message;
                    message.redelivered = true;
                    q.ready.push_front(message);
                }
            }
            Settle::DeadLetter => self.dead_letter(&mut state, queue, message),
        }

        self.dispatch(&mut state, queue);
        true
    }

    /// Closes a session: its consumers go away, its unacknowledged messages
    /// are requeued and its exclusive queues are deleted.
    fn drop_session(self: &Arc<Self>, state: &mut State, session: u64) {
        if let Some(s) = state.sessions.get_mut(&session) {
            s.alive = false;
        }

        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            let Some(q) = state.queues.get_mut(&name) else {
                continue;
            };

            q.consumers.retain(|c| c.session != session);
            q.next_consumer = 0;

            let tags: Vec<u64> = q
                .unacked
                .iter()
                .filter(|(_, u)| u.session == session)
                .map(|(tag, _)| *tag)
                .collect();
            let mut requeued: Vec<StoredMessage> = tags
                .iter()
                .filter_map(|tag| q.unacked.remove(tag))
                .map(|u| u.message)
                .collect();
            requeued.sort_by_key(|m| m.seq);
            for mut message in requeued.into_iter().rev() {
                message.redelivered = true;
                q.ready.push_front(message);
            }

            if q.owner == Some(session) {
                state.queues.remove(&name);
                state.bindings.retain(|b| b.queue_name() != name);
                continue;
            }

            self.dispatch(state, &name);
        }
    }
}

pub struct MemoryConnector {
    cluster: Arc<MemoryCluster>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, prefetch: u16, events: ConnectionEvents) -> Result<Arc<dyn Broker>, AmqpError> {
        let mut state = self.cluster.state.lock();
        state.connects += 1;

        if state.unreachable {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.seq += 1;
        let id = state.seq;
        state.sessions.insert(
            id,
            SessionState {
                alive: true,
                prefetch,
                events,
            },
        );

        Ok(Arc::new(MemorySession {
            cluster: self.cluster.clone(),
            id,
            scoped: false,
        }))
    }
}

pub struct MemorySession {
    cluster: Arc<MemoryCluster>,
    id: u64,
    scoped: bool,
}

impl MemorySession {
    fn check(&self, state: &State) -> Result<(), AmqpError> {
        if MemoryCluster::alive(state, self.id) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel closed".to_owned()))
        }
    }

    /// A missing queue closes the channel the lookup was issued on. For the
    /// operational channel that takes the session down with it.
    fn queue_not_found(&self, state: &mut State, queue: &str) -> AmqpError {
        if !self.scoped {
            self.cluster.drop_session(state, self.id);
            if let Some(session) = state.sessions.get(&self.id) {
                session.events.emit(ConnectionEventKind::ChannelError(format!(
                    "NOT_FOUND - no queue '{queue}'"
                )));
            }
        }

        AmqpError::QueueNotFound(queue.to_owned())
    }
}

#[async_trait]
impl Broker for MemorySession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.cluster.state.lock();
        self.check(&state)?;

        if *def.exchange_kind() == ExchangeKind::XMessageDelayed && !state.delayed_plugin {
            self.cluster.drop_session(&mut state, self.id);
            if let Some(session) = state.sessions.get(&self.id) {
                session.events.emit(ConnectionEventKind::ConnectionError(
                    "COMMAND_INVALID - unknown exchange type".to_owned(),
                ));
            }
            return Err(AmqpError::ConnectionError(
                "COMMAND_INVALID - unknown exchange type 'x-delayed-message'".to_owned(),
            ));
        }

        if let Some(existing) = state.exchanges.get(def.name()) {
            let equivalent = def.is_passive()
                || (existing.exchange_kind() == def.exchange_kind()
                    && existing.is_durable() == def.is_durable()
                    && existing.is_auto_delete() == def.is_auto_delete()
                    && existing.is_internal() == def.is_internal()
                    && existing.arguments() == def.arguments());

            return if equivalent {
                Ok(())
            } else {
                Err(AmqpError::TopologyConflict(
                    def.name().to_owned(),
                    "inequivalent arg".to_owned(),
                ))
            };
        }

        if def.is_passive() {
            return Err(AmqpError::ChannelError(format!(
                "NOT_FOUND - no exchange '{}'",
                def.name()
            )));
        }

        state.exchanges.insert(def.name().to_owned(), def.clone());
        Ok(())
    }

    async fn delete_exchange(&self, name: &str, _if_unused: bool) -> Result<(), AmqpError> {
        let mut state = self.cluster.state.lock();
        self.check(&state)?;

        state.exchanges.remove(name);
        state.bindings.retain(|b| b.exchange_name() != name);
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        let mut state = self.cluster.state.lock();
        self.check(&state)?;

        let name = if def.name().is_empty() {
            state.seq += 1;
            format!("amq.gen-{}", state.seq)
        } else {
            def.name().to_owned()
        };

        let config = QueueConfig {
            durable: def.is_durable(),
            exclusive: def.is_exclusive(),
            auto_delete: def.is_auto_delete(),
            arguments: def.arguments(),
        };

        if let Some(existing) = state.queues.get(&name) {
            if !def.is_passive() && existing.config != config {
                return Err(AmqpError::TopologyConflict(name, "inequivalent arg".to_owned()));
            }
            return Ok(existing.info(&name));
        }

        if def.is_passive() {
            return Err(self.queue_not_found(&mut state, &name));
        }

        let queue = QueueState {
            owner: config.exclusive.then_some(self.id),
            config,
            ready: VecDeque::new(),
            consumers: vec![],
            next_consumer: 0,
            next_tag: 0,
            unacked: HashMap::new(),
        };
        let info = queue.info(&name);
        state.queues.insert(name, queue);

        Ok(info)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.cluster.state.lock();
        self.check(&state)?;

        if !state.exchanges.contains_key(binding.exchange_name()) || !state.queues.contains_key(binding.queue_name()) {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.cluster.state.lock();
        self.check(&state)?;

        state.bindings.retain(|b| b != binding);
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let mut state = self.cluster.state.lock();
        self.check(&state)?;

        if !state.queues.contains_key(name) {
            return Err(self.queue_not_found(&mut state, name));
        }

        let q = state
            .queues
            .get_mut(name)
            .ok_or_else(|| AmqpError::QueueNotFound(name.to_owned()))?;
        let purged = q.ready.len() as u32;
        q.ready.clear();

        Ok(purged)
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let mut state = self.cluster.state.lock();
        self.check(&state)?;

        let deleted = state.queues.remove(name).map_or(0, |q| q.ready.len() as u32);
        state.bindings.retain(|b| b.queue_name() != name);

        Ok(deleted)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool, AmqpError> {
        let mut state = self.cluster.state.lock();
        self.check(&state)?;

        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::ChannelError(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }

        let message = StoredMessage {
            seq: 0,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            body,
            redelivered: false,
        };
        self.cluster.publish_into(&mut state, exchange, routing_key, message);

        Ok(true)
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), AmqpError> {
        let mut state = self.cluster.state.lock();
        self.check(&state)?;

        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.prefetch = prefetch;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, settings: &ConsumerSettings) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.cluster.state.lock();
        self.check(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(self.queue_not_found(&mut state, queue));
        }

        let session_prefetch = state.sessions.get(&self.id).map_or(0, |s| s.prefetch);
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::QueueNotFound(queue.to_owned()))?;

        if q.consumers.iter().any(|c| c.tag == settings.tag && c.session == self.id) {
            return Err(AmqpError::BindingConsumerError(settings.tag.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(Consumer {
            tag: settings.tag.clone(),
            session: self.id,
            prefetch: settings.prefetch.unwrap_or(session_prefetch),
            no_ack: settings.no_ack,
            in_flight: 0,
            tx,
        });
        self.cluster.dispatch(&mut state, queue);

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|d| (d, rx)) }).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.cluster.state.lock();

        for q in state.queues.values_mut() {
            q.consumers
                .retain(|c| !(c.tag == consumer_tag && c.session == self.id));
            q.next_consumer = 0;
        }
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<dyn Broker>, AmqpError> {
        let state = self.cluster.state.lock();
        self.check(&state)?;

        Ok(Arc::new(MemorySession {
            cluster: self.cluster.clone(),
            id: self.id,
            scoped: true,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.scoped {
            return Ok(());
        }

        let mut state = self.cluster.state.lock();
        if MemoryCluster::alive(&state, self.id) {
            self.cluster.drop_session(&mut state, self.id);
        }
        Ok(())
    }
}

struct MemoryAcker {
    cluster: Arc<MemoryCluster>,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.cluster
            .settle(&self.queue, self.tag, Settle::Ack)
            .then_some(())
            .ok_or(AmqpError::AckMessageError)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let action = if requeue { Settle::Requeue } else { Settle::DeadLetter };
        self.cluster
            .settle(&self.queue, self.tag, action)
            .then_some(())
            .ok_or(AmqpError::NackMessageError)
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        let action = if requeue { Settle::Requeue } else { Settle::DeadLetter };
        self.cluster
            .settle(&self.queue, self.tag, action)
            .then_some(())
            .ok_or(AmqpError::RejectMessageError)
    }
}
