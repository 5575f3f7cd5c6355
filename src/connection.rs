// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the single logical connection and its operational channel. Every
//! other component receives an `Arc<ConnectionManager>` and asks it for the
//! active [`Broker`] each time it needs one; handles obtained before a
//! disconnect must not be reused after a reconnection.
//!
//! Unexpected close and error signals are delivered by the [`Connector`] as
//! [`ConnectionEvent`]s. A background task reacts to them by reconnecting
//! after `reconnect_delay_base * attempt`, giving up after
//! `max_reconnect_attempts`. A successful reconnect resets the counter; after
//! exhaustion the manager stays disconnected until [`ConnectionManager::connect`]
//! is called again.

use crate::{
    broker::{Broker, ConnectionEvent, ConnectionEventKind, ConnectionEvents, Connector},
    errors::AmqpError,
    queue::QueueBinding,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Tunables of the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Prefetch ceiling applied to the operational channel.
    pub prefetch: u16,
    /// Consecutive failed attempts after which reconnection gives up.
    pub max_reconnect_attempts: u32,
    /// Attempt `n` waits `n` times this delay.
    pub reconnect_delay_base: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            prefetch: 10,
            max_reconnect_attempts: 10,
            reconnect_delay_base: Duration::from_secs(1),
        }
    }
}

/// Snapshot of the connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
    /// Failed attempts since the last successful connection.
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_base_ms: u64,
    /// Reconnection gave up; an operator restart is required.
    pub exhausted: bool,
}

/// Overall verdict of a [`HealthReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Health check answer, with the reasons it is unhealthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub connected: bool,
    /// Human readable reasons, empty when healthy.
    pub errors: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Default)]
struct Inner {
    broker: Option<Arc<dyn Broker>>,
    generation: u64,
    reconnect_attempts: u32,
    closing: bool,
    exhausted: bool,
    last_error: Option<String>,
}

/// Owns the broker connection and its operational channel.
///
/// Connection losses reported by the broker trigger reconnection with a
/// linear backoff. Consumers follow the [`ready_signal`](ConnectionManager::ready_signal)
/// to re-subscribe once a new channel is up.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    inner: Mutex<Inner>,
    ready: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl ConnectionManager {
    /// Creates a disconnected manager.
    ///
    /// # Parameters
    /// * `connector` - Opens broker sessions
    /// * `settings` - Prefetch and reconnection tunables
    ///
    /// # Returns
    /// The manager, shared by every service built on it
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Arc<Self> {
        let (events, receiver) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(false);

        Arc::new(ConnectionManager {
            connector,
            settings,
            inner: Mutex::new(Inner::default()),
            ready,
            events,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Establishes the connection and its operational channel.
    ///
    /// Calling it while connected is a no-op. Calling it after reconnection
    /// gave up starts over with a fresh attempt counter.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        self.spawn_monitor();

        {
            let mut inner = self.inner.lock();
            inner.closing = false;
            inner.exhausted = false;
            inner.reconnect_attempts = 0;
            if inner.broker.is_some() {
                debug!("already connected");
                return Ok(());
            }
        }

        self.establish().await
    }

    /// Closes the channel and then the connection. Safe to call when nothing
    /// is connected.
    pub async fn disconnect(&self) -> Result<(), AmqpError> {
        let broker = {
            let mut inner = self.inner.lock();
            inner.closing = true;
            inner.broker.take()
        };
        self.ready.send_replace(false);

        let Some(broker) = broker else {
            debug!("disconnect requested while not connected");
            return Ok(());
        };

        match broker.close().await {
            Ok(_) => info!("amqp connection closed"),
            Err(err) => warn!(error = err.to_string(), "failure to close amqp connection"),
        }

        Ok(())
    }

    /// Returns the active channel or [`AmqpError::NotReady`].
    pub fn channel(&self) -> Result<Arc<dyn Broker>, AmqpError> {
        self.inner.lock().broker.clone().ok_or(AmqpError::NotReady)
    }

    /// Whether an operational channel is open right now.
    pub fn is_ready(&self) -> bool {
        self.inner.lock().broker.is_some()
    }

    /// Snapshot of the connection and reconnection counters.
    ///
    /// # Returns
    /// A [`ConnectionState`] safe to serialize into status endpoints
    pub fn state(&self) -> ConnectionState {
        let inner = self.inner.lock();
        ConnectionState {
            connected: inner.broker.is_some(),
            reconnect_attempts: inner.reconnect_attempts,
            max_reconnect_attempts: self.settings.max_reconnect_attempts,
            reconnect_delay_base_ms: self.settings.reconnect_delay_base.as_millis() as u64,
            exhausted: inner.exhausted,
        }
    }

    /// Receiver flipping to `true` on every established connection and to
    /// `false` on every loss.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Waits until a channel is available.
    pub async fn wait_channel(&self) -> Arc<dyn Broker> {
        let mut ready = self.ready_signal();
        loop {
            if let Ok(broker) = self.channel() {
                return broker;
            }

            if ready.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Opens a separate session that is not monitored nor reconnected.
    ///
    /// Used for checks that may make the broker close the connection.
    pub async fn open_detached(&self) -> Result<Arc<dyn Broker>, AmqpError> {
        self.connector
            .connect(self.settings.prefetch, ConnectionEvents::detached())
            .await
    }

    /// Changes the prefetch ceiling of the active channel.
    pub async fn set_prefetch(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel()?.set_prefetch(prefetch).await
    }

    /// Removes a binding between `exchange` and `queue`.
    pub async fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key);

        self.channel()?.unbind_queue(&binding).await
    }

    /// Healthy when connected. Otherwise the report lists why, including the
    /// last connection error and whether reconnection gave up.
    ///
    /// # Returns
    /// A [`HealthReport`] that never blocks on the broker
    pub fn health(&self) -> HealthReport {
        let inner = self.inner.lock();
        let connected = inner.broker.is_some();
        let mut errors = vec![];

        if !connected {
            errors.push("not connected to broker".to_owned());
        }

        if inner.exhausted {
            errors.push(format!(
                "reconnection gave up after {} attempts",
                self.settings.max_reconnect_attempts
            ));
        }

        if !connected {
            if let Some(err) = &inner.last_error {
                errors.push(err.clone());
            }
        }

        HealthReport {
            status: if connected {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            connected,
            errors,
        }
    }
}

impl ConnectionManager {
    fn spawn_monitor(self: &Arc<Self>) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            return;
        };

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(manager) = Weak::upgrade(&manager) else {
                    break;
                };
                manager.on_event(event).await;
            }
            debug!("connection monitor stopped");
        });
    }

    async fn establish(&self) -> Result<(), AmqpError> {
        let generation = self.inner.lock().generation + 1;
        let events = ConnectionEvents::new(generation, self.events.clone());

        debug!(generation, "creating amqp connection...");
        match self.connector.connect(self.settings.prefetch, events).await {
            Ok(broker) => {
                {
                    let mut inner = self.inner.lock();
                    inner.generation = generation;
                    inner.broker = Some(broker);
                    inner.reconnect_attempts = 0;
                    inner.exhausted = false;
                    inner.last_error = None;
                }
                self.ready.send_replace(true);
                info!(generation, "amqp connected");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                self.inner.lock().last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn on_event(&self, event: ConnectionEvent) {
        match &event.kind {
            ConnectionEventKind::Blocked(reason) => {
                warn!(reason = reason.as_str(), "amqp connection blocked by broker");
                return;
            }
            ConnectionEventKind::Unblocked => {
                info!("amqp connection unblocked");
                return;
            }
            kind => {
                let mut inner = self.inner.lock();
                if event.generation != inner.generation || inner.broker.is_none() {
                    debug!(
                        generation = event.generation,
                        "ignoring event from a previous connection"
                    );
                    return;
                }

                if inner.closing {
                    debug!("ignoring event during graceful disconnect");
                    return;
                }

                error!(event = ?kind, "amqp connection lost");
                inner.broker = None;
                inner.last_error = Some(format!("{:?}", kind));
            }
        }

        self.ready.send_replace(false);
        self.reconnect().await;
    }

    async fn reconnect(&self) {
        loop {
            let attempt = {
                let mut inner = self.inner.lock();
                if inner.closing {
                    debug!("reconnection aborted by disconnect");
                    return;
                }

                if inner.reconnect_attempts >= self.settings.max_reconnect_attempts {
                    inner.exhausted = true;
                    error!(
                        attempts = inner.reconnect_attempts,
                        "giving up reconnecting to amqp, manual restart required"
                    );
                    return;
                }

                inner.reconnect_attempts += 1;
                inner.reconnect_attempts
            };

            let delay = self.settings.reconnect_delay_base * attempt;
            warn!(attempt, delay_ms = delay.as_millis() as u64, "scheduling amqp reconnection");
            tokio::time::sleep(delay).await;

            if self.inner.lock().closing {
                return;
            }

            if self.establish().await.is_ok() {
                info!(attempt, "amqp reconnected");
                return;
            }
        }
    }
}
