// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module holds the handler contracts and the processing of a single
//! delivery. In automatic mode the delivery is decoded, handed to a
//! [`ConsumerHandler`] and settled according to the result. In manual mode a
//! [`ManualConsumerHandler`] additionally receives an [`AckHandle`] and
//! decides the outcome itself.
//!
//! A frame that does not decode into an envelope is rejected without requeue
//! in both modes: redelivering a corrupt frame cannot fix it.

use crate::{
    broker::{Acker, Delivery},
    envelope::MessageEnvelope,
    errors::{AmqpError, HandlerError},
    otel,
};
use async_trait::async_trait;
use opentelemetry::trace::{Span, Status};
use parking_lot::Mutex;
use std::{borrow::Cow, future::Future, sync::Arc};
use tracing::{debug, error, warn};

/// Processes decoded envelopes in automatic acknowledgment mode.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, envelope: &MessageEnvelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> ConsumerHandler for F
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, envelope: &MessageEnvelope) -> Result<(), HandlerError> {
        (self)(envelope.clone()).await
    }
}

/// Processes decoded envelopes in manual acknowledgment mode.
///
/// Exactly one of [`AckHandle::ack`], [`AckHandle::nack`] or
/// [`AckHandle::reject`] must be called per message; a message settled by
/// nobody keeps its prefetch slot forever. Returning an error without
/// settling the handle nacks the message with requeue.
#[async_trait]
pub trait ManualConsumerHandler: Send + Sync {
    async fn exec(&self, envelope: &MessageEnvelope, ack: AckHandle) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> ManualConsumerHandler for F
where
    F: Fn(MessageEnvelope, AckHandle) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, envelope: &MessageEnvelope, ack: AckHandle) -> Result<(), HandlerError> {
        (self)(envelope.clone(), ack).await
    }
}

/// Terminal action for a failed handler in automatic mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureAction {
    /// Negative-acknowledge with requeue.
    #[default]
    Requeue,
    /// Negative-acknowledge without requeue, dead-lettering when configured.
    Reject,
    /// Log the failure and acknowledge.
    Discard,
}

/// Per-message settlement capability.
///
/// Cloning shares the underlying delivery; only the first settlement reaches
/// the broker, later ones fail with [`AmqpError::AlreadySettled`].
#[derive(Clone)]
pub struct AckHandle {
    acker: Arc<Mutex<Option<Box<dyn Acker>>>>,
}

impl AckHandle {
    pub(crate) fn new(acker: Box<dyn Acker>) -> AckHandle {
        AckHandle {
            acker: Arc::new(Mutex::new(Some(acker))),
        }
    }

    fn take(&self) -> Result<Box<dyn Acker>, AmqpError> {
        self.acker.lock().take().ok_or(AmqpError::AlreadySettled)
    }

    /// Removes the message from the broker.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.take()?.ack().await
    }

    /// Returns the message to the queue when `requeue` is set.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.take()?.nack(requeue).await
    }

    /// Rejects the message; without requeue it goes to the dead-letter
    /// exchange of its queue, if any.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.take()?.reject(requeue).await
    }

    /// Whether the delivery was already acknowledged, rejected or nacked.
    pub fn is_settled(&self) -> bool {
        self.acker.lock().is_none()
    }
}

/// How deliveries of one consumer are processed.
#[derive(Clone)]
pub(crate) enum Dispatch {
    Auto {
        handler: Arc<dyn ConsumerHandler>,
        on_failure: FailureAction,
    },
    Manual {
        handler: Arc<dyn ManualConsumerHandler>,
    },
}

/// Processes one delivery end to end.
pub(crate) async fn consume(queue: &str, delivery: Delivery, dispatch: &Dispatch) -> Result<(), AmqpError> {
    let tracer = otel::consumer_tracer();
    let (_ctx, mut span) = otel::new_span(&delivery.properties.headers, &tracer, queue);

    debug!(
        queue,
        exchange = delivery.exchange.as_str(),
        routing_key = delivery.routing_key.as_str(),
        redelivered = delivery.redelivered,
        "received message"
    );

    let Delivery { data, acker, .. } = delivery;

    let envelope = match MessageEnvelope::decode(&data) {
        Ok(envelope) => envelope,
        Err(err) => {
            error!(error = err.to_string(), queue, "removing malformed message from queue");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("malformed envelope"),
            });
            return acker.reject(false).await;
        }
    };

    match dispatch {
        Dispatch::Auto {
            handler,
            on_failure,
        } => {
            let result = handler.exec(&envelope).await;
            settle(queue, &envelope, acker, result, *on_failure, &mut span).await
        }
        Dispatch::Manual { handler } => {
            let ack = AckHandle::new(acker);
            let result = handler.exec(&envelope, ack.clone()).await;

            match result {
                Ok(_) => {
                    if !ack.is_settled() {
                        warn!(
                            queue,
                            id = envelope.id.as_str(),
                            "handler returned without settling the message"
                        );
                    }
                    span.set_status(Status::Ok);
                    Ok(())
                }
                Err(err) => {
                    span.record_error(err.as_ref());
                    span.set_status(Status::Error {
                        description: Cow::from("handler failure"),
                    });

                    if ack.is_settled() {
                        warn!(error = err.to_string(), queue, "handler failed after settling");
                        return Ok(());
                    }

                    warn!(error = err.to_string(), queue, "handler failed, requeuing");
                    ack.nack(true).await
                }
            }
        }
    }
}

async fn settle(
    queue: &str,
    envelope: &MessageEnvelope,
    acker: Box<dyn Acker>,
    result: Result<(), HandlerError>,
    on_failure: FailureAction,
    span: &mut impl Span,
) -> Result<(), AmqpError> {
    let err = match result {
        Ok(_) => {
            debug!(queue, id = envelope.id.as_str(), "message successfully processed");
            span.set_status(Status::Ok);
            return acker.ack().await.inspect_err(|_| error!("error whiling ack msg"));
        }
        Err(err) => err,
    };

    span.record_error(err.as_ref());
    span.set_status(Status::Error {
        description: Cow::from("handler failure"),
    });

    match on_failure {
        FailureAction::Requeue => {
            warn!(error = err.to_string(), queue, "error whiling handling msg, requeuing");
            acker
                .nack(true)
                .await
                .inspect_err(|_| error!("error whiling requeuing"))
        }
        FailureAction::Reject => {
            warn!(error = err.to_string(), queue, "error whiling handling msg, rejecting");
            acker
                .nack(false)
                .await
                .inspect_err(|_| error!("error whiling nack msg"))
        }
        FailureAction::Discard => {
            error!(
                error = err.to_string(),
                queue,
                id = envelope.id.as_str(),
                "handler failed, discarding message"
            );
            acker.ack().await.inspect_err(|_| error!("error whiling ack msg"))
        }
    }
}
