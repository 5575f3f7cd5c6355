// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Messaging Patterns
//!
//! A messaging layer over a RabbitMQ broker offering work queues, priority
//! queues, delayed delivery, broadcast, topic routing and dead-letter retry
//! handling behind one publish/consume contract.
//!
//! The stack, from the broker up:
//!
//! - [`connection::ConnectionManager`] owns the connection, reconnecting with
//!   linear backoff
//! - [`operations::QueueOperations`] provides the broker primitives and the
//!   consumer tasks
//! - [`topology::TopologyRegistrar`] installs the static topology table
//! - [`patterns`] and [`dead_letter`] build the messaging patterns
//! - [`facade::MessagingClient`] ties everything together
//!
//! Payloads travel inside a JSON [`envelope::MessageEnvelope`].

mod otel;

pub mod broker;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod facade;
pub mod operations;
pub mod patterns;
pub mod queue;
pub mod topology;

pub use configs::RabbitMQConfigs;
pub use consumer::{AckHandle, ConsumerHandler, FailureAction, ManualConsumerHandler};
pub use envelope::{MessageEnvelope, RetryPolicy};
pub use errors::{AmqpError, HandlerError};
pub use facade::{MessagingClient, OperationResult};
