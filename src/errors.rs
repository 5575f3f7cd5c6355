// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! This module provides the error taxonomy shared by every layer of the crate.
//! The `AmqpError` enum groups connectivity failures, topology conflicts,
//! envelope decoding failures, validation failures raised at the call site and
//! the per-message acknowledgment failures reported by consumers.

use thiserror::Error;

/// Error returned by application message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur while talking to the broker.
///
/// Connectivity variants are retried automatically by the connection manager,
/// every other variant is surfaced to the caller that triggered it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or using the operational channel
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// No connection is currently established
    #[error("connection not ready")]
    NotReady,

    /// Re-declaring an exchange or queue with incompatible options
    #[error("topology conflict on `{0}`: {1}")]
    TopologyConflict(String, String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error deleting an exchange with the given name
    #[error("failure to delete an exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// The queue does not exist on the broker
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// Error purging or deleting a queue
    #[error("failure to manage queue `{0}`")]
    QueueManagementError(String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error removing a binding between an exchange and a queue
    #[error("failure to unbind exchange `{0}` from queue `{1}`")]
    UnbindingExchangeFromQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a payload into an envelope
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// The frame is not a valid envelope, redelivery cannot fix it
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The retry counter would exceed the configured maximum
    #[error("retry limit exceeded: attempt {0} of {1}")]
    RetryLimitExceeded(u32, u32),

    /// Priority outside of the broker supported range
    #[error("invalid priority `{0}`: expected a value between 0 and 255")]
    InvalidPriority(i64),

    /// Any other argument rejected at the call site
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Operation with no reliable broker primitive behind it
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// The ack handle was already settled
    #[error("message already settled")]
    AlreadySettled,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The consumer layer refuses new consumers while shutting down
    #[error("shutting down")]
    ShuttingDown,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error loading the configuration
    #[error("failure to load configuration: {0}")]
    ConfigError(String),
}

impl AmqpError {
    /// Whether the connection manager recovers from this error on its own.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_) | AmqpError::NotReady
        )
    }

    /// Whether this error was raised synchronously at the call site.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AmqpError::InvalidPriority(_) | AmqpError::ValidationError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connectivity_errors() {
        assert!(AmqpError::NotReady.is_connectivity());
        assert!(AmqpError::ConnectionError("refused".into()).is_connectivity());
        assert!(!AmqpError::InvalidPriority(300).is_connectivity());
    }

    #[test]
    fn classifies_validation_errors() {
        assert!(AmqpError::InvalidPriority(-1).is_validation());
        assert!(AmqpError::ValidationError("past".into()).is_validation());
        assert!(!AmqpError::MalformedEnvelope("id".into()).is_validation());
    }

    #[test]
    fn renders_messages() {
        assert_eq!(
            AmqpError::InvalidPriority(256).to_string(),
            "invalid priority `256`: expected a value between 0 and 255"
        );
        assert_eq!(
            AmqpError::TopologyConflict("orders".into(), "durable".into()).to_string(),
            "topology conflict on `orders`: durable"
        );
    }
}
