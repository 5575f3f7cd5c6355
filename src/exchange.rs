// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides types for defining broker exchanges. Exchanges are the
//! routing entities that receive published messages and forward them to bound
//! queues according to their kind and the message routing key.

use crate::broker::{HeaderTable, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Constant for the argument used to specify the routing kind of a delayed exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Constant for the header carrying the delivery delay understood by a delayed exchange
pub const AMQP_HEADERS_DELAY: &str = "x-delay";
/// Exchange type name registered by the delayed message plugin
pub const DELAYED_EXCHANGE_KIND: &str = "x-delayed-message";

/// Represents the types of exchanges available on the broker.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
}

impl ExchangeKind {
    /// Type name as sent in `exchange.declare`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XMessageDelayed => DELAYED_EXCHANGE_KIND,
        }
    }

    /// Whether bindings to this kind of exchange ignore the routing key.
    pub fn ignores_routing_key(&self) -> bool {
        matches!(self, ExchangeKind::Fanout | ExchangeKind::Headers)
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of an exchange with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure exchange
/// definitions. It supports the standard exchange types as well as the delayed
/// message exchange provided by the broker plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) auto_delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) params: HeaderTable,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a Direct exchange with default parameters.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Creates a delayed exchange routing like `routing` once the delay elapsed.
    ///
    /// This requires the x-delayed-message plugin to be installed on the broker.
    pub fn delayed(mut self, routing: ExchangeKind) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            HeaderValue::String(routing.as_str().to_owned()),
        );
        self
    }

    /// Sets the exchange parameters.
    pub fn params(mut self, params: HeaderTable) -> Self {
        self.params = params;
        self
    }

    /// Adds a single parameter to the exchange.
    pub fn param(mut self, key: &str, value: HeaderValue) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    /// Raw broker arguments sent with the declaration.
    pub fn arguments(&self) -> &HeaderTable {
        &self.params
    }
}
