// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Patterns
//!
//! Thin services built from [`QueueOperations`](crate::operations::QueueOperations)
//! only. Each pattern owns a name prefix so that two patterns reusing the same
//! logical name never collide on the broker:
//!
//! | Pattern | Queue | Exchange |
//! |---|---|---|
//! | work | `work.queue.<name>` | default exchange |
//! | priority | `priority.queue.<name>` | default exchange |
//! | delay | `delay.queue.<name>` | `delay.exchange.<name>` |
//! | fanout | `fanout.queue.<name>` | `fanout.exchange.<name>` |
//! | topic | `topic.queue.<name>` | `topic.exchange.<name>` |
//!
//! Besides their typed APIs every service implements [`QueuePattern`] so a
//! [`PatternRegistry`] can select one by [`PatternKind`] from configuration.

pub mod delay;
pub mod fanout;
pub mod priority;
pub mod topic;
pub mod work;

use crate::{
    consumer::ConsumerHandler, envelope::EnvelopeHeaders, errors::AmqpError,
    operations::ConsumerHandle,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

/// The five messaging patterns, also used as broker name prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Work,
    Priority,
    Delay,
    Fanout,
    Topic,
}

impl PatternKind {
    /// Every kind, in registry listing order.
    pub const ALL: [PatternKind; 5] = [
        PatternKind::Work,
        PatternKind::Priority,
        PatternKind::Delay,
        PatternKind::Fanout,
        PatternKind::Topic,
    ];

    /// Lowercase name, as used in configuration and broker names.
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Work => "work",
            PatternKind::Priority => "priority",
            PatternKind::Delay => "delay",
            PatternKind::Fanout => "fanout",
            PatternKind::Topic => "topic",
        }
    }

    /// Broker queue name for `name`.
    ///
    /// # Parameters
    /// * `name` - Logical name chosen by the application
    ///
    /// # Returns
    /// `<kind>.queue.<name>`
    pub fn queue_name(&self, name: &str) -> String {
        format!("{}.queue.{}", self.as_str(), name)
    }

    /// Broker exchange name for `name`, as `<kind>.exchange.<name>`.
    pub fn exchange_name(&self, name: &str) -> String {
        format!("{}.exchange.{}", self.as_str(), name)
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pattern-agnostic send parameters. Each pattern reads the fields it needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    /// Topic routing key.
    pub routing_key: Option<String>,
    /// Priority pattern only; the service default tier applies when unset.
    pub priority: Option<i64>,
    /// Delay pattern only, in milliseconds.
    pub delay_ms: Option<u64>,
    /// Extra headers merged into the envelope.
    pub headers: Option<EnvelopeHeaders>,
}

impl SendOptions {
    /// Sets the topic routing key.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Sets the priority; validated by the priority pattern on send.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the delivery delay in milliseconds.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delay_ms(mut self, delay: u64) -> Self {
        self.delay_ms = Some(delay);
        self
    }

    pub fn headers(mut self, headers: EnvelopeHeaders) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Uniform contract shared by the pattern services.
#[async_trait]
pub trait QueuePattern: Send + Sync {
    /// Kind this service is registered under.
    fn kind(&self) -> PatternKind;

    /// Declares the broker entities behind `name`.
    async fn setup(&self, name: &str) -> Result<(), AmqpError>;

    /// Publishes `payload` through the pattern.
    ///
    /// # Parameters
    /// * `name` - Logical queue or exchange name
    /// * `payload` - Message body
    /// * `opts` - Pattern specific options; fields a pattern does not use are ignored
    ///
    /// # Returns
    /// Whether the broker confirmed the message
    async fn send(&self, name: &str, payload: &Value, opts: &SendOptions) -> Result<bool, AmqpError>;

    /// Starts a consumer with the pattern's default options.
    async fn consume(&self, name: &str, handler: Arc<dyn ConsumerHandler>) -> Result<ConsumerHandle, AmqpError>;
}

/// Pattern services keyed by kind.
#[derive(Default, Clone)]
pub struct PatternRegistry {
    patterns: HashMap<PatternKind, Arc<dyn QueuePattern>>,
}

impl PatternRegistry {
    /// Empty registry.
    pub fn new() -> PatternRegistry {
        PatternRegistry::default()
    }

    /// Registers `pattern` under its own kind, replacing any previous one.
    pub fn register(mut self, pattern: Arc<dyn QueuePattern>) -> Self {
        self.patterns.insert(pattern.kind(), pattern);
        self
    }

    /// Looks up the service registered for `kind`.
    ///
    /// # Errors
    /// [`AmqpError::Unsupported`] when nothing is registered for `kind`
    pub fn get(&self, kind: PatternKind) -> Result<Arc<dyn QueuePattern>, AmqpError> {
        self.patterns
            .get(&kind)
            .cloned()
            .ok_or_else(|| AmqpError::Unsupported(format!("no {kind} pattern registered")))
    }

    /// Registered kinds in [`PatternKind::ALL`] order.
    pub fn kinds(&self) -> Vec<PatternKind> {
        PatternKind::ALL
            .into_iter()
            .filter(|kind| self.patterns.contains_key(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Noop(PatternKind);

    #[async_trait]
    impl QueuePattern for Noop {
        fn kind(&self) -> PatternKind {
            self.0
        }

        async fn setup(&self, _name: &str) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn send(&self, _name: &str, _payload: &Value, _opts: &SendOptions) -> Result<bool, AmqpError> {
            Ok(true)
        }

        async fn consume(
            &self,
            _name: &str,
            _handler: Arc<dyn ConsumerHandler>,
        ) -> Result<ConsumerHandle, AmqpError> {
            Err(AmqpError::Unsupported("noop".into()))
        }
    }

    #[test]
    fn names_carry_the_pattern_prefix() {
        assert_eq!(PatternKind::Work.queue_name("email"), "work.queue.email");
        assert_eq!(PatternKind::Priority.queue_name("email"), "priority.queue.email");
        assert_eq!(
            PatternKind::Fanout.exchange_name("notifications"),
            "fanout.exchange.notifications"
        );
    }

    #[test]
    fn kinds_deserialize_lowercase() {
        let kind: PatternKind = serde_json::from_str("\"topic\"").unwrap();
        assert_eq!(kind, PatternKind::Topic);
    }

    #[tokio::test]
    async fn registry_selects_by_kind() {
        let registry = PatternRegistry::new()
            .register(Arc::new(Noop(PatternKind::Work)))
            .register(Arc::new(Noop(PatternKind::Topic)));

        assert_eq!(registry.kinds(), vec![PatternKind::Work, PatternKind::Topic]);
        assert_eq!(registry.get(PatternKind::Topic).unwrap().kind(), PatternKind::Topic);
        assert!(registry
            .get(PatternKind::Topic)
            .unwrap()
            .send("x", &Value::Null, &SendOptions::default())
            .await
            .unwrap());
        assert!(matches!(
            registry.get(PatternKind::Delay),
            Err(AmqpError::Unsupported(_))
        ));
    }
}
