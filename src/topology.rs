// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Registration
//!
//! The application topology is a static table of [`QueueTopology`]
//! descriptors, one per (queue, exchange, routing key) triple. The
//! [`TopologyRegistrar`] groups the table by exchange, declares every
//! exchange once, then declares every queue once and binds it.
//!
//! Installation is idempotent: the broker treats identical re-declarations
//! as no-ops and duplicate triples in the table are bound only once. Tables
//! are validated before anything is declared, so descriptors sharing an
//! exchange must agree on its type and options.
//!
//! Descriptors deserialize from JSON:
//!
//! ```json
//! [{"queue": "orders", "exchange": "shop", "type": "topic", "routingKey": "order.*"}]
//! ```

use crate::{
    broker::{HeaderTable, HeaderValue},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    operations::QueueOperations,
    queue::{QueueBinding, QueueDefinition, AMQP_HEADERS_MAX_PRIORITY},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Queue flags of a topology row. Queues are durable unless stated otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Broker arguments such as `x-max-priority` or `x-message-ttl`.
    pub arguments: HeaderTable,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: HeaderTable::new(),
        }
    }
}

impl QueueOptions {
    /// Adds one broker argument.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn argument(mut self, key: &str, value: HeaderValue) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }
}

/// Exchange flags of a topology row. Exchanges are durable unless stated
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    /// Internal exchanges only receive messages from other exchanges.
    pub internal: bool,
    pub arguments: HeaderTable,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        ExchangeOptions {
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: HeaderTable::new(),
        }
    }
}

/// One row of the static topology table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTopology {
    pub queue: String,
    pub exchange: String,
    /// Exchange type, serialized as `type`.
    #[serde(rename = "type")]
    pub exchange_type: ExchangeKind,
    /// Ignored for fanout exchanges.
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub queue_options: QueueOptions,
    #[serde(default)]
    pub exchange_options: ExchangeOptions,
}

impl QueueTopology {
    /// Creates a row with durable defaults and no routing key.
    ///
    /// # Parameters
    /// * `queue` - Queue to declare and bind
    /// * `exchange` - Exchange to declare and bind to
    /// * `exchange_type` - Type of `exchange`
    ///
    /// # Returns
    /// A new row
    pub fn new(queue: &str, exchange: &str, exchange_type: ExchangeKind) -> QueueTopology {
        QueueTopology {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            exchange_type,
            routing_key: None,
            queue_options: QueueOptions::default(),
            exchange_options: ExchangeOptions::default(),
        }
    }

    /// Sets the binding routing key or pattern.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    pub fn exchange_options(mut self, options: ExchangeOptions) -> Self {
        self.exchange_options = options;
        self
    }

    /// Routing key used for the binding.
    pub fn binding_key(&self) -> &str {
        if self.exchange_type.ignores_routing_key() {
            return "";
        }

        self.routing_key.as_deref().unwrap_or_default()
    }

    /// Exchange declaration described by this row.
    pub fn exchange_definition(&self) -> ExchangeDefinition {
        let opts = &self.exchange_options;
        let mut def = ExchangeDefinition::new(&self.exchange)
            .kind(self.exchange_type.clone())
            .params(opts.arguments.clone());

        if opts.durable {
            def = def.durable();
        }
        if opts.auto_delete {
            def = def.auto_delete();
        }
        if opts.internal {
            def = def.internal();
        }

        def
    }

    /// Queue declaration described by this row.
    pub fn queue_definition(&self) -> QueueDefinition {
        let opts = &self.queue_options;
        let mut def = QueueDefinition::new(&self.queue).arguments_from(&opts.arguments);

        if opts.durable {
            def = def.durable();
        }
        if opts.exclusive {
            def = def.exclusive();
        }
        if opts.auto_delete {
            def = def.auto_delete();
        }

        def
    }

    pub fn binding(&self) -> QueueBinding {
        QueueBinding::new(&self.queue)
            .exchange(&self.exchange)
            .routing_key(self.binding_key())
    }
}

/// The table installed by the messaging client when none is supplied.
pub fn default_topology() -> Vec<QueueTopology> {
    vec![
        QueueTopology::new("work.queue.email", "work.exchange", ExchangeKind::Direct).routing_key("email"),
        QueueTopology::new("priority.queue.tasks", "priority.exchange", ExchangeKind::Direct)
            .routing_key("tasks")
            .queue_options(QueueOptions::default().argument(AMQP_HEADERS_MAX_PRIORITY, HeaderValue::Int(10))),
        QueueTopology::new(
            "fanout.queue.notifications.email",
            "fanout.exchange.notifications",
            ExchangeKind::Fanout,
        ),
        QueueTopology::new(
            "fanout.queue.notifications.sms",
            "fanout.exchange.notifications",
            ExchangeKind::Fanout,
        ),
        QueueTopology::new("topic.queue.events.user", "topic.exchange.events", ExchangeKind::Topic)
            .routing_key("user.*"),
        QueueTopology::new("topic.queue.events.all", "topic.exchange.events", ExchangeKind::Topic)
            .routing_key("#"),
    ]
}

/// Descriptors of one exchange, in table order.
#[derive(Debug)]
struct ExchangeGroup<'a> {
    exchange: &'a QueueTopology,
    members: Vec<&'a QueueTopology>,
}

/// Groups `table` by exchange, failing on descriptors that disagree about
/// the exchange they share.
fn group(table: &[QueueTopology]) -> Result<Vec<ExchangeGroup<'_>>, AmqpError> {
    let mut groups: Vec<ExchangeGroup<'_>> = vec![];
    let mut index = HashMap::<&str, usize>::new();

    for desc in table {
        let Some(&at) = index.get(desc.exchange.as_str()) else {
            index.insert(desc.exchange.as_str(), groups.len());
            groups.push(ExchangeGroup {
                exchange: desc,
                members: vec![desc],
            });
            continue;
        };

        let first = groups[at].exchange;
        if first.exchange_type != desc.exchange_type {
            return Err(AmqpError::TopologyConflict(
                desc.exchange.clone(),
                format!(
                    "declared as {} for queue {} and as {} for queue {}",
                    first.exchange_type, first.queue, desc.exchange_type, desc.queue
                ),
            ));
        }

        if first.exchange_options != desc.exchange_options {
            return Err(AmqpError::TopologyConflict(
                desc.exchange.clone(),
                format!(
                    "exchange options for queue {} differ from queue {}",
                    desc.queue, first.queue
                ),
            ));
        }

        groups[at].members.push(desc);
    }

    Ok(groups)
}

/// Snapshot of the registrar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyStatus {
    /// Whether the table has been installed.
    pub initialized: bool,
    pub queue_count: usize,
    pub exchange_count: usize,
    pub queues: Vec<String>,
    pub exchanges: Vec<String>,
}

/// Installs a static topology table on the broker.
pub struct TopologyRegistrar {
    ops: Arc<QueueOperations>,
    table: Vec<QueueTopology>,
    initialized: AtomicBool,
    installing: Mutex<()>,
}

impl TopologyRegistrar {
    /// Creates a registrar; nothing is declared until
    /// [`initialize`](TopologyRegistrar::initialize).
    ///
    /// # Parameters
    /// * `ops` - Queue operations used for every declaration
    /// * `table` - Rows to install, in order
    pub fn new(ops: Arc<QueueOperations>, table: Vec<QueueTopology>) -> TopologyRegistrar {
        TopologyRegistrar {
            ops,
            table,
            initialized: AtomicBool::new(false),
            installing: Mutex::new(()),
        }
    }

    pub fn table(&self) -> &[QueueTopology] {
        &self.table
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Installs the table once; later calls return immediately.
    pub async fn initialize(&self) -> Result<(), AmqpError> {
        let _guard = self.installing.lock().await;

        if self.is_initialized() {
            debug!("topology already initialized");
            return Ok(());
        }

        self.install().await
    }

    /// Installs the table again, e.g. after the broker lost its state.
    pub async fn reinitialize(&self) -> Result<(), AmqpError> {
        let _guard = self.installing.lock().await;

        self.initialized.store(false, Ordering::Release);
        self.install().await
    }

    async fn install(&self) -> Result<(), AmqpError> {
        let groups = group(&self.table).inspect_err(|err| {
            error!(error = err.to_string(), "invalid topology table");
        })?;

        let mut queues = HashSet::<&str>::new();
        let mut bindings = HashSet::<QueueBinding>::new();

        for group in &groups {
            let exchange = group.exchange.exchange_definition();
            debug!("creating exchange: {}", exchange.name());

            self.ops.declare_exchange(&exchange).await.inspect_err(|err| {
                error!(error = err.to_string(), name = exchange.name(), "error to declare the exchange")
            })?;

            for desc in &group.members {
                if queues.insert(&desc.queue) {
                    debug!("creating queue: {}", desc.queue);

                    self.ops
                        .declare_queue(&desc.queue_definition())
                        .await
                        .inspect_err(|err| {
                            error!(error = err.to_string(), name = desc.queue, "error to declare the queue")
                        })?;
                }

                let binding = desc.binding();
                if !bindings.insert(binding.clone()) {
                    debug!(queue = desc.queue, exchange = desc.exchange, "skipping duplicated binding");
                    continue;
                }

                self.ops
                    .bind(binding.queue_name(), binding.exchange_name(), binding.key())
                    .await
                    .inspect_err(|err| {
                        error!(error = err.to_string(), queue = desc.queue, "error to bind the queue")
                    })?;
            }
        }

        self.initialized.store(true, Ordering::Release);
        info!(
            exchanges = groups.len(),
            queues = queues.len(),
            bindings = bindings.len(),
            "topology initialized"
        );

        Ok(())
    }

    /// Unique queue names in table order.
    pub fn queue_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.table
            .iter()
            .filter(|desc| seen.insert(desc.queue.as_str()))
            .map(|desc| desc.queue.clone())
            .collect()
    }

    /// Unique exchange names in table order.
    pub fn exchange_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.table
            .iter()
            .filter(|desc| seen.insert(desc.exchange.as_str()))
            .map(|desc| desc.exchange.clone())
            .collect()
    }

    /// Names and counts of the table with the installation flag.
    pub fn status(&self) -> TopologyStatus {
        let queues = self.queue_names();
        let exchanges = self.exchange_names();

        TopologyStatus {
            initialized: self.is_initialized(),
            queue_count: queues.len(),
            exchange_count: exchanges.len(),
            queues,
            exchanges,
        }
    }
}
