//! Consumer manager
//!
//! Routes row events to registered consumers and submits the plugin
//! invocations they request. Consumers are independent: a panic-free error
//! from one is logged and never suppresses delivery to the rest. Fan-out is
//! synchronous per event on the stream task, so consumers must be fast; they
//! express work by queueing plugin triggers, which the manager submits
//! through the broker gateway after the consumer returns.

use serde_json::{json, Map, Value};
use shared::broker::{BrokerGateway, SubmitOptions, PLUGIN_QUEUE};
use shared::config::ConsumerConfig;
use shared::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::client::{EventType, RowEvent};

/// A `(database, table, event types)` filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub database: String,
    pub table: String,
    /// Empty set means all event types
    pub event_types: HashSet<EventType>,
}

impl EventFilter {
    pub fn new(database: &str, table: &str, event_types: &[EventType]) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
            event_types: event_types.iter().copied().collect(),
        }
    }

    pub fn matches(&self, event: &RowEvent) -> bool {
        self.database == event.database
            && self.table == event.table
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
    }
}

/// A queued plugin trigger produced by a consumer
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub plugin_name: String,
    pub parameters: Map<String, Value>,
    pub priority: u8,
}

/// Collects the plugin triggers a consumer requests while processing one
/// event; the manager performs the actual submissions afterwards.
#[derive(Debug, Default)]
pub struct ConsumerContext {
    requests: Vec<TriggerRequest>,
}

impl ConsumerContext {
    /// Request a plugin invocation on the broker
    pub fn trigger_plugin(
        &mut self,
        plugin_name: &str,
        parameters: Map<String, Value>,
        priority: u8,
    ) {
        self.requests.push(TriggerRequest {
            plugin_name: plugin_name.to_string(),
            parameters,
            priority,
        });
    }
}

/// A registered CDC consumer
pub trait EventConsumer: Send + Sync {
    fn name(&self) -> &str;

    fn filters(&self) -> &[EventFilter];

    /// Handle one matching event. Requested plugin triggers are submitted by
    /// the manager after this returns; an error here is logged and isolated.
    fn process_event(&self, event: &RowEvent, ctx: &mut ConsumerContext) -> Result<()>;

    fn enabled(&self) -> bool {
        true
    }
}

/// Declarative consumer built from worker configuration: forwards matching
/// events to a fixed plugin with static parameters.
pub struct PluginTriggerConsumer {
    name: String,
    plugin_name: String,
    parameters: Map<String, Value>,
    priority: u8,
    forward_event: bool,
    enabled: bool,
    filters: Vec<EventFilter>,
}

impl PluginTriggerConsumer {
    pub fn from_config(config: &ConsumerConfig) -> Self {
        let filters = config
            .filters
            .iter()
            .map(|f| {
                let event_types: Vec<EventType> = f
                    .event_types
                    .iter()
                    .filter_map(|s| EventType::parse(s))
                    .collect();
                EventFilter::new(&f.database, &f.table, &event_types)
            })
            .collect();

        Self {
            name: config.name.clone(),
            plugin_name: config.plugin_name.clone(),
            parameters: config.parameters.clone(),
            priority: config.priority,
            forward_event: config.forward_event,
            enabled: config.enabled,
            filters,
        }
    }
}

impl EventConsumer for PluginTriggerConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn filters(&self) -> &[EventFilter] {
        &self.filters
    }

    fn process_event(&self, event: &RowEvent, ctx: &mut ConsumerContext) -> Result<()> {
        let mut parameters = self.parameters.clone();
        if self.forward_event {
            parameters.insert(
                "event".to_string(),
                json!({
                    "database": event.database,
                    "table": event.table,
                    "event_type": event.event_type.as_str(),
                    "data": event.data,
                    "timestamp": event.timestamp,
                }),
            );
        }
        ctx.trigger_plugin(&self.plugin_name, parameters, self.priority);
        Ok(())
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Fans incoming row events out to all matching consumers
pub struct ConsumerManager {
    consumers: Vec<Box<dyn EventConsumer>>,
    gateway: Arc<Mutex<BrokerGateway>>,
}

impl ConsumerManager {
    pub fn new(gateway: Arc<Mutex<BrokerGateway>>) -> Self {
        Self {
            consumers: Vec::new(),
            gateway,
        }
    }

    /// Build a manager with one declarative consumer per config entry
    pub fn from_config(configs: &[ConsumerConfig], gateway: Arc<Mutex<BrokerGateway>>) -> Self {
        let mut manager = Self::new(gateway);
        for config in configs {
            manager.register(Box::new(PluginTriggerConsumer::from_config(config)));
        }
        manager
    }

    pub fn register(&mut self, consumer: Box<dyn EventConsumer>) {
        info!(consumer = consumer.name(), "Registered CDC consumer");
        self.consumers.push(consumer);
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Deliver one event to every enabled matching consumer, in registration
    /// order, and submit the plugin triggers they queued.
    ///
    /// # Returns
    /// The number of submissions made for this event
    pub async fn dispatch(&self, event: &RowEvent) -> usize {
        let mut submitted = 0;

        for consumer in &self.consumers {
            if !consumer.enabled() {
                continue;
            }
            if !consumer.filters().iter().any(|f| f.matches(event)) {
                continue;
            }

            let mut ctx = ConsumerContext::default();
            if let Err(e) = consumer.process_event(event, &mut ctx) {
                // One consumer's failure must not starve the others
                let e = shared::SchedulerError::ConsumerError(format!("{:#}", e));
                error!(
                    consumer = consumer.name(),
                    database = %event.database,
                    table = %event.table,
                    "{}", e
                );
                continue;
            }

            for request in ctx.requests {
                let options = SubmitOptions {
                    queue: PLUGIN_QUEUE.to_string(),
                    priority: request.priority,
                    time_limit: None,
                    retries: 0,
                };
                let mut gateway = self.gateway.lock().await;
                match gateway
                    .submit(&request.plugin_name, &request.parameters, &options)
                    .await
                {
                    Ok(id) => {
                        submitted += 1;
                        debug!(
                            consumer = consumer.name(),
                            plugin = %request.plugin_name,
                            submission_id = %id,
                            "Triggered plugin from row event"
                        );
                    }
                    Err(e) => {
                        warn!(
                            consumer = consumer.name(),
                            plugin = %request.plugin_name,
                            "Failed to submit triggered plugin: {:#}", e
                        );
                    }
                }
            }
        }

        submitted
    }

    /// Consume the event stream until it closes or shutdown is signalled
    pub async fn run(
        &self,
        mut events_rx: mpsc::Receiver<RowEvent>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<()> {
        info!(
            consumers = self.consumer_count(),
            "Consumer manager starting"
        );

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.dispatch(&event).await;
                        }
                        None => {
                            info!("CDC event stream closed");
                            return Ok(());
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Consumer manager received shutdown signal");
                    return Ok(());
                }
            }
        }
    }
}
