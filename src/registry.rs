//! In-process catalogue of aggregate, command, event, and subscription
//! configurations, the per-event reducer map, and the pointer to the
//! running application.
//!
//! Tables are written during registration and read lock-free-in-spirit
//! afterwards: entries are `Arc`ed and handed out by clone, so the locks
//! are held only for map lookups.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::app::Application;
use crate::error::{Error, Result};
use crate::event::{Emit, RecordedEvent};
use crate::log::{StartFrom, SubscriptionHandler};
use crate::pipeline::Interceptor;
use crate::rehydrate::deep_merge;
use crate::schema::{Schema, Unchecked};

/// Decision function run by the command pipeline: `(state map, command
/// data)` to emitted events, or a business-rule violation payload.
///
/// Handlers must be deterministic: no I/O, no clocks. Side-effectful
/// enrichment belongs in interceptors, which place their output into the
/// state map before the handler runs.
pub type Handler = dyn Fn(&Value, &Value) -> std::result::Result<Emit, Value> + Send + Sync;

/// Folds one event into aggregate state: `(state, event data) -> state`.
pub type Reducer = dyn Fn(Value, &Value) -> Value + Send + Sync;

/// Configuration of one aggregate type.
#[derive(Clone)]
pub struct AggregateConfig {
    /// The aggregate name, also the middle component of its stream ids.
    pub name: String,
    /// Attribute used to extract the instance id from command data and
    /// resulting state.
    pub id_field: String,
    /// Schema every folded state must satisfy before an append commits.
    pub schema: Arc<dyn Schema>,
    /// Whether rehydration may start from a stored snapshot (and the
    /// pipeline writes one through after each append).
    pub snapshots: bool,
    /// Free-form documentation carried on the config.
    pub doc: Option<String>,
}

impl AggregateConfig {
    /// A new aggregate config with a pass-through schema and snapshots
    /// disabled.
    pub fn new(name: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_field: id_field.into(),
            schema: Arc::new(Unchecked),
            snapshots: false,
            doc: None,
        }
    }

    /// Set the aggregate state schema.
    pub fn with_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    /// Enable or disable snapshotting.
    pub fn with_snapshots(mut self, enabled: bool) -> Self {
        self.snapshots = enabled;
        self
    }

    /// Attach documentation.
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
}

impl std::fmt::Debug for AggregateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateConfig")
            .field("name", &self.name)
            .field("id_field", &self.id_field)
            .field("snapshots", &self.snapshots)
            .finish()
    }
}

/// Configuration of one command, including the events it may emit.
#[derive(Clone)]
pub struct CommandConfig {
    /// The command name used at dispatch.
    pub name: String,
    /// The target aggregate name.
    pub aggregate: String,
    /// Overrides the aggregate's id field when set.
    pub id_field: Option<String>,
    /// Schema the command input must satisfy before the pipeline runs.
    pub schema: Arc<dyn Schema>,
    /// User interceptors, run in declared order around the handler.
    pub interceptors: Vec<Arc<dyn Interceptor>>,
    /// Names of the events this command may emit, in declaration order.
    pub events: Vec<String>,
    pub(crate) handler: Arc<Handler>,
    pub(crate) event_configs: Vec<EventConfig>,
}

impl CommandConfig {
    /// A new command config targeting `aggregate` with the given handler.
    pub fn new<F>(name: impl Into<String>, aggregate: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Value, &Value) -> std::result::Result<Emit, Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            aggregate: aggregate.into(),
            id_field: None,
            schema: Arc::new(Unchecked),
            interceptors: Vec::new(),
            events: Vec::new(),
            handler: Arc::new(handler),
            event_configs: Vec::new(),
        }
    }

    /// Override the id field inherited from the aggregate.
    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = Some(id_field.into());
        self
    }

    /// Set the command input schema.
    pub fn with_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    /// Append a user interceptor. Interceptors `enter` in the order they
    /// were added and `leave` in reverse.
    pub fn with_interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Declare an event this command may emit. Registration inserts the
    /// event config into the registry with this command as its origin.
    pub fn emits(mut self, event: EventConfig) -> Self {
        self.events.push(event.name.clone());
        self.event_configs.push(event);
        self
    }
}

impl std::fmt::Debug for CommandConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandConfig")
            .field("name", &self.name)
            .field("aggregate", &self.aggregate)
            .field("events", &self.events)
            .finish()
    }
}

/// Configuration of one event type.
#[derive(Clone)]
pub struct EventConfig {
    /// The event name carried in stream entries.
    pub name: String,
    /// The command that emits this event; filled at registration.
    pub command: String,
    /// Schema the event data must satisfy when emitted.
    pub schema: Arc<dyn Schema>,
    pub(crate) subscriptions: HashMap<String, SubscriptionConfig>,
}

impl EventConfig {
    /// A new event config with a pass-through schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: String::new(),
            schema: Arc::new(Unchecked),
            subscriptions: HashMap::new(),
        }
    }

    /// Set the event data schema.
    pub fn with_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.schema = Arc::new(schema);
        self
    }
}

impl std::fmt::Debug for EventConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConfig")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// Configuration of one subscription: a named durable cursor plus the
/// handler events are delivered to.
#[derive(Clone)]
pub struct SubscriptionConfig {
    /// Subscriber name, used as the durable cursor id in the log.
    pub subscriber: String,
    /// Starting position for a first-time attach.
    pub start_from: StartFrom,
    /// `(aggregate, id)` source stream; `None` means the global
    /// all-events stream.
    pub stream: Option<(String, String)>,
    pub(crate) handler: SubscriptionHandler,
}

impl SubscriptionConfig {
    /// A new subscription starting from the origin of the default
    /// (all-events) stream.
    pub fn new<F>(subscriber: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&RecordedEvent) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            subscriber: subscriber.into(),
            start_from: StartFrom::Origin,
            stream: None,
            handler: Arc::new(handler),
        }
    }

    /// Start from the stream tail instead of the origin.
    pub fn from_latest(mut self) -> Self {
        self.start_from = StartFrom::Latest;
        self
    }

    /// Set the starting position explicitly.
    pub fn with_start(mut self, start_from: StartFrom) -> Self {
        self.start_from = start_from;
        self
    }

    /// Subscribe to a single aggregate instance's stream instead of the
    /// global all-events stream.
    pub fn with_stream(mut self, aggregate: impl Into<String>, id: impl Into<String>) -> Self {
        self.stream = Some((aggregate.into(), id.into()));
        self
    }
}

impl std::fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("subscriber", &self.subscriber)
            .field("start_from", &self.start_from)
            .field("stream", &self.stream)
            .finish()
    }
}

/// A command config joined with its aggregate config, as the pipeline
/// consumes it.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    /// The command's own attributes.
    pub config: Arc<CommandConfig>,
    /// The inlined target aggregate config.
    pub aggregate: Arc<AggregateConfig>,
}

impl ResolvedCommand {
    /// The effective id field: the command's override, else the
    /// aggregate's.
    pub fn id_field(&self) -> &str {
        self.config
            .id_field
            .as_deref()
            .unwrap_or(&self.aggregate.id_field)
    }
}

/// An event config joined with its originating command and aggregate.
#[derive(Debug, Clone)]
pub struct ResolvedEvent {
    /// The event's own attributes.
    pub config: Arc<EventConfig>,
    /// The inlined originating command config.
    pub command: Arc<CommandConfig>,
    /// The inlined target aggregate config.
    pub aggregate: Arc<AggregateConfig>,
}

#[derive(Default)]
struct Tables {
    aggregates: HashMap<String, Arc<AggregateConfig>>,
    commands: HashMap<String, Arc<CommandConfig>>,
    events: HashMap<String, Arc<EventConfig>>,
    reducers: HashMap<String, Arc<Reducer>>,
}

/// The configuration catalogue all upper layers read from.
///
/// Construct one, register configs, then [`start`](Registry::start) an
/// application against it. Registration is expected to finish before the
/// application starts; entries registered later only take effect at the
/// next start.
#[derive(Default)]
pub struct Registry {
    tables: RwLock<Tables>,
    app: RwLock<Option<Arc<Application>>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, Tables> {
        match self.tables.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_tables(&self) -> RwLockWriteGuard<'_, Tables> {
        match self.tables.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register an aggregate. Replaces any earlier config with the same
    /// name.
    pub fn define_aggregate(&self, config: AggregateConfig) {
        let mut tables = self.write_tables();
        tables
            .aggregates
            .insert(config.name.clone(), Arc::new(config));
    }

    /// Register a command together with the events it declares via
    /// [`CommandConfig::emits`].
    pub fn define_command(&self, mut config: CommandConfig) {
        let mut tables = self.write_tables();
        for mut event in config.event_configs.drain(..) {
            event.command = config.name.clone();
            // A re-registered event keeps subscriptions added earlier.
            if let Some(existing) = tables.events.get(&event.name) {
                event.subscriptions = existing.subscriptions.clone();
            }
            tables.events.insert(event.name.clone(), Arc::new(event));
        }
        tables.commands.insert(config.name.clone(), Arc::new(config));
    }

    /// Attach a subscription to a registered event, keyed by subscriber
    /// name.
    ///
    /// Registering the same subscriber name again replaces the handler
    /// but not the durable cursor: on attach, backends continue an
    /// existing cursor and ignore `start_from`.
    pub fn define_subscription(&self, event: &str, subscription: SubscriptionConfig) -> Result<()> {
        let mut tables = self.write_tables();
        let entry = tables
            .events
            .get_mut(event)
            .ok_or_else(|| Error::EventUnknown { name: event.into() })?;
        let mut config = (**entry).clone();
        config
            .subscriptions
            .insert(subscription.subscriber.clone(), subscription);
        *entry = Arc::new(config);
        Ok(())
    }

    /// Override the reducer for one event type. Events without an
    /// override fold through the deep-merge default.
    pub fn register_reducer<F>(&self, event: &str, reducer: F)
    where
        F: Fn(Value, &Value) -> Value + Send + Sync + 'static,
    {
        let mut tables = self.write_tables();
        tables.reducers.insert(event.into(), Arc::new(reducer));
    }

    /// Look up an aggregate config.
    pub fn aggregate(&self, name: &str) -> Option<Arc<AggregateConfig>> {
        self.read_tables().aggregates.get(name).cloned()
    }

    /// Look up a command config with its aggregate inlined.
    pub fn command(&self, name: &str) -> Option<ResolvedCommand> {
        let tables = self.read_tables();
        let config = tables.commands.get(name)?.clone();
        let aggregate = tables.aggregates.get(&config.aggregate)?.clone();
        Some(ResolvedCommand { config, aggregate })
    }

    /// Look up an event config with its originating command and
    /// aggregate inlined.
    pub fn event(&self, name: &str) -> Option<ResolvedEvent> {
        let tables = self.read_tables();
        let config = tables.events.get(name)?.clone();
        let command = tables.commands.get(&config.command)?.clone();
        let aggregate = tables.aggregates.get(&command.aggregate)?.clone();
        Some(ResolvedEvent {
            config,
            command,
            aggregate,
        })
    }

    pub(crate) fn event_config(&self, name: &str) -> Option<Arc<EventConfig>> {
        self.read_tables().events.get(name).cloned()
    }

    /// The reducer for `event`, falling back to deep merge.
    pub(crate) fn reducer(&self, event: &str) -> Arc<Reducer> {
        self.read_tables()
            .reducers
            .get(event)
            .cloned()
            .unwrap_or_else(|| Arc::new(|state, patch| deep_merge(state, patch)))
    }

    /// Every `(event name, subscription)` pair currently registered.
    pub(crate) fn subscriptions(&self) -> Vec<(String, SubscriptionConfig)> {
        let tables = self.read_tables();
        let mut pairs = Vec::new();
        for event in tables.events.values() {
            for subscription in event.subscriptions.values() {
                pairs.push((event.name.clone(), subscription.clone()));
            }
        }
        pairs
    }

    /// The running application, or [`Error::ApplicationNotStarted`].
    pub fn application(&self) -> Result<Arc<Application>> {
        let guard = match self.app.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(Error::ApplicationNotStarted)
    }

    pub(crate) fn set_application(&self, app: Option<Arc<Application>>) -> Option<Arc<Application>> {
        let mut guard = match self.app.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, app)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.read_tables();
        f.debug_struct("Registry")
            .field("aggregates", &tables.aggregates.len())
            .field("commands", &tables.commands.len())
            .field("events", &tables.events.len())
            .finish()
    }
}
