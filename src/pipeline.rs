//! The command execution pipeline: an interceptor chain threading a
//! command scope from rehydration through the optimistic append.
//!
//! The chain is plain data: `[context, user interceptors..., handler]`.
//! `enter` runs front to back, `leave` back to front, so the built-in
//! context interceptor is the first to see the command and the last to
//! touch the log.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{EventMeta, PendingEvent, RecordedEvent, StreamId, id_string, normalize};
use crate::log::{EventLog, Snapshot};
use crate::registry::{Registry, ResolvedCommand};
use crate::rehydrate::{fold, rehydrate};

/// Mutable context threaded through the interceptor chain.
///
/// User interceptors may read and modify `data`, place enrichment into
/// `state`, and inspect the normalized `events` on the way out. The
/// built-in interceptors keep `state[aggregate]` and `meta[aggregate]`
/// for the command's target aggregate.
pub struct CommandScope<'a> {
    registry: &'a Registry,
    log: Arc<dyn EventLog>,
    app_name: String,
    command: ResolvedCommand,
    /// Command input data. The target aggregate's id field is guaranteed
    /// present after the context interceptor's enter phase (generated
    /// fresh when the caller omitted it).
    pub data: Value,
    /// State map keyed by aggregate name, plus any enrichment keys user
    /// interceptors add. This is the first handler argument.
    pub state: Value,
    /// Events produced by the handler, post-normalization.
    pub events: Vec<PendingEvent>,
    /// Rehydration meta per aggregate name.
    pub meta: HashMap<String, EventMeta>,
    aggregate_id: Option<String>,
    result: Vec<RecordedEvent>,
}

impl<'a> CommandScope<'a> {
    pub(crate) fn new(
        registry: &'a Registry,
        log: Arc<dyn EventLog>,
        app_name: String,
        command: ResolvedCommand,
        data: Value,
    ) -> Self {
        Self {
            registry,
            log,
            app_name,
            command,
            data,
            state: Value::Object(Map::new()),
            events: Vec::new(),
            meta: HashMap::new(),
            aggregate_id: None,
            result: Vec::new(),
        }
    }

    /// The registry this command resolves against.
    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// The resolved command under execution.
    pub fn command(&self) -> &ResolvedCommand {
        &self.command
    }

    /// The target aggregate's id, available once the context interceptor
    /// has entered.
    pub fn aggregate_id(&self) -> Option<&str> {
        self.aggregate_id.as_deref()
    }

    /// Rehydrate another aggregate's current data, for interceptors that
    /// enrich the state map before the handler runs.
    pub async fn fetch_aggregate(&self, aggregate: &str, id: &str) -> Result<Value> {
        let config = self
            .registry
            .aggregate(aggregate)
            .ok_or_else(|| Error::AggregateUnknown {
                name: aggregate.to_owned(),
            })?;
        let stream = StreamId::new(&self.app_name, &config.name, id);
        Ok(rehydrate(self.registry, &self.log, &config, &stream)
            .await?
            .data)
    }

    fn stream(&self, id: &str) -> StreamId {
        StreamId::new(&self.app_name, &self.command.aggregate.name, id)
    }
}

/// An `enter`/`leave` pair wrapping command execution.
///
/// Both phases default to no-ops; implement whichever is needed. Enter
/// phases run in declared order before the handler, leave phases in
/// reverse order after it. Any error aborts the pipeline and surfaces to
/// the dispatch caller.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Pre-handler phase.
    async fn enter(&self, scope: &mut CommandScope<'_>) -> Result<()> {
        let _ = scope;
        Ok(())
    }

    /// Post-handler phase.
    async fn leave(&self, scope: &mut CommandScope<'_>) -> Result<()> {
        let _ = scope;
        Ok(())
    }
}

/// Built-in head of the chain: loads aggregate state on enter, appends
/// the handler's events on leave.
struct ContextInterceptor;

#[async_trait]
impl Interceptor for ContextInterceptor {
    async fn enter(&self, scope: &mut CommandScope<'_>) -> Result<()> {
        let id_field = scope.command.id_field().to_owned();
        let existing = scope
            .data
            .get(&id_field)
            .filter(|value| !value.is_null())
            .map(id_string);
        let id = match existing {
            Some(id) => id,
            // No id in the command data: this command creates a new
            // instance. Generate the id and write it back so the handler
            // and the emitted events see the same id the stream is keyed
            // by.
            None => {
                let fresh = Uuid::new_v4().to_string();
                if let Value::Object(map) = &mut scope.data {
                    map.insert(id_field, Value::String(fresh.clone()));
                }
                fresh
            }
        };

        let aggregate = scope.command.aggregate.clone();
        let stream = scope.stream(&id);
        let current = rehydrate(scope.registry, &scope.log, &aggregate, &stream).await?;

        if let Value::Object(map) = &mut scope.state {
            map.insert(aggregate.name.clone(), current.data);
        }
        scope.meta.insert(aggregate.name.clone(), current.meta);
        scope.aggregate_id = Some(id);
        Ok(())
    }

    async fn leave(&self, scope: &mut CommandScope<'_>) -> Result<()> {
        if scope.events.is_empty() {
            // No-op command: nothing touches the log.
            scope.result = Vec::new();
            return Ok(());
        }

        let aggregate = scope.command.aggregate.clone();
        let prior = scope
            .state
            .get(&aggregate.name)
            .cloned()
            .unwrap_or(Value::Null);
        let folded = fold(scope.registry, prior, &scope.events);
        aggregate
            .schema
            .validate(&folded)
            .map_err(|explain| Error::AggregateInvalid {
                aggregate: aggregate.name.clone(),
                explain,
            })?;

        let id = scope
            .aggregate_id
            .clone()
            .ok_or_else(|| Error::backend("aggregate id missing from command scope"))?;
        let stream = scope.stream(&id);
        let expected = scope
            .meta
            .get(&aggregate.name)
            .map(|meta| meta.version)
            .unwrap_or_default();

        // Fresh per attempt: caller retries of the same command data are
        // distinct appends; only transport-level replays of this attempt
        // are deduplicated.
        let txn_id = Uuid::new_v4().to_string();
        let recorded = scope
            .log
            .append(&stream, &txn_id, expected, scope.events.clone())
            .await?;

        if aggregate.snapshots
            && let Some(last) = recorded.last()
        {
            scope
                .log
                .save_snapshot(
                    &stream,
                    Snapshot {
                        meta: last.meta.clone(),
                        data: folded,
                    },
                )
                .await?;
        }

        scope.result = recorded;
        Ok(())
    }
}

/// Built-in tail of the chain: runs the user handler and normalizes its
/// return on enter.
struct HandlerInterceptor;

#[async_trait]
impl Interceptor for HandlerInterceptor {
    async fn enter(&self, scope: &mut CommandScope<'_>) -> Result<()> {
        let handler = scope.command.config.handler.clone();
        let emit = handler.as_ref()(&scope.state, &scope.data)
            .map_err(|payload| Error::Rejected { payload })?;
        scope.events = normalize(scope.registry, &scope.command, emit)?;
        Ok(())
    }
}

/// Run the full chain for one command execution and return the appended
/// events (empty for a no-op).
pub(crate) async fn run(mut scope: CommandScope<'_>) -> Result<Vec<RecordedEvent>> {
    let mut chain: Vec<Arc<dyn Interceptor>> =
        Vec::with_capacity(scope.command.config.interceptors.len() + 2);
    chain.push(Arc::new(ContextInterceptor));
    chain.extend(scope.command.config.interceptors.iter().cloned());
    chain.push(Arc::new(HandlerInterceptor));

    for interceptor in &chain {
        interceptor.enter(&mut scope).await?;
    }
    for interceptor in chain.iter().rev() {
        interceptor.leave(&mut scope).await?;
    }
    Ok(scope.result)
}
