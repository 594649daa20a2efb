//! Runtime for building applications in the event-sourcing style.
//!
//! `eventweave` keeps a registry of **aggregates** (consistency
//! boundaries keyed by an id), **commands** (named requests to change an
//! aggregate), **events** (immutable facts appended to per-aggregate
//! streams), and **subscriptions** (background consumers with
//! at-least-once delivery). Dispatching a command rehydrates the
//! aggregate from its stream, runs the registered handler through an
//! interceptor chain, validates the folded state, and appends the
//! resulting events under optimistic concurrency control.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Registry`] | Catalogue of configs; entry point for dispatch |
//! | [`AggregateConfig`] / [`CommandConfig`] / [`EventConfig`] | Declarative registrations |
//! | [`SubscriptionConfig`] | Durable named cursor + handler |
//! | [`EventLog`] | Storage contract: OCC append, ranged read, subscribe, snapshots |
//! | [`RedisLog`] | Redis Streams backend (consumer groups, `WATCH`/`MULTI`/`EXEC`) |
//! | [`MemoryLog`] | In-memory backend for tests and embedded use |
//! | [`Interceptor`] | `enter`/`leave` pair wrapping command execution |
//! | [`Emit`] | Handler return: nothing, one event, or several |
//!
//! # Quick Start
//!
//! ```no_run
//! use eventweave::{
//!     AggregateConfig, CommandConfig, Emit, EventConfig, EventStoreConfig, Registry,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> eventweave::Result<()> {
//! let registry = Registry::new();
//! registry.define_aggregate(AggregateConfig::new("bank-account", "account-id"));
//! registry.define_command(
//!     CommandConfig::new("open-account", "bank-account", |_state, data| {
//!         Ok(Emit::event(
//!             "account-opened",
//!             json!({
//!                 "account-id": data["account-id"],
//!                 "balance": 0.0,
//!             }),
//!         ))
//!     })
//!     .emits(EventConfig::new("account-opened")),
//! );
//!
//! registry.start("accounting", EventStoreConfig::Memory).await?;
//! let events = registry.dispatch("open-account", json!({})).await?;
//! let account_id = events[0].data["account-id"].as_str().unwrap();
//! let account = registry.get_aggregate("bank-account", account_id).await?;
//! assert_eq!(account["balance"], 0.0);
//! # Ok(())
//! # }
//! ```
//!
//! Aggregate state, command data, and event payloads are
//! [`serde_json::Value`]s. State is derived by folding events through the
//! registered reducers; the default reducer is a recursive deep merge
//! (objects merge key-wise, everything else is replaced), overridable per
//! event type via [`Registry::register_reducer`].

mod app;
mod dispatch;
mod error;
mod event;
mod log;
mod memory;
mod pipeline;
mod redis_log;
mod registry;
mod rehydrate;
mod schema;

pub use app::{Application, EventStoreConfig};
pub use error::{Error, Result};
pub use event::{Emit, EventMeta, PendingEvent, RecordedEvent, StreamId, Version};
pub use log::{EventLog, Snapshot, StartFrom, SubscribeOptions, SubscriptionHandler};
pub use memory::MemoryLog;
pub use pipeline::{CommandScope, Interceptor};
pub use redis_log::{RedisConfig, RedisLog};
pub use registry::{
    AggregateConfig, CommandConfig, EventConfig, Handler, Reducer, Registry, ResolvedCommand,
    ResolvedEvent, SubscriptionConfig,
};
pub use rehydrate::{AggregateState, deep_merge};
pub use schema::{JsonKind, ObjectSchema, Schema, Unchecked};
