//! Dispatch entry points resolved against the registry.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::event::{RecordedEvent, StreamId};
use crate::pipeline::{self, CommandScope};
use crate::registry::Registry;
use crate::rehydrate::rehydrate;

impl Registry {
    /// Execute a named command against the running application.
    ///
    /// Resolves the command config, validates `data` against the
    /// command's schema, then runs the interceptor pipeline: rehydrate
    /// the target aggregate, invoke the handler, validate the folded
    /// state, and append the events with optimistic concurrency.
    ///
    /// Blocking and synchronous from the caller's perspective: the
    /// future resolves once the append has committed (or the command
    /// turned out to be a no-op). On
    /// [`Error::Concurrency`](crate::Error::Concurrency) the typical
    /// response is to re-dispatch the same data; each attempt appends
    /// under a fresh transaction id.
    ///
    /// # Returns
    ///
    /// The recorded events with their log-assigned meta; empty when the
    /// handler emitted nothing.
    pub async fn dispatch(&self, command: &str, data: Value) -> Result<Vec<RecordedEvent>> {
        let app = self.application()?;
        let resolved = self.command(command).ok_or_else(|| Error::CommandUnknown {
            name: command.to_owned(),
        })?;

        // A missing payload behaves like an empty one, so id generation
        // has an object to write into.
        let data = match data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        resolved
            .config
            .schema
            .validate(&data)
            .map_err(|explain| Error::CommandInvalid {
                command: command.to_owned(),
                explain,
            })?;

        tracing::debug!(command, aggregate = %resolved.aggregate.name, "dispatching command");
        let scope = CommandScope::new(self, app.log(), app.name().to_owned(), resolved, data);
        let events = pipeline::run(scope).await?;
        tracing::debug!(command, events = events.len(), "command dispatched");
        Ok(events)
    }

    /// Rehydrate an aggregate instance and return the data portion of
    /// its current state.
    pub async fn get_aggregate(&self, aggregate: &str, id: &str) -> Result<Value> {
        let app = self.application()?;
        let config = self
            .aggregate(aggregate)
            .ok_or_else(|| Error::AggregateUnknown {
                name: aggregate.to_owned(),
            })?;
        let stream = StreamId::new(app.name(), &config.name, id);
        let state = rehydrate(self, &app.log(), &config, &stream).await?;
        Ok(state.data)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::app::EventStoreConfig;
    use crate::error::Error;
    use crate::event::Emit;
    use crate::registry::{AggregateConfig, CommandConfig, EventConfig, Registry};
    use crate::schema::{JsonKind, ObjectSchema};

    fn registry_with_command() -> Registry {
        let registry = Registry::new();
        registry.define_aggregate(AggregateConfig::new("counter", "counter-id"));
        registry.define_command(
            CommandConfig::new("bump", "counter", |_state, data| {
                Ok(Emit::event("bumped", json!({"counter-id": data["counter-id"]})))
            })
            .with_schema(ObjectSchema::new().optional("counter-id", JsonKind::String))
            .emits(EventConfig::new("bumped")),
        );
        registry
    }

    #[tokio::test]
    async fn dispatch_without_running_app_fails() {
        let registry = registry_with_command();
        let err = registry
            .dispatch("bump", json!({}))
            .await
            .expect_err("dispatch should fail");
        assert!(matches!(err, Error::ApplicationNotStarted));
    }

    #[tokio::test]
    async fn dispatch_unknown_command_fails() {
        let registry = registry_with_command();
        registry
            .start("test", EventStoreConfig::Memory)
            .await
            .expect("start should succeed");
        let err = registry
            .dispatch("no-such-command", json!({}))
            .await
            .expect_err("dispatch should fail");
        assert!(matches!(err, Error::CommandUnknown { name } if name == "no-such-command"));
    }

    #[tokio::test]
    async fn dispatch_invalid_input_carries_explain_data() {
        let registry = Registry::new();
        registry.define_aggregate(AggregateConfig::new("counter", "counter-id"));
        registry.define_command(
            CommandConfig::new("bump", "counter", |_state, _data| Ok(Emit::Nothing))
                .with_schema(ObjectSchema::new().required("amount", JsonKind::Number)),
        );
        registry
            .start("test", EventStoreConfig::Memory)
            .await
            .expect("start should succeed");

        let err = registry
            .dispatch("bump", json!({}))
            .await
            .expect_err("dispatch should fail");
        match err {
            Error::CommandInvalid { command, explain } => {
                assert_eq!(command, "bump");
                assert_eq!(explain[0]["field"], "amount");
            }
            other => panic!("expected CommandInvalid, got: {other}"),
        }
    }

    #[tokio::test]
    async fn null_data_is_treated_as_empty_object() {
        let registry = registry_with_command();
        registry
            .start("test", EventStoreConfig::Memory)
            .await
            .expect("start should succeed");
        let events = registry
            .dispatch("bump", serde_json::Value::Null)
            .await
            .expect("dispatch should succeed");
        assert_eq!(events.len(), 1);
        assert!(events[0].data["counter-id"].is_string());
    }

    #[tokio::test]
    async fn get_aggregate_requires_registration() {
        let registry = registry_with_command();
        registry
            .start("test", EventStoreConfig::Memory)
            .await
            .expect("start should succeed");
        let err = registry
            .get_aggregate("never-registered", "x")
            .await
            .expect_err("get_aggregate should fail");
        assert!(matches!(err, Error::AggregateUnknown { .. }));
    }

    #[tokio::test]
    async fn get_aggregate_of_empty_stream_is_null() {
        let registry = registry_with_command();
        registry
            .start("test", EventStoreConfig::Memory)
            .await
            .expect("start should succeed");
        let state = registry
            .get_aggregate("counter", "never-touched")
            .await
            .expect("get_aggregate should succeed");
        assert!(state.is_null());
    }
}
