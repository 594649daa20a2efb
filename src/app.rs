//! Application lifecycle: backend construction, subscription attach, and
//! shutdown.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::event::{RecordedEvent, StreamId};
use crate::log::{EventLog, SubscribeOptions, SubscriptionHandler};
use crate::memory::MemoryLog;
use crate::redis_log::{RedisConfig, RedisLog};
use crate::registry::Registry;

/// Selects and configures the event log backend at application start.
pub enum EventStoreConfig {
    /// The Redis Streams adapter.
    Redis(RedisConfig),
    /// A fresh in-memory log (tests, embedded single-process use).
    Memory,
    /// A caller-supplied log instance, e.g. an in-memory log shared
    /// across application sessions.
    Log(Arc<dyn EventLog>),
}

impl std::fmt::Debug for EventStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStoreConfig::Redis(config) => f.debug_tuple("Redis").field(config).finish(),
            EventStoreConfig::Memory => f.write_str("Memory"),
            EventStoreConfig::Log(_) => f.write_str("Log(..)"),
        }
    }
}

/// A running application: a name and the event log it owns.
///
/// The name is the first component of every stream id the application
/// writes, so two applications with different names sharing one backend
/// never collide.
pub struct Application {
    name: String,
    log: Arc<dyn EventLog>,
}

impl Application {
    /// The application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event log owned by this application.
    pub fn log(&self) -> Arc<dyn EventLog> {
        self.log.clone()
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .finish()
    }
}

impl Registry {
    /// Construct the configured backend, attach every registered
    /// subscription, and record the running application.
    ///
    /// Fails if an application is already running: call
    /// [`stop`](Registry::stop) first. Subscriptions registered after
    /// this call take effect at the next start.
    pub async fn start(
        &self,
        name: impl Into<String>,
        config: EventStoreConfig,
    ) -> Result<Arc<Application>> {
        if self.application().is_ok() {
            return Err(Error::backend("an application is already running"));
        }

        let name = name.into();
        let log: Arc<dyn EventLog> = match config {
            EventStoreConfig::Redis(config) => Arc::new(RedisLog::connect(config).await?),
            EventStoreConfig::Memory => Arc::new(MemoryLog::new()),
            EventStoreConfig::Log(log) => log,
        };

        let app = Arc::new(Application {
            name: name.clone(),
            log,
        });
        self.attach_subscriptions(&app).await?;
        self.set_application(Some(app.clone()));
        tracing::info!(app = %name, "application started");
        Ok(app)
    }

    /// Close the running application's event log (stopping subscription
    /// workers) and clear the application pointer. A no-op when nothing
    /// is running.
    pub async fn stop(&self) -> Result<()> {
        if let Some(app) = self.set_application(None) {
            app.log.close().await?;
            tracing::info!(app = %app.name, "application stopped");
        }
        Ok(())
    }

    /// Attach every `(event, subscription)` pair to the log.
    ///
    /// The default source is the global all-events fan-out, which
    /// carries every event type; each subscription wraps the user
    /// handler in a type filter so a subscriber for event `E` only sees
    /// `E`.
    async fn attach_subscriptions(&self, app: &Application) -> Result<()> {
        for (event_name, subscription) in self.subscriptions() {
            let wanted = event_name.clone();
            let user_handler = subscription.handler.clone();
            let handler: SubscriptionHandler = Arc::new(move |event: &RecordedEvent| {
                if event.event_type != wanted {
                    return Ok(());
                }
                user_handler.as_ref()(event)
            });

            let options = SubscribeOptions {
                start_from: subscription.start_from,
                stream: subscription
                    .stream
                    .as_ref()
                    .map(|(aggregate, id)| StreamId::new(app.name(), aggregate, id)),
            };
            tracing::debug!(
                subscriber = %subscription.subscriber,
                event = %event_name,
                "attaching subscription"
            );
            app.log
                .subscribe(&subscription.subscriber, handler, options)
                .await?;
        }
        Ok(())
    }
}
