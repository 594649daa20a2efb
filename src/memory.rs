//! In-memory event log for tests and embedded single-process use.
//!
//! Implements the full [`EventLog`] contract -- optimistic concurrency,
//! transaction-id idempotency, the global all-events fan-out, and durable
//! (process-lifetime) subscriber cursors. Delivery runs on a background
//! task woken by appends, so handlers never run on the appending task and
//! may themselves dispatch commands.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::event::{EventMeta, PendingEvent, RecordedEvent, StreamId, Version, now_millis};
use crate::log::{EventLog, Snapshot, StartFrom, SubscribeOptions, SubscriptionHandler};

#[derive(Default)]
struct StreamState {
    events: Vec<RecordedEvent>,
    version: Version,
    last_txn: Option<String>,
    last_batch: Vec<RecordedEvent>,
}

struct Subscriber {
    handler: SubscriptionHandler,
    /// Index into the global log of the next event to consider.
    cursor: usize,
    /// Restricts delivery to one stream; `None` follows the fan-out.
    stream: Option<String>,
    /// Cleared by `close`; the cursor stays so a later re-subscription
    /// continues where this one left off.
    attached: bool,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    /// The all-events fan-out: `(stream id, event)` in append order.
    global: Vec<(String, RecordedEvent)>,
    snapshots: HashMap<String, Snapshot>,
    subscribers: HashMap<String, Subscriber>,
}

/// An in-memory [`EventLog`].
///
/// Cheap to clone; clones share state, so a log can be handed to several
/// application sessions in a row (events and cursors survive
/// [`close`](EventLog::close), which only detaches subscribers). Must be
/// created inside a tokio runtime.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Mutex<Inner>>,
    wake: Arc<Notify>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    /// Create an empty log and spawn its delivery task.
    pub fn new() -> Self {
        let log = Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            wake: Arc::new(Notify::new()),
        };
        tokio::spawn(delivery_loop(log.inner.clone(), log.wake.clone()));
        log
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryLog")
            .field("streams", &inner.streams.len())
            .field("events", &inner.global.len())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

/// Drains undelivered events to subscribers, one at a time, without
/// holding the state lock across a handler call.
async fn delivery_loop(inner: Arc<Mutex<Inner>>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        loop {
            // Pick one undelivered (subscriber, event) pair.
            let mut work: Option<(String, SubscriptionHandler, RecordedEvent)> = None;
            {
                let mut guard = match inner.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let state = &mut *guard;
                for (name, subscriber) in state.subscribers.iter_mut() {
                    if !subscriber.attached {
                        continue;
                    }
                    while subscriber.cursor < state.global.len() {
                        let (stream, event) = &state.global[subscriber.cursor];
                        if subscriber
                            .stream
                            .as_deref()
                            .is_some_and(|wanted| wanted != stream)
                        {
                            // Not this subscriber's stream: skip silently.
                            subscriber.cursor += 1;
                            continue;
                        }
                        work = Some((name.clone(), subscriber.handler.clone(), event.clone()));
                        break;
                    }
                    if work.is_some() {
                        break;
                    }
                }
            }

            let Some((name, handler, event)) = work else {
                break;
            };
            if let Err(error) = handler.as_ref()(&event) {
                tracing::error!(
                    subscriber = %name,
                    event_type = %event.event_type,
                    error = %error,
                    "subscription handler failed; acknowledging anyway"
                );
            }
            let mut guard = match inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(subscriber) = guard.subscribers.get_mut(&name) {
                subscriber.cursor += 1;
            }
        }
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(
        &self,
        stream: &StreamId,
        txn_id: &str,
        expected: Version,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<RecordedEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let recorded;
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let state = inner.streams.entry(stream.as_str().to_owned()).or_default();

            if state.last_txn.as_deref() == Some(txn_id) {
                // Idempotent repeat: hand back the stored batch untouched.
                return Ok(state.last_batch.clone());
            }
            if state.version != expected {
                return Err(Error::Concurrency {
                    stream: stream.to_string(),
                });
            }

            let ts = now_millis();
            recorded = events
                .into_iter()
                .enumerate()
                .map(|(batch, event)| RecordedEvent {
                    event_type: event.event_type,
                    data: event.data,
                    meta: EventMeta {
                        ts,
                        version: expected.next(batch as u64),
                    },
                })
                .collect::<Vec<_>>();

            if let Some(last) = recorded.last() {
                state.version = last.meta.version;
            }
            state.last_txn = Some(txn_id.to_owned());
            state.last_batch = recorded.clone();
            state.events.extend(recorded.iter().cloned());
            for event in &recorded {
                inner
                    .global
                    .push((stream.as_str().to_owned(), event.clone()));
            }
        }

        self.wake.notify_one();
        Ok(recorded)
    }

    async fn read(
        &self,
        stream: &StreamId,
        after: Version,
        limit: Option<usize>,
    ) -> Result<Vec<RecordedEvent>> {
        let guard = self.lock();
        let events = match guard.streams.get(stream.as_str()) {
            Some(state) => state
                .events
                .iter()
                .filter(|event| event.meta.version > after)
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(events)
    }

    async fn subscribe(
        &self,
        subscriber: &str,
        handler: SubscriptionHandler,
        options: SubscribeOptions,
    ) -> Result<()> {
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match inner.subscribers.get_mut(subscriber) {
                // Known name: replace the handler, keep the cursor.
                Some(existing) => {
                    existing.handler = handler;
                    existing.attached = true;
                }
                None => {
                    let cursor = match options.start_from {
                        StartFrom::Origin => 0,
                        StartFrom::Latest => inner.global.len(),
                    };
                    inner.subscribers.insert(
                        subscriber.to_owned(),
                        Subscriber {
                            handler,
                            cursor,
                            stream: options.stream.map(|s| s.as_str().to_owned()),
                            attached: true,
                        },
                    );
                }
            }
        }
        // Kick the delivery task in case there is backlog to replay.
        self.wake.notify_one();
        Ok(())
    }

    async fn save_snapshot(&self, stream: &StreamId, snapshot: Snapshot) -> Result<()> {
        self.lock()
            .snapshots
            .insert(stream.as_str().to_owned(), snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, stream: &StreamId) -> Result<Option<Snapshot>> {
        Ok(self.lock().snapshots.get(stream.as_str()).cloned())
    }

    async fn close(&self) -> Result<()> {
        // Detach subscribers; events, cursors, and snapshots stay so the
        // log can back another application session, with re-subscribers
        // continuing from their persisted cursors.
        for subscriber in self.lock().subscribers.values_mut() {
            subscriber.attached = false;
        }
        Ok(())
    }
}
