//! Redis Streams event log adapter.
//!
//! On-wire layout (a compatibility surface -- other tooling reads these
//! keys directly):
//!
//! ```text
//! es:stream/<app>:<aggregate>:<id>   per-aggregate stream; entry ids are
//!                                    the assigned versions ("<base>-<batch>")
//! es:stream/all-events               global fan-out, Redis-generated ids
//! es:meta/<app>:<aggregate>:<id>     JSON {current_version, last_txn_id}
//! es:snapshot/<app>:<aggregate>:<id> JSON snapshot blob
//! ```
//!
//! Each stream entry is a two-field map: `meta` -> `{ts, version}` and
//! `event` -> `{type, data}`, both JSON blobs. Appends go through a
//! `WATCH`/`MULTI`/`EXEC` transaction on the metadata key, which is what
//! enforces optimistic concurrency. Subscriptions are Redis consumer
//! groups named after the subscriber, drained by a bounded pool of
//! polling workers.
//!
//! Exclusive `XRANGE` bounds are used for reads, so Redis 6.2 or newer is
//! required.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId as StreamEntry, StreamRangeReply, StreamReadOptions, StreamReadReply};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::{EventMeta, PendingEvent, RecordedEvent, StreamId, Version, now_millis};
use crate::log::{EventLog, Snapshot, StartFrom, SubscribeOptions, SubscriptionHandler};

/// Key prefix for per-aggregate streams (and the fan-out stream).
const STREAM_PREFIX: &str = "es:stream/";
/// The global fan-out stream every append also writes to.
const ALL_EVENTS_KEY: &str = "es:stream/all-events";
/// Key prefix for per-stream `{current_version, last_txn_id}` records.
const META_PREFIX: &str = "es:meta/";
/// Key prefix for snapshot blobs.
const SNAPSHOT_PREFIX: &str = "es:snapshot/";

/// Connection and worker settings for [`RedisLog`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection spec, e.g. `redis://127.0.0.1:6379/0`.
    pub spec: String,
    /// Upper bound on concurrently polling subscription workers.
    pub workers: usize,
    /// Delay before a subscription's first poll.
    pub initial_delay: Duration,
    /// Delay between polls of one subscription.
    pub poll_interval: Duration,
}

impl RedisConfig {
    /// Settings for the given connection spec with default worker knobs.
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            workers: 10,
            initial_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1:6379")
    }
}

/// Per-stream metadata persisted at `es:meta/<stream>`: the optimistic
/// concurrency anchor and the duplicate-append suppressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StreamMeta {
    current_version: Version,
    last_txn_id: Option<String>,
}

impl Default for StreamMeta {
    fn default() -> Self {
        Self {
            current_version: Version::initial(),
            last_txn_id: None,
        }
    }
}

/// A Redis-Streams-backed [`EventLog`].
pub struct RedisLog {
    client: redis::Client,
    /// Shared connection for reads, snapshots, and subscription polls.
    conn: MultiplexedConnection,
    config: RedisConfig,
    /// Bounds how many subscription workers poll at once.
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisLog {
    /// Connect to Redis and prepare the worker pool.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.spec.as_str()).map_err(Error::backend)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(Error::backend)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            conn,
            permits: Arc::new(Semaphore::new(config.workers)),
            config,
            shutdown,
            workers: Mutex::new(Vec::new()),
        })
    }

    fn stream_key(stream: &StreamId) -> String {
        format!("{STREAM_PREFIX}{stream}")
    }

    fn meta_key(stream: &StreamId) -> String {
        format!("{META_PREFIX}{stream}")
    }

    fn snapshot_key(stream: &StreamId) -> String {
        format!("{SNAPSHOT_PREFIX}{stream}")
    }

    /// Re-read the batch recorded by the append that set `current`. Used
    /// to answer an idempotent replay with the original result.
    async fn last_batch(&self, stream_key: &str, current: Version) -> Result<Vec<RecordedEvent>> {
        if current.is_initial() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        // "<base>" alone covers every batch index within that append.
        let base = current.base.to_string();
        let reply: StreamRangeReply = conn
            .xrange(stream_key, &base, &base)
            .await
            .map_err(Error::backend)?;
        reply.ids.iter().map(decode_entry).collect()
    }
}

impl std::fmt::Debug for RedisLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLog")
            .field("spec", &self.config.spec)
            .field("workers", &self.config.workers)
            .finish()
    }
}

/// Encode one recorded event into the two stream-entry fields.
fn encode_entry(event: &RecordedEvent) -> Result<(String, String)> {
    let meta = serde_json::to_string(&event.meta).map_err(Error::backend)?;
    let payload = serde_json::to_string(&PendingEvent {
        event_type: event.event_type.clone(),
        data: event.data.clone(),
    })
    .map_err(Error::backend)?;
    Ok((meta, payload))
}

/// Decode a stream entry's `meta` + `event` fields back into an event.
fn decode_entry(entry: &StreamEntry) -> Result<RecordedEvent> {
    let meta: String = entry
        .get("meta")
        .ok_or_else(|| Error::backend(format!("stream entry {} has no meta field", entry.id)))?;
    let payload: String = entry
        .get("event")
        .ok_or_else(|| Error::backend(format!("stream entry {} has no event field", entry.id)))?;
    let meta: EventMeta = serde_json::from_str(&meta).map_err(Error::backend)?;
    let payload: PendingEvent = serde_json::from_str(&payload).map_err(Error::backend)?;
    Ok(RecordedEvent {
        event_type: payload.event_type,
        data: payload.data,
        meta,
    })
}

/// One poll of a consumer group: drain un-acked entries, then new ones,
/// invoking the handler and acking each entry.
async fn poll_group(
    conn: &mut MultiplexedConnection,
    source_key: &str,
    group: &str,
    consumer: &str,
    handler: &SubscriptionHandler,
) -> Result<()> {
    // "0" re-reads entries delivered to this consumer but never acked
    // (interrupted by a crash or restart); ">" fetches new entries.
    for cursor in ["0", ">"] {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(64);
        let reply: StreamReadReply = conn
            .xread_options(&[source_key], &[cursor], &options)
            .await
            .map_err(Error::backend)?;

        for key in reply.keys {
            for entry in key.ids {
                match decode_entry(&entry) {
                    Ok(event) => {
                        if let Err(error) = handler.as_ref()(&event) {
                            tracing::error!(
                                group = %group,
                                entry = %entry.id,
                                event_type = %event.event_type,
                                error = %error,
                                "subscription handler failed; acknowledging anyway"
                            );
                        }
                    }
                    Err(error) => {
                        tracing::error!(
                            group = %group,
                            entry = %entry.id,
                            error = %error,
                            "undecodable stream entry; acknowledging"
                        );
                    }
                }
                let _: () = conn
                    .xack(source_key, group, &[&entry.id])
                    .await
                    .map_err(Error::backend)?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl EventLog for RedisLog {
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
        let stream_key = Self::stream_key(stream);
        let meta_key = Self::meta_key(stream);

        // WATCH state is connection-local, so the transaction needs a
        // connection of its own rather than the shared handle.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(Error::backend)?;

        let _: () = redis::cmd("WATCH")
            .arg(&meta_key)
            .query_async(&mut conn)
            .await
            .map_err(Error::backend)?;
        let raw: Option<String> = conn.get(&meta_key).await.map_err(Error::backend)?;
        let meta = match raw {
            Some(json) => serde_json::from_str::<StreamMeta>(&json).map_err(Error::backend)?,
            None => StreamMeta::default(),
        };

        if meta.last_txn_id.as_deref() == Some(txn_id) {
            // Transport-level replay of an append already recorded.
            let _: () = redis::cmd("UNWATCH")
                .query_async(&mut conn)
                .await
                .map_err(Error::backend)?;
            return self.last_batch(&stream_key, meta.current_version).await;
        }
        if meta.current_version != expected {
            let _: () = redis::cmd("UNWATCH")
                .query_async(&mut conn)
                .await
                .map_err(Error::backend)?;
            return Err(Error::Concurrency {
                stream: stream.to_string(),
            });
        }

        let ts = now_millis();
        let recorded: Vec<RecordedEvent> = events
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
            .collect();
        let new_version = recorded
            .last()
            .map(|event| event.meta.version)
            .unwrap_or(expected);
        let new_meta = serde_json::to_string(&StreamMeta {
            current_version: new_version,
            last_txn_id: Some(txn_id.to_owned()),
        })
        .map_err(Error::backend)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(&meta_key, &new_meta).ignore();
        for event in &recorded {
            let (entry_meta, entry_payload) = encode_entry(event)?;
            pipe.cmd("XADD")
                .arg(&stream_key)
                .arg(event.meta.version.to_string())
                .arg("meta")
                .arg(&entry_meta)
                .arg("event")
                .arg(&entry_payload)
                .ignore();
            pipe.cmd("XADD")
                .arg(ALL_EVENTS_KEY)
                .arg("*")
                .arg("meta")
                .arg(&entry_meta)
                .arg("event")
                .arg(&entry_payload)
                .ignore();
        }
        pipe.get(&meta_key);

        // EXEC returns nil when the watched key changed under us: a
        // concurrent writer won between WATCH and EXEC.
        let exec: Option<(String,)> = pipe.query_async(&mut conn).await.map_err(Error::backend)?;
        match exec {
            None => Err(Error::Concurrency {
                stream: stream.to_string(),
            }),
            Some(_) => {
                tracing::debug!(
                    stream = %stream,
                    count = recorded.len(),
                    version = %new_version,
                    "events appended"
                );
                Ok(recorded)
            }
        }
    }

    async fn read(
        &self,
        stream: &StreamId,
        after: Version,
        limit: Option<usize>,
    ) -> Result<Vec<RecordedEvent>> {
        let stream_key = Self::stream_key(stream);
        let mut conn = self.conn.clone();
        let start = if after.is_initial() {
            "-".to_string()
        } else {
            format!("({after}")
        };
        let reply: StreamRangeReply = match limit {
            Some(count) => conn
                .xrange_count(&stream_key, &start, "+", count)
                .await
                .map_err(Error::backend)?,
            None => conn
                .xrange(&stream_key, &start, "+")
                .await
                .map_err(Error::backend)?,
        };
        reply.ids.iter().map(decode_entry).collect()
    }

    async fn subscribe(
        &self,
        subscriber: &str,
        handler: SubscriptionHandler,
        options: SubscribeOptions,
    ) -> Result<()> {
        let source_key = options
            .stream
            .as_ref()
            .map(Self::stream_key)
            .unwrap_or_else(|| ALL_EVENTS_KEY.to_owned());
        let start = match options.start_from {
            StartFrom::Latest => "$",
            StartFrom::Origin => "0",
        };

        // Create the durable group. An existing group keeps its cursor:
        // re-subscribing continues where the subscriber left off.
        let mut conn = self.conn.clone();
        let created: std::result::Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&source_key, subscriber, start)
            .await;
        match created {
            Ok(()) => {}
            Err(error) if error.code() == Some("BUSYGROUP") => {}
            Err(error) => return Err(Error::backend(error)),
        }

        let group = subscriber.to_owned();
        let consumer = format!("{subscriber}-0");
        let permits = self.permits.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut conn = self.conn.clone();
        let initial_delay = self.config.initial_delay;
        let poll_interval = self.config.poll_interval;

        let worker = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = shutdown.changed() => return,
            }
            loop {
                if *shutdown.borrow() {
                    break;
                }
                {
                    let Ok(_permit) = permits.acquire().await else {
                        break;
                    };
                    if let Err(error) =
                        poll_group(&mut conn, &source_key, &group, &consumer, &handler).await
                    {
                        // Cursor untouched: un-acked entries redeliver on
                        // the next tick.
                        tracing::warn!(
                            subscriber = %group,
                            error = %error,
                            "subscription poll failed; retrying next tick"
                        );
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!(subscriber = %group, "subscription worker stopped");
        });

        self.workers.lock().await.push(worker);
        Ok(())
    }

    async fn save_snapshot(&self, stream: &StreamId, snapshot: Snapshot) -> Result<()> {
        let blob = serde_json::to_string(&snapshot).map_err(Error::backend)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(Self::snapshot_key(stream), blob)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }

    async fn get_snapshot(&self, stream: &StreamId) -> Result<Option<Snapshot>> {
        let mut conn = self.conn.clone();
        let blob: Option<String> = conn
            .get(Self::snapshot_key(stream))
            .await
            .map_err(Error::backend)?;
        match blob {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(Error::backend)?)),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.permits.close();
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            if let Err(error) = worker.await
                && error.is_panic()
            {
                tracing::error!(error = %error, "subscription worker panicked");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    #[test]
    fn key_scheme_matches_wire_layout() {
        let stream = StreamId::new("bank", "bank-account", "a-1");
        assert_eq!(
            RedisLog::stream_key(&stream),
            "es:stream/bank:bank-account:a-1"
        );
        assert_eq!(RedisLog::meta_key(&stream), "es:meta/bank:bank-account:a-1");
        assert_eq!(
            RedisLog::snapshot_key(&stream),
            "es:snapshot/bank:bank-account:a-1"
        );
        assert_eq!(ALL_EVENTS_KEY, "es:stream/all-events");
    }

    #[test]
    fn stream_meta_defaults_to_initial_version() {
        let meta = StreamMeta::default();
        assert_eq!(meta.current_version, Version::initial());
        assert!(meta.last_txn_id.is_none());
    }

    #[test]
    fn stream_meta_json_roundtrip() {
        let meta = StreamMeta {
            current_version: Version { base: 2, batch: 0 },
            last_txn_id: Some("txn-9".into()),
        };
        let json = serde_json::to_string(&meta).expect("serialize should succeed");
        assert!(json.contains("\"2-0\""), "version is its string form: {json}");
        let back: StreamMeta = serde_json::from_str(&json).expect("parse should succeed");
        assert_eq!(back, meta);
    }

    #[test]
    fn entry_encoding_roundtrips_through_decode() {
        let event = RecordedEvent {
            event_type: "money-deposited".into(),
            data: json!({"amount": 25.17}),
            meta: EventMeta {
                ts: 1700000000000,
                version: Version { base: 3, batch: 1 },
            },
        };
        let (meta, payload) = encode_entry(&event).expect("encode should succeed");

        let mut map = HashMap::new();
        map.insert("meta".to_string(), redis::Value::BulkString(meta.into_bytes()));
        map.insert(
            "event".to_string(),
            redis::Value::BulkString(payload.into_bytes()),
        );
        let entry = StreamEntry {
            id: "3-1".to_string(),
            map,
        };

        let decoded = decode_entry(&entry).expect("decode should succeed");
        assert_eq!(decoded, event);
    }

    #[test]
    fn entry_without_fields_is_rejected() {
        let entry = StreamEntry {
            id: "1-0".to_string(),
            map: HashMap::new(),
        };
        let error = decode_entry(&entry).expect_err("empty entry should fail");
        assert!(matches!(error, Error::Backend(_)));
    }
}
