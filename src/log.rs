//! The abstract event log contract shared by all storage backends.
//!
//! The contract is intentionally narrow so backends other than Redis --
//! the in-memory log in this crate, a durable file log, a relational
//! table with serialized writes -- can be swapped in behind the same
//! runtime.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::event::{EventMeta, PendingEvent, RecordedEvent, StreamId, Version};

/// Where a new subscriber's cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// Deliver the full stream history before new events.
    #[default]
    Origin,
    /// Deliver only events appended after the subscription attaches.
    Latest,
}

/// Options for [`EventLog::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Starting position for a subscriber attaching for the first time.
    /// Ignored when the subscriber already has a persisted cursor.
    pub start_from: StartFrom,
    /// Source stream; `None` means the global all-events stream.
    pub stream: Option<StreamId>,
}

/// Callback invoked once per delivered event.
///
/// Delivery is at-least-once: handlers must tolerate repeats. A returned
/// error is logged and the event is acknowledged anyway -- failed events
/// are not redelivered, which keeps one poison event from wedging the
/// whole subscription.
pub type SubscriptionHandler = Arc<
    dyn Fn(&RecordedEvent) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// A point-in-time capture of aggregate state used to shortcut replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Meta of the last event folded into `data`.
    pub meta: EventMeta,
    /// The captured aggregate data.
    pub data: Value,
}

/// Persisted, ordered storage for per-aggregate event streams.
///
/// Implementations guarantee:
///
/// - Events within one stream are totally ordered, append-only, and
///   versioned `(base, batch)` per append.
/// - `append` is atomic per call: all events land, or none do.
/// - `append` enforces optimistic concurrency: the caller's
///   `expected` version must equal the stream's current version.
/// - A `(stream, txn_id)` pair is idempotent: repeating an append with
///   the same transaction id returns the previously recorded batch
///   without writing.
/// - Every appended event is also written to a global all-events stream,
///   the default subscription source.
/// - Subscriber cursors are durable per `(stream, subscriber)` and
///   advance monotonically.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// The canonical "no events yet" version.
    fn initial_version(&self) -> Version {
        Version::initial()
    }

    /// Atomically append `events` to `stream`.
    ///
    /// Returns the events with their assigned meta. Fails with
    /// [`Error::Concurrency`](crate::Error::Concurrency) when `expected`
    /// no longer matches the stream head; repeating a `txn_id` already
    /// recorded on the stream returns the stored batch unchanged.
    async fn append(
        &self,
        stream: &StreamId,
        txn_id: &str,
        expected: Version,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<RecordedEvent>>;

    /// Read events with `version > after`, in order, up to `limit`.
    async fn read(
        &self,
        stream: &StreamId,
        after: Version,
        limit: Option<usize>,
    ) -> Result<Vec<RecordedEvent>>;

    /// Register a durable subscriber cursor and start delivering events
    /// to `handler` in the background.
    ///
    /// Re-subscribing with a known `subscriber` name continues from the
    /// persisted cursor; `options.start_from` only positions first-time
    /// subscribers.
    async fn subscribe(
        &self,
        subscriber: &str,
        handler: SubscriptionHandler,
        options: SubscribeOptions,
    ) -> Result<()>;

    /// Store (overwrite) the snapshot for `stream`.
    async fn save_snapshot(&self, stream: &StreamId, snapshot: Snapshot) -> Result<()>;

    /// Fetch the snapshot for `stream`, if one was ever saved.
    async fn get_snapshot(&self, stream: &StreamId) -> Result<Option<Snapshot>>;

    /// Stop delivery workers and release backend resources. Subscribers
    /// receive no further events until a new log attaches them.
    async fn close(&self) -> Result<()>;
}
