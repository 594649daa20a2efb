//! Event envelope types: stream versions, metadata, handler-output
//! normalization, and stream identifier construction.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::registry::{Registry, ResolvedCommand};

/// Position of one event within an aggregate stream.
///
/// Rendered as `"<base>-<batch>"`: `base` increments by one per append,
/// `batch` is the zero-based index of the event within that append, so N
/// events written together share a `base` and occupy batches `0..N`. The
/// order is lexicographic on `(base, batch)`, which matches Redis stream
/// entry-id ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Append counter, starting at 1 for the first append.
    pub base: u64,
    /// Index of the event within its append.
    pub batch: u64,
}

impl Version {
    /// The canonical "no events yet" version, `"0-0"`.
    pub const fn initial() -> Self {
        Version { base: 0, batch: 0 }
    }

    /// Whether this is the initial (empty stream) version.
    pub fn is_initial(&self) -> bool {
        *self == Self::initial()
    }

    /// Version of the `batch`-th event in the append following `self`.
    pub(crate) fn next(&self, batch: u64) -> Version {
        Version {
            base: self.base + 1,
            batch,
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.batch)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::backend(format!("malformed version: {s}"));
        let (base, batch) = s.split_once('-').ok_or_else(malformed)?;
        Ok(Version {
            base: base.parse().map_err(|_| malformed())?,
            batch: batch.parse().map_err(|_| malformed())?,
        })
    }
}

// On the wire a version is always its string rendering, both in stream
// entry ids and inside serialized metadata.
impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-event metadata assigned by the event log during append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Append timestamp, milliseconds since the Unix epoch.
    pub ts: i64,
    /// The event's position in its aggregate stream.
    pub version: Version,
}

impl EventMeta {
    /// Meta of an aggregate with no events: epoch timestamp, initial version.
    pub(crate) fn origin() -> Self {
        EventMeta {
            ts: 0,
            version: Version::initial(),
        }
    }
}

/// An event produced by a handler and validated, but not yet appended.
///
/// Meta is deliberately absent: the event log assigns `{ts, version}`
/// during append so versions reflect true append order. The serialized
/// form, `{"type": ..., "data": ...}`, is also the wire payload stored
/// in stream entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// The registered event name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The event payload.
    pub data: Value,
}

/// An event as recorded in a stream, with log-assigned metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// The registered event name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The event payload.
    pub data: Value,
    /// Log-assigned timestamp and version.
    pub meta: EventMeta,
}

/// What a command handler returns: nothing, one event, or several.
#[derive(Debug, Clone)]
pub enum Emit {
    /// The command is a no-op; nothing is appended.
    Nothing,
    /// A single `(event name, data)` pair.
    Event(String, Value),
    /// An ordered sequence of `(event name, data)` pairs, appended
    /// atomically.
    Events(Vec<(String, Value)>),
}

impl Emit {
    /// Shorthand for a single-event result.
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Emit::Event(name.into(), data)
    }
}

/// Lift a handler return into validated [`PendingEvent`]s.
///
/// Every emitted name must be declared by the command and registered in
/// the registry, and its data must satisfy the event's schema; any
/// mismatch is [`Error::EventMalformed`].
pub(crate) fn normalize(
    registry: &Registry,
    command: &ResolvedCommand,
    emit: Emit,
) -> Result<Vec<PendingEvent>> {
    let pairs = match emit {
        Emit::Nothing => Vec::new(),
        Emit::Event(name, data) => vec![(name, data)],
        Emit::Events(pairs) => pairs,
    };

    let mut events = Vec::with_capacity(pairs.len());
    for (name, data) in pairs {
        if !command.config.events.iter().any(|e| e == &name) {
            return Err(Error::EventMalformed {
                event: name,
                explain: json!({
                    "error": "event not declared by command",
                    "command": command.config.name,
                }),
            });
        }
        let config = registry
            .event_config(&name)
            .ok_or_else(|| Error::EventMalformed {
                event: name.clone(),
                explain: json!({"error": "unregistered event"}),
            })?;
        config
            .schema
            .validate(&data)
            .map_err(|explain| Error::EventMalformed {
                event: name.clone(),
                explain,
            })?;
        events.push(PendingEvent {
            event_type: name,
            data,
        });
    }
    Ok(events)
}

/// Fully-qualified stream identifier: `"<app>:<aggregate>:<id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    /// Build the stream id for one aggregate instance.
    pub fn new(app: &str, aggregate: &str, id: &str) -> Self {
        StreamId(format!("{app}:{aggregate}:{id}"))
    }

    /// The full id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic stringification of an aggregate id value extracted from
/// command data: strings are used verbatim, other scalars render in their
/// compact JSON form.
pub(crate) fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
