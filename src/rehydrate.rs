//! Aggregate rehydration: fold an event stream, optionally from a
//! snapshot, into current state.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::event::{EventMeta, PendingEvent, StreamId};
use crate::log::EventLog;
use crate::registry::{AggregateConfig, Registry};

/// Current state of one aggregate instance: the data portion plus the
/// meta of the last event folded into it.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateState {
    /// Meta of the last folded event; initial meta for an empty stream.
    pub meta: EventMeta,
    /// The folded aggregate data. `Null` for an empty stream.
    pub data: Value,
}

impl AggregateState {
    fn origin() -> Self {
        AggregateState {
            meta: EventMeta::origin(),
            data: Value::Null,
        }
    }
}

/// Recursively merge `patch` into `base`.
///
/// Objects merge key-wise; every other value, arrays included, is
/// replaced by the patch. This is the wildcard default reducer users
/// override per event type.
pub fn deep_merge(base: Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(mut merged), Value::Object(patch)) => {
            for (key, value) in patch {
                let entry = match merged.remove(key) {
                    Some(prior) => deep_merge(prior, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        (_, patch) => patch.clone(),
    }
}

/// Fold pending events over `data` using the registry's reducer map.
pub(crate) fn fold(registry: &Registry, data: Value, events: &[PendingEvent]) -> Value {
    events.iter().fold(data, |state, event| {
        let reducer = registry.reducer(&event.event_type);
        reducer.as_ref()(state, &event.data)
    })
}

/// Derive the current state of an aggregate instance by replaying its
/// stream.
///
/// When the aggregate has snapshotting enabled, replay starts from the
/// stored snapshot (if any) and only folds the events appended after it.
/// Rehydration is pure: the same stream always produces the same result,
/// so it is safe to repeat after a concurrency failure.
pub(crate) async fn rehydrate(
    registry: &Registry,
    log: &Arc<dyn EventLog>,
    aggregate: &AggregateConfig,
    stream: &StreamId,
) -> Result<AggregateState> {
    let mut state = if aggregate.snapshots {
        match log.get_snapshot(stream).await? {
            Some(snapshot) => AggregateState {
                meta: snapshot.meta,
                data: snapshot.data,
            },
            None => AggregateState::origin(),
        }
    } else {
        AggregateState::origin()
    };

    let events = log.read(stream, state.meta.version, None).await?;
    for event in events {
        let reducer = registry.reducer(&event.event_type);
        state.data = reducer.as_ref()(std::mem::take(&mut state.data), &event.data);
        state.meta = event.meta;
    }
    Ok(state)
}
