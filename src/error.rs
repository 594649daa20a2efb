//! Crate-level error taxonomy for dispatch, storage, and delivery.

use serde_json::Value;

/// A specialized `Result` type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by command dispatch and the event log.
///
/// Command-side failures reach the dispatch caller synchronously and are
/// never retried by the runtime. Subscription-side handler failures never
/// appear here: the delivery loop logs them and acknowledges the event
/// anyway (see [`EventLog::subscribe`](crate::EventLog::subscribe)).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dispatch was attempted with no running application.
    #[error("no application is running")]
    ApplicationNotStarted,

    /// No command is registered under the given name.
    #[error("unknown command: {name}")]
    CommandUnknown {
        /// The command name that failed to resolve.
        name: String,
    },

    /// Command input data failed the command's schema.
    ///
    /// Recoverable by the caller: fix the input and re-dispatch.
    #[error("invalid input for command '{command}'")]
    CommandInvalid {
        /// The command whose schema rejected the input.
        command: String,
        /// Machine-readable explanation from the schema validator.
        explain: Value,
    },

    /// The handler emitted an event the runtime cannot accept: an
    /// unregistered name, a name the command does not declare, or data
    /// failing the event schema. Indicates a handler bug.
    #[error("malformed event '{event}' emitted by handler")]
    EventMalformed {
        /// The offending event name.
        event: String,
        /// Machine-readable explanation of the mismatch.
        explain: Value,
    },

    /// No event is registered under the given name.
    #[error("unknown event: {name}")]
    EventUnknown {
        /// The event name that failed to resolve.
        name: String,
    },

    /// No aggregate is registered under the given name.
    #[error("unknown aggregate: {name}")]
    AggregateUnknown {
        /// The aggregate name that failed to resolve.
        name: String,
    },

    /// Folding the handler's events over current state produced a state
    /// that fails the aggregate schema. Nothing was appended.
    #[error("events would leave aggregate '{aggregate}' invalid")]
    AggregateInvalid {
        /// The aggregate whose schema rejected the folded state.
        aggregate: String,
        /// Machine-readable explanation from the schema validator.
        explain: Value,
    },

    /// Optimistic concurrency control detected a conflicting writer on
    /// the stream. Recoverable: re-dispatch to retry against the new
    /// stream head.
    #[error("concurrent write detected on stream {stream}")]
    Concurrency {
        /// The stream the conflicting append targeted.
        stream: String,
    },

    /// A business rule raised by the user's command handler. The payload
    /// is the handler's own explanation value, propagated untouched.
    #[error("business rule violation")]
    Rejected {
        /// The handler-supplied payload describing the violation.
        payload: Value,
    },

    /// Transport or storage failure in the event log backend.
    #[error("event store backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Wrap any displayable backend failure.
    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        Error::Backend(err.to_string())
    }
}
