use std::sync::PoisonError;

use crate::schema::ValidationError;

/// Errors that can occur while describing, dispatching or projecting messages.
///
/// Use [status_code](Error::status_code) and [is_retryable](Error::is_retryable) to map an error
/// to a client facing response.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A payload does not match the schema registered for its message.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// No message with this name is registered.
    #[error("Unknown message {0}")]
    UnknownMessage(String),
    /// A message name contains characters outside of `[A-Za-z0-9_.\-/]`.
    #[error("Invalid message name {0:?}")]
    InvalidMessageName(String),
    /// An aggregate was asked to record an event it has no apply function for.
    #[error("Aggregate {aggregate_type} cannot record unknown event {event}")]
    UnknownEvent {
        /// The type of the aggregate
        aggregate_type: String,
        /// The name of the rejected event
        event: String,
    },
    /// A business function yielded an event its command does not declare with `record_that`.
    #[error("Command {command} yielded event {event} it does not record")]
    UndeclaredEvent {
        /// The name of the processed command
        command: String,
        /// The name of the yielded event
        event: String,
    },
    /// An apply function of a prototyping aggregate returned something else than an object or
    /// an array.
    #[error("Apply function for event {event} must return an object or an array, got {got}")]
    InvalidApplyResult {
        /// The name of the applied event
        event: String,
        /// A description of the returned value
        got: String,
    },
    /// A command does not carry the identifier of the aggregate it targets.
    #[error("Command {command} is missing aggregate identifier {key}")]
    MissingIdentifier {
        /// The name of the command
        command: String,
        /// The identifier key looked up in the payload
        key: String,
    },
    /// A command processor received a command it is not configured for.
    #[error("Command processor for {expected} received command {actual}")]
    RoutingMismatch {
        /// The command the processor handles
        expected: String,
        /// The command that was received
        actual: String,
    },
    /// A command or query was dispatched but nothing handles it.
    #[error("No handler for message {0}")]
    NoHandler(String),
    /// Another writer appended to the aggregate stream since it was loaded.
    #[error(
        "Concurrency conflict on aggregate {aggregate_type} {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The type of the aggregate
        aggregate_type: String,
        /// The id of the aggregate
        aggregate_id: String,
        /// The version the aggregate had when it was loaded
        expected: u64,
        /// The version found in the event store
        actual: u64,
    },
    /// No event exists for the requested aggregate.
    #[error("Aggregate {aggregate_type} with id {aggregate_id} was not found")]
    AggregateNotFound {
        /// The type of the aggregate
        aggregate_type: String,
        /// The id of the aggregate
        aggregate_id: String,
    },
    /// A document store collection does not exist.
    #[error("Unknown collection {0}")]
    UnknownCollection(String),
    /// An event stream does not exist.
    #[error("Unknown event stream {0}")]
    UnknownStream(String),
    /// Beginning, committing or rolling back a transaction failed.
    #[error("Transaction failed: {0}")]
    Transaction(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The description of the application is inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A value could not be downcast to the requested type.
    #[error("Could not downcast value to type {0}")]
    Downcast(&'static str),
    /// A flavour received a callable built for another flavour or another hook.
    #[error("Expected a callable of type {expected}, got {actual}")]
    CallableMismatch {
        /// The expected callable type
        expected: &'static str,
        /// The actual callable type
        actual: &'static str,
    },
    /// An error occurred when serializing or deserializing a payload.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),
    /// A lock guarding in-memory state has been poisoned.
    #[error("Concurrency error: a lock has been poisoned")]
    Poisoned,
}

impl Error {
    /// The HTTP equivalent status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_)
            | Error::InvalidMessageName(_)
            | Error::MissingIdentifier { .. } => 400,
            Error::UnknownMessage(_)
            | Error::AggregateNotFound { .. }
            | Error::UnknownCollection(_)
            | Error::UnknownStream(_) => 404,
            Error::ConcurrencyConflict { .. } => 409,
            Error::Transaction(_) | Error::Storage(_) => 503,
            _ => 500,
        }
    }

    /// Whether dispatching the same message again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConcurrencyConflict { .. } | Error::Transaction(_) | Error::Storage(_)
        )
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn transaction(error: Error) -> Self {
        match error {
            Error::Transaction(_) => error,
            error => Error::Transaction(Box::new(error)),
        }
    }
}

impl<G> From<PoisonError<G>> for Error {
    fn from(_: PoisonError<G>) -> Self {
        Error::Poisoned
    }
}
