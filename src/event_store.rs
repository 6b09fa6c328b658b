use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::transaction::no_transaction;
use crate::{Error, Message, Transactional};

/// Selects events by exact metadata values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataMatcher(Vec<(String, Value)>);

impl MetadataMatcher {
    /// Creates a matcher accepting every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a condition: the metadata `key` must be equal to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    /// Whether an event matches every condition.
    pub fn matches(&self, event: &Message) -> bool {
        self.0
            .iter()
            .all(|(key, value)| event.meta(key) == Some(value))
    }
}

/// An event with its position in the store. Positions are global to the store, strictly
/// increasing, and start at 1.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// The position of the event.
    pub position: u64,
    /// The event.
    pub message: Message,
}

/// Persists events in named streams.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Creates a stream. Does nothing if it already exists.
    async fn create_stream(&self, stream: &str) -> Result<(), Error>;

    /// Whether a stream exists.
    async fn has_stream(&self, stream: &str) -> Result<bool, Error>;

    /// Appends events recorded by one aggregate, atomically.
    ///
    /// The aggregate is identified by the `_aggregate_type` and `_aggregate_id` metadata of the
    /// events. Fails with [Error::ConcurrencyConflict] if the current version of the aggregate
    /// in the stream is not `expected_version`, in which case nothing is appended.
    async fn append(
        &self,
        stream: &str,
        expected_version: u64,
        events: Vec<Message>,
    ) -> Result<(), Error>;

    /// Loads the events of a stream matching `matcher`, in stream order. Events with an
    /// `_aggregate_version` lower than `from_version` are skipped.
    async fn load(
        &self,
        stream: &str,
        from_version: u64,
        matcher: &MetadataMatcher,
    ) -> Result<Vec<Message>, Error>;

    /// Reads the events of a stream stored after a position, `0` reading from the start.
    async fn read(&self, stream: &str, after_position: u64) -> Result<Vec<StoredEvent>, Error>;
}

#[derive(Debug, Clone, Default)]
struct Streams {
    streams: HashMap<String, Vec<StoredEvent>>,
    last_position: u64,
}

impl Streams {
    fn stream(&self, stream: &str) -> Result<&Vec<StoredEvent>, Error> {
        self.streams
            .get(stream)
            .ok_or_else(|| Error::UnknownStream(stream.to_string()))
    }

    fn aggregate_version(
        &self,
        stream: &str,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<u64, Error> {
        Ok(self
            .stream(stream)?
            .iter()
            .map(|event| &event.message)
            .filter(|event| {
                event.aggregate_type() == Some(aggregate_type)
                    && event.aggregate_id() == Some(aggregate_id)
            })
            .filter_map(Message::aggregate_version)
            .max()
            .unwrap_or_default())
    }
}

/// An [EventStore] keeping events in memory.
///
/// Transactions are supported by keeping a copy of the streams taken at the beginning of the
/// transaction.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: Mutex<Streams>,
    transaction: Mutex<Option<Streams>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn create_stream(&self, stream: &str) -> Result<(), Error> {
        self.streams
            .lock()?
            .streams
            .entry(stream.to_string())
            .or_default();
        Ok(())
    }

    async fn has_stream(&self, stream: &str) -> Result<bool, Error> {
        Ok(self.streams.lock()?.streams.contains_key(stream))
    }

    async fn append(
        &self,
        stream: &str,
        expected_version: u64,
        events: Vec<Message>,
    ) -> Result<(), Error> {
        let mut streams = self.streams.lock()?;
        streams.stream(stream)?;
        let Some(first) = events.first() else {
            return Ok(());
        };
        if let (Some(aggregate_type), Some(aggregate_id)) =
            (first.aggregate_type(), first.aggregate_id())
        {
            let actual = streams.aggregate_version(stream, aggregate_type, aggregate_id)?;
            if actual != expected_version {
                log::debug!(
                    "Rejecting append to {stream}: {aggregate_type} {aggregate_id} is at version {actual}, expected {expected_version}"
                );
                return Err(Error::ConcurrencyConflict {
                    aggregate_type: aggregate_type.to_string(),
                    aggregate_id: aggregate_id.to_string(),
                    expected: expected_version,
                    actual,
                });
            }
        }
        let count = events.len();
        let mut position = streams.last_position;
        let stored: Vec<_> = events
            .into_iter()
            .map(|message| {
                position += 1;
                StoredEvent { position, message }
            })
            .collect();
        streams.last_position = position;
        streams
            .streams
            .entry(stream.to_string())
            .or_default()
            .extend(stored);
        log::debug!("Appended {count} events to {stream}");
        Ok(())
    }

    async fn load(
        &self,
        stream: &str,
        from_version: u64,
        matcher: &MetadataMatcher,
    ) -> Result<Vec<Message>, Error> {
        Ok(self
            .streams
            .lock()?
            .stream(stream)?
            .iter()
            .map(|event| &event.message)
            .filter(|event| matcher.matches(event))
            .filter(|event| {
                event
                    .aggregate_version()
                    .map_or(true, |version| version >= from_version)
            })
            .cloned()
            .collect())
    }

    async fn read(&self, stream: &str, after_position: u64) -> Result<Vec<StoredEvent>, Error> {
        Ok(self
            .streams
            .lock()?
            .stream(stream)?
            .iter()
            .filter(|event| event.position > after_position)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Transactional for InMemoryEventStore {
    async fn begin_transaction(&self) -> Result<(), Error> {
        let copy = self.streams.lock()?.clone();
        let mut transaction = self.transaction.lock()?;
        if transaction.is_some() {
            return Err(Error::transaction(Error::Storage(
                "A transaction is already in progress".into(),
            )));
        }
        *transaction = Some(copy);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), Error> {
        self.transaction
            .lock()?
            .take()
            .map(|_| ())
            .ok_or_else(no_transaction)
    }

    async fn rollback_transaction(&self) -> Result<(), Error> {
        let copy = self.transaction.lock()?.take().ok_or_else(no_transaction)?;
        *self.streams.lock()? = copy;
        Ok(())
    }
}
