use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::{meta, Callable, Error, Flavour, Message, State};

/// The apply functions of an aggregate type, by event name.
pub type EventApplyMap = HashMap<String, Callable>;

/// An aggregate type, built at compile time by merging every command processor targeting it.
#[derive(Debug, Clone)]
pub struct AggregateDescription {
    /// The type of the aggregate.
    pub aggregate_type: String,
    /// The payload key holding the aggregate id in commands.
    pub aggregate_identifier_key: String,
    /// The event stream the events of the aggregate are appended to.
    pub stream_name: String,
    /// The apply functions of the events the aggregate records.
    pub event_apply_map: EventApplyMap,
}

/// The lifecycle of a [GenericAggregateRoot].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AggregateLifecycle {
    /// Created for a new aggregate, before its first event.
    Unborn,
    /// Replaying the history of an existing aggregate.
    Replaying,
    /// Ready to record new events.
    Live,
}

/// An event-sourced aggregate whose state is handled by a [Flavour].
///
/// An aggregate root only lives for the processing of one command. Its pending events are
/// persisted, the root itself is dropped.
pub struct GenericAggregateRoot {
    aggregate_id: String,
    version: u64,
    state: Option<State>,
    description: Arc<AggregateDescription>,
    flavour: Arc<dyn Flavour>,
    pending_events: Vec<Message>,
    lifecycle: AggregateLifecycle,
}

impl GenericAggregateRoot {
    /// Creates a new aggregate, without any event.
    pub fn new(
        aggregate_id: impl Into<String>,
        description: Arc<AggregateDescription>,
        flavour: Arc<dyn Flavour>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            version: 0,
            state: None,
            description,
            flavour,
            pending_events: Vec::new(),
            lifecycle: AggregateLifecycle::Unborn,
        }
    }

    /// Rebuilds an aggregate by applying its history in stream order.
    ///
    /// The version of the aggregate is set to the `_aggregate_version` of each replayed event.
    pub fn reconstitute_from_history(
        aggregate_id: impl Into<String>,
        description: Arc<AggregateDescription>,
        flavour: Arc<dyn Flavour>,
        history: impl IntoIterator<Item = Message>,
    ) -> Result<Self, Error> {
        let mut aggregate = Self::new(aggregate_id, description, flavour);
        aggregate.replay(history)?;
        Ok(aggregate)
    }

    /// Rebuilds an aggregate from a snapshot, then applies the events recorded after it.
    pub fn reconstitute_from_snapshot(
        aggregate_id: impl Into<String>,
        description: Arc<AggregateDescription>,
        flavour: Arc<dyn Flavour>,
        version: u64,
        state: State,
        history: impl IntoIterator<Item = Message>,
    ) -> Result<Self, Error> {
        let mut aggregate = Self::new(aggregate_id, description, flavour);
        aggregate.version = version;
        aggregate.state = Some(state);
        aggregate.replay(history)?;
        Ok(aggregate)
    }

    fn replay(&mut self, history: impl IntoIterator<Item = Message>) -> Result<(), Error> {
        self.lifecycle = AggregateLifecycle::Replaying;
        for event in history {
            self.version = event.aggregate_version().unwrap_or(self.version + 1);
            self.apply(&event)?;
        }
        log::debug!(
            "Replayed aggregate {} {} up to version {}",
            self.description.aggregate_type,
            self.aggregate_id,
            self.version
        );
        self.lifecycle = AggregateLifecycle::Live;
        Ok(())
    }

    /// The id of the aggregate.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// The type of the aggregate.
    pub fn aggregate_type(&self) -> &str {
        &self.description.aggregate_type
    }

    /// The number of events of the aggregate, including pending ones.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The current state, `None` if no event has been applied yet.
    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// The current lifecycle step.
    pub fn lifecycle(&self) -> AggregateLifecycle {
        self.lifecycle
    }

    /// Records a new event: the event is stamped with the aggregate id and its new version,
    /// added to the pending events, and applied.
    ///
    /// Fails with [Error::UnknownEvent] if the aggregate has no apply function for the event,
    /// leaving the aggregate untouched.
    pub fn record_that(&mut self, event: Message) -> Result<(), Error> {
        if !self
            .description
            .event_apply_map
            .contains_key(event.name())
        {
            return Err(self.unknown_event(&event));
        }
        self.version += 1;
        let mut metadata = event.metadata().clone();
        metadata.insert(meta::AGGREGATE_ID.into(), self.aggregate_id.clone().into());
        metadata.insert(meta::AGGREGATE_VERSION.into(), self.version.into());
        let event = event.with_metadata(metadata);
        self.apply(&event)?;
        self.pending_events.push(event);
        self.lifecycle = AggregateLifecycle::Live;
        Ok(())
    }

    /// Returns and clears the pending events.
    pub fn pop_pending_events(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.pending_events)
    }

    fn apply(&mut self, event: &Message) -> Result<(), Error> {
        let apply = self
            .description
            .event_apply_map
            .get(event.name())
            .ok_or_else(|| self.unknown_event(event))?;
        let state = match self.state.take() {
            None => self.flavour.call_apply_first_event(apply, event)?,
            Some(state) => self
                .flavour
                .call_apply_subsequent_event(apply, state, event)?,
        };
        if let State::Raw(value) = &state {
            if !value.is_object() && !value.is_array() {
                return Err(Error::InvalidApplyResult {
                    event: event.name().to_string(),
                    got: describe(value).to_string(),
                });
            }
        }
        self.state = Some(state);
        Ok(())
    }

    fn unknown_event(&self, event: &Message) -> Error {
        Error::UnknownEvent {
            aggregate_type: self.description.aggregate_type.clone(),
            event: event.name().to_string(),
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Debug for GenericAggregateRoot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericAggregateRoot")
            .field("aggregate_type", &self.description.aggregate_type)
            .field("aggregate_id", &self.aggregate_id)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("pending_events", &self.pending_events.len())
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}
