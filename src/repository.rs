use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    meta, AggregateDescription, Error, EventStore, Flavour, GenericAggregateRoot, Message,
    MetadataMatcher, Snapshot, SnapshotStore,
};

/// Loads the current state of aggregates as plain data, for read models and queries.
#[async_trait]
pub trait AggregateStateStore: Send + Sync {
    /// The current state of an aggregate.
    ///
    /// Fails with [Error::AggregateNotFound] if the aggregate has no event.
    async fn load_aggregate_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Value, Error>;
}

/// Loads aggregates from their history and persists their new events.
pub struct AggregateRepository {
    event_store: Arc<dyn EventStore>,
    flavour: Arc<dyn Flavour>,
    aggregates: HashMap<String, Arc<AggregateDescription>>,
    snapshots: Option<(Arc<dyn SnapshotStore>, u64)>,
}

impl AggregateRepository {
    /// Creates a repository for the described aggregate types.
    pub fn new(
        event_store: Arc<dyn EventStore>,
        flavour: Arc<dyn Flavour>,
        aggregates: HashMap<String, Arc<AggregateDescription>>,
    ) -> Self {
        Self {
            event_store,
            flavour,
            aggregates,
            snapshots: None,
        }
    }

    /// Seeds loaded aggregates from snapshots, taking a new snapshot every `frequency`
    /// versions.
    pub fn with_snapshots(
        mut self,
        snapshot_store: Arc<dyn SnapshotStore>,
        frequency: u64,
    ) -> Self {
        self.snapshots = Some((snapshot_store, frequency.max(1)));
        self
    }

    /// The description of an aggregate type.
    pub fn description(&self, aggregate_type: &str) -> Result<&Arc<AggregateDescription>, Error> {
        self.aggregates.get(aggregate_type).ok_or_else(|| {
            Error::configuration(format!("Unknown aggregate type {aggregate_type}"))
        })
    }

    /// Loads an aggregate by replaying its events, starting from its latest snapshot if any.
    pub async fn load(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<GenericAggregateRoot, Error> {
        let description = Arc::clone(self.description(aggregate_type)?);
        let snapshot = match &self.snapshots {
            Some((store, _)) => store.get(aggregate_type, aggregate_id).await?,
            None => None,
        };
        let from_version = snapshot.as_ref().map_or(1, |snapshot| snapshot.version + 1);
        let matcher = MetadataMatcher::new()
            .with(meta::AGGREGATE_TYPE, aggregate_type)
            .with(meta::AGGREGATE_ID, aggregate_id);
        let history = self
            .event_store
            .load(&description.stream_name, from_version, &matcher)
            .await?
            .into_iter()
            .enumerate()
            .map(|(index, event)| {
                let first = snapshot.is_none() && index == 0;
                self.flavour
                    .convert_message_received_from_network(event, first)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let flavour = Arc::clone(&self.flavour);
        match snapshot {
            Some(snapshot) => GenericAggregateRoot::reconstitute_from_snapshot(
                aggregate_id,
                description,
                flavour,
                snapshot.version,
                snapshot.state,
                history,
            ),
            None if history.is_empty() => Err(Error::AggregateNotFound {
                aggregate_type: aggregate_type.to_string(),
                aggregate_id: aggregate_id.to_string(),
            }),
            None => GenericAggregateRoot::reconstitute_from_history(
                aggregate_id,
                description,
                flavour,
                history,
            ),
        }
    }

    /// Appends the pending events of an aggregate to its stream.
    ///
    /// The events are stamped with the aggregate type and converted to their plain form. Fails
    /// with [Error::ConcurrencyConflict] if the aggregate is not at `expected_version` in the
    /// store anymore.
    pub async fn persist(
        &self,
        aggregate: &mut GenericAggregateRoot,
        expected_version: u64,
    ) -> Result<Vec<Message>, Error> {
        let events = aggregate
            .pop_pending_events()
            .into_iter()
            .map(|event| {
                self.flavour.prepare_network_transmission(
                    event.with_added_metadata(meta::AGGREGATE_TYPE, aggregate.aggregate_type()),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        if events.is_empty() {
            return Ok(events);
        }
        let stream_name = &self.description(aggregate.aggregate_type())?.stream_name;
        self.event_store
            .append(stream_name, expected_version, events.clone())
            .await?;
        Ok(events)
    }

    /// The snapshot to take after an aggregate moved from `previous_version` to its current
    /// version, if it crossed a multiple of the snapshot frequency.
    pub fn snapshot_due(
        &self,
        aggregate: &GenericAggregateRoot,
        previous_version: u64,
    ) -> Option<Snapshot> {
        let (_, frequency) = self.snapshots.as_ref()?;
        if aggregate.version() / frequency == previous_version / frequency {
            return None;
        }
        Some(Snapshot {
            aggregate_type: aggregate.aggregate_type().to_string(),
            aggregate_id: aggregate.aggregate_id().to_string(),
            version: aggregate.version(),
            state: aggregate.state()?.clone(),
        })
    }

    /// Saves a snapshot, if a snapshot store is configured.
    pub async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), Error> {
        match &self.snapshots {
            Some((store, _)) => store.save(snapshot).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AggregateStateStore for AggregateRepository {
    async fn load_aggregate_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Value, Error> {
        let aggregate = self.load(aggregate_type, aggregate_id).await?;
        match aggregate.state() {
            Some(state) => self
                .flavour
                .convert_aggregate_state_to_value(aggregate_type, state),
            None => Ok(Value::Object(Default::default())),
        }
    }
}
