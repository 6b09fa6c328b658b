use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::{Error, State};

/// The state of an aggregate at a given version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The type of the aggregate.
    pub aggregate_type: String,
    /// The id of the aggregate.
    pub aggregate_id: String,
    /// The version of the aggregate when the snapshot was taken.
    pub version: u64,
    /// The state of the aggregate.
    pub state: State,
}

/// Stores the latest snapshot of aggregates, so that loading them only replays the events
/// recorded after it.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The latest snapshot of an aggregate.
    async fn get(&self, aggregate_type: &str, aggregate_id: &str)
        -> Result<Option<Snapshot>, Error>;

    /// Saves a snapshot, replacing the previous one.
    async fn save(&self, snapshot: Snapshot) -> Result<(), Error>;
}

/// A [SnapshotStore] keeping snapshots in memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<(String, String), Snapshot>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<Snapshot>, Error> {
        Ok(self
            .snapshots
            .lock()?
            .get(&(aggregate_type.to_string(), aggregate_id.to_string()))
            .cloned())
    }

    async fn save(&self, snapshot: Snapshot) -> Result<(), Error> {
        log::debug!(
            "Saving snapshot of {} {} at version {}",
            snapshot.aggregate_type,
            snapshot.aggregate_id,
            snapshot.version
        );
        self.snapshots.lock()?.insert(
            (snapshot.aggregate_type.clone(), snapshot.aggregate_id.clone()),
            snapshot,
        );
        Ok(())
    }
}
