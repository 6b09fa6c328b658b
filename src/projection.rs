//! Read models built from event streams.
//!
//! A [ProjectionRunner] reads the events appended to the watched streams since its last run
//! and hands each of them to the interested [projectors](Projector). Read positions are kept in
//! the document store, per application version, so that a new version of an application builds
//! its read models from scratch next to the ones of the previous version.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::{AggregateStateStore, DocumentStore, Error, EventStore, Flavour, Message};

/// The collection holding the read position of each stream, per application version.
pub const POSITIONS_COLLECTION: &str = "projection_positions";

/// The collection holding the current and previous application version of each projection.
pub const VERSIONS_COLLECTION: &str = "projection_versions";

/// The name of the collection of a read model for an application version, for instance
/// `user_projection_0_1_0` for the projection `User.Projection` at version `0.1.0`.
pub fn collection_name(app_version: &str, projection_name: &str) -> String {
    format!("{projection_name}_{app_version}")
        .replace('.', "_")
        .to_lowercase()
}

/// Maintains a read model.
#[async_trait]
pub trait Projector: Send + Sync {
    /// Creates the storage of the read model, if missing.
    async fn prepare_for_run(&self, app_version: &str, projection_name: &str) -> Result<(), Error>;

    /// Updates the read model with an event.
    async fn handle(
        &self,
        app_version: &str,
        projection_name: &str,
        event: &Message,
    ) -> Result<(), Error>;

    /// Deletes the read model.
    async fn delete_read_model(&self, app_version: &str, projection_name: &str)
        -> Result<(), Error>;
}

/// A [Projector] keeping one document per aggregate, holding its current state.
///
/// The whole state is reloaded on every event, which makes replays idempotent.
pub struct AggregateProjector {
    document_store: Arc<dyn DocumentStore>,
    state_store: Arc<dyn AggregateStateStore>,
    aggregate_type: String,
}

impl AggregateProjector {
    /// Creates a projector for an aggregate type.
    pub fn new(
        document_store: Arc<dyn DocumentStore>,
        state_store: Arc<dyn AggregateStateStore>,
        aggregate_type: impl Into<String>,
    ) -> Self {
        Self {
            document_store,
            state_store,
            aggregate_type: aggregate_type.into(),
        }
    }

    /// The projection name of an aggregate type, `User.Projection` for `User`.
    pub fn projection_name(aggregate_type: &str) -> String {
        format!("{aggregate_type}.Projection")
    }
}

#[async_trait]
impl Projector for AggregateProjector {
    async fn prepare_for_run(&self, app_version: &str, projection_name: &str) -> Result<(), Error> {
        self.document_store
            .add_collection(&collection_name(app_version, projection_name), Vec::new())
            .await
    }

    async fn handle(
        &self,
        app_version: &str,
        projection_name: &str,
        event: &Message,
    ) -> Result<(), Error> {
        if event.aggregate_type() != Some(self.aggregate_type.as_str()) {
            return Ok(());
        }
        let Some(aggregate_id) = event.aggregate_id() else {
            return Ok(());
        };
        let state = self
            .state_store
            .load_aggregate_state(&self.aggregate_type, aggregate_id)
            .await?;
        let collection = collection_name(app_version, projection_name);
        self.document_store.delete_doc(&collection, aggregate_id).await?;
        self.document_store
            .upsert_doc(&collection, aggregate_id, state)
            .await
    }

    async fn delete_read_model(
        &self,
        app_version: &str,
        projection_name: &str,
    ) -> Result<(), Error> {
        self.document_store
            .drop_collection(&collection_name(app_version, projection_name))
            .await
    }
}

#[derive(Clone)]
pub(crate) enum ProjectionKind {
    Aggregate(String),
    Custom(Arc<dyn Projector>),
}

/// A projection of the events of a stream, optionally restricted to an aggregate type or to
/// some events.
///
/// Built with [Configuration::watch](crate::Configuration::watch).
#[derive(Clone)]
pub struct ProjectionDescription {
    stream: String,
    name: Option<String>,
    kind: Option<ProjectionKind>,
    aggregate_type: Option<String>,
    events: Option<Vec<String>>,
    errors: Vec<String>,
}

impl ProjectionDescription {
    pub(crate) fn new(stream: String) -> Self {
        Self {
            stream,
            name: None,
            kind: None,
            aggregate_type: None,
            events: None,
            errors: Vec::new(),
        }
    }

    fn project(mut self, name: String, kind: ProjectionKind) -> Self {
        if let Some(current) = &self.name {
            self.errors
                .push(format!("stream {} is already projected by {current}", self.stream));
        }
        self.name = Some(name);
        self.kind = Some(kind);
        self
    }

    /// Keeps the current state of every aggregate of a type in a collection, one document per
    /// aggregate.
    pub fn with_aggregate_projection(self, aggregate_type: impl Into<String>) -> Self {
        let aggregate_type = aggregate_type.into();
        self.project(
            AggregateProjector::projection_name(&aggregate_type),
            ProjectionKind::Aggregate(aggregate_type.clone()),
        )
        .filter_aggregate_type(aggregate_type)
    }

    /// Feeds a custom projector.
    pub fn with_projection(
        self,
        name: impl Into<String>,
        projector: impl Projector + 'static,
    ) -> Self {
        self.project(name.into(), ProjectionKind::Custom(Arc::new(projector)))
    }

    /// Only projects the events of an aggregate type.
    pub fn filter_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Only projects the given events.
    pub fn filter_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = Some(events.into_iter().map(Into::into).collect());
        self
    }

    /// The watched stream.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// The name of the projection.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The aggregate type filter.
    pub fn aggregate_type(&self) -> Option<&str> {
        self.aggregate_type.as_deref()
    }

    /// The event filter.
    pub fn events(&self) -> Option<&[String]> {
        self.events.as_deref()
    }

    /// Whether an event read from a stream must be projected.
    pub fn is_interested(&self, stream: &str, event: &Message) -> bool {
        self.stream == stream
            && self
                .aggregate_type
                .as_deref()
                .map_or(true, |aggregate_type| event.aggregate_type() == Some(aggregate_type))
            && self
                .events
                .as_ref()
                .map_or(true, |events| events.iter().any(|name| name == event.name()))
    }

    pub(crate) fn kind(&self) -> Option<&ProjectionKind> {
        self.kind.as_ref()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        let name = self.name().unwrap_or(&self.stream);
        self.errors
            .iter()
            .map(|error| format!("Projection {name}: {error}"))
            .collect()
    }
}

/// The state of a [ProjectionRunner].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProjectionStatus {
    /// Waiting for the next run.
    Idle,
    /// Handing events to projectors.
    Running,
    /// Stopped, runs do nothing until [started](ProjectionRunner::start) again.
    Stopped,
}

/// A projection whose projector has been built.
pub struct Projection {
    /// The description of the projection.
    pub description: ProjectionDescription,
    /// The projector maintaining the read model.
    pub projector: Arc<dyn Projector>,
}

impl Projection {
    fn name(&self) -> &str {
        self.description.name().unwrap_or_default()
    }
}

/// Runs projections over event streams.
pub struct ProjectionRunner {
    projections: Vec<Projection>,
    event_store: Arc<dyn EventStore>,
    document_store: Arc<dyn DocumentStore>,
    flavour: Arc<dyn Flavour>,
    app_version: String,
    persist_block_size: usize,
    status: Mutex<ProjectionStatus>,
}

impl ProjectionRunner {
    /// Creates a runner. Read positions are persisted every `persist_block_size` events.
    pub fn new(
        projections: Vec<Projection>,
        event_store: Arc<dyn EventStore>,
        document_store: Arc<dyn DocumentStore>,
        flavour: Arc<dyn Flavour>,
        app_version: impl Into<String>,
        persist_block_size: usize,
    ) -> Self {
        Self {
            projections,
            event_store,
            document_store,
            flavour,
            app_version: app_version.into(),
            persist_block_size: persist_block_size.max(1),
            status: Mutex::new(ProjectionStatus::Idle),
        }
    }

    /// The current status.
    pub fn status(&self) -> Result<ProjectionStatus, Error> {
        Ok(*self.status.lock()?)
    }

    /// Stops the runner. A run in progress stops before its next event.
    pub fn stop(&self) -> Result<(), Error> {
        *self.status.lock()? = ProjectionStatus::Stopped;
        Ok(())
    }

    /// Re-arms a stopped runner.
    pub fn start(&self) -> Result<(), Error> {
        let mut status = self.status.lock()?;
        if *status == ProjectionStatus::Stopped {
            *status = ProjectionStatus::Idle;
        }
        Ok(())
    }

    /// Creates the read models of the current application version.
    ///
    /// When the application version changed since the last setup, the read models of the
    /// version before the previous one are deleted, and the previous ones are kept for a
    /// rollback. Going back to the previous version swaps both versions and deletes nothing.
    pub async fn prepare(&self) -> Result<(), Error> {
        self.document_store
            .add_collection(POSITIONS_COLLECTION, Vec::new())
            .await?;
        self.document_store
            .add_collection(VERSIONS_COLLECTION, Vec::new())
            .await?;
        for projection in &self.projections {
            let name = projection.name();
            let versions = self.document_store.get_doc(VERSIONS_COLLECTION, name).await?;
            let current = versions
                .as_ref()
                .and_then(|versions| versions["current"].as_str());
            match current {
                Some(current) if current == self.app_version => (),
                Some(current) => {
                    let previous = versions
                        .as_ref()
                        .and_then(|versions| versions["previous"].as_str());
                    if previous == Some(self.app_version.as_str()) {
                        log::info!(
                            "Rolling projection {name} back from version {current} to {}",
                            self.app_version
                        );
                    } else {
                        if let Some(previous) = previous {
                            self.delete_version(projection, previous).await?;
                        }
                        log::info!(
                            "Switching projection {name} from version {current} to {}",
                            self.app_version
                        );
                    }
                    let versions = json!({ "current": self.app_version, "previous": current });
                    self.document_store
                        .upsert_doc(VERSIONS_COLLECTION, name, versions)
                        .await?;
                }
                None => {
                    let versions = json!({ "current": self.app_version, "previous": null });
                    self.document_store
                        .upsert_doc(VERSIONS_COLLECTION, name, versions)
                        .await?;
                }
            }
            projection
                .projector
                .prepare_for_run(&self.app_version, name)
                .await?;
        }
        Ok(())
    }

    /// Hands the events appended since the last run to the interested projectors, and returns
    /// the number of events read.
    pub async fn run(&self) -> Result<usize, Error> {
        {
            let mut status = self.status.lock()?;
            if *status == ProjectionStatus::Stopped {
                log::debug!("Projections are stopped, skipping run");
                return Ok(0);
            }
            *status = ProjectionStatus::Running;
        }
        let result = self.run_streams().await;
        let mut status = self.status.lock()?;
        if *status == ProjectionStatus::Running {
            *status = ProjectionStatus::Idle;
        }
        result
    }

    /// Deletes every read model and read position, then projects every stream from the start.
    pub async fn reset(&self) -> Result<usize, Error> {
        log::info!("Resetting projections of version {}", self.app_version);
        self.prepare().await?;
        for projection in &self.projections {
            let name = projection.name();
            projection
                .projector
                .delete_read_model(&self.app_version, name)
                .await?;
            projection
                .projector
                .prepare_for_run(&self.app_version, name)
                .await?;
        }
        for stream in self.streams() {
            self.document_store
                .delete_doc(POSITIONS_COLLECTION, &self.position_id(stream))
                .await?;
        }
        self.run().await
    }

    /// Deletes the read model of a projection for an older version, with its read positions.
    async fn delete_version(&self, projection: &Projection, app_version: &str) -> Result<(), Error> {
        let name = projection.name();
        log::info!("Deleting read model of projection {name} for version {app_version}");
        projection.projector.delete_read_model(app_version, name).await?;
        let position_id = format!("{app_version}:{}", projection.description.stream());
        self.document_store
            .delete_doc(POSITIONS_COLLECTION, &position_id)
            .await
    }

    fn streams(&self) -> BTreeSet<&str> {
        self.projections
            .iter()
            .map(|projection| projection.description.stream())
            .collect()
    }

    fn position_id(&self, stream: &str) -> String {
        format!("{}:{stream}", self.app_version)
    }

    fn is_stopped(&self) -> Result<bool, Error> {
        Ok(self.status()? == ProjectionStatus::Stopped)
    }

    async fn run_streams(&self) -> Result<usize, Error> {
        let mut handled = 0;
        for stream in self.streams() {
            let position_id = self.position_id(stream);
            let mut position = self
                .document_store
                .get_doc(POSITIONS_COLLECTION, &position_id)
                .await?
                .and_then(|doc| doc["position"].as_u64())
                .unwrap_or(0);
            let events = self.event_store.read(stream, position).await?;
            log::debug!("Projecting {} events of stream {stream}", events.len());

            let mut unsaved = 0;
            for stored in events {
                if self.is_stopped()? {
                    break;
                }
                for projection in &self.projections {
                    if projection.description.is_interested(stream, &stored.message) {
                        self.flavour
                            .call_projector(
                                projection.projector.as_ref(),
                                &self.app_version,
                                projection.name(),
                                &stored.message,
                            )
                            .await?;
                    } else {
                        log::trace!(
                            "Projection {} is not interested in {}",
                            projection.name(),
                            stored.message.name()
                        );
                    }
                }
                position = stored.position;
                handled += 1;
                unsaved += 1;
                if unsaved >= self.persist_block_size {
                    self.save_position(&position_id, stream, position).await?;
                    unsaved = 0;
                }
            }
            if unsaved > 0 {
                self.save_position(&position_id, stream, position).await?;
            }
        }
        Ok(handled)
    }

    async fn save_position(&self, position_id: &str, stream: &str, position: u64) -> Result<(), Error> {
        let doc: Value = json!({
            "app_version": self.app_version,
            "stream": stream,
            "position": position,
        });
        self.document_store
            .upsert_doc(POSITIONS_COLLECTION, position_id, doc)
            .await
    }
}
