use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::projection::{Projection, ProjectionKind};
use crate::{
    AggregateProjector, AggregateRepository, AggregateStateStore, BasicSchemaAssertion,
    CommandOutcome, CommandProcessor, CommandRouter, CompiledConfiguration, DocumentStore, Error,
    EventListener, EventStore, Flavour, InMemoryDocumentStore, InMemoryEventStore, Message,
    MessageFactory, MessageType, ProjectionRunner, ProjectionStatus, Projector, QueryResolver,
    SchemaAssertion, Settings, SnapshotStore, TransactionManager, Transactional,
};

/// Builds an [EventMachine].
///
/// # Example
/// ```
/// use augure::prototyping::PrototypingFlavour;
/// use augure::{BasicSchemaAssertion, Configuration, EventMachineBuilder, JsonSchema};
/// use std::sync::Arc;
///
/// let configuration = Configuration::new()
///     .register_command("Ping", JsonSchema::any_object())
///     .compile()
///     .unwrap();
/// let factory = configuration.message_factory(Arc::new(BasicSchemaAssertion));
/// let flavour = Arc::new(PrototypingFlavour::new(factory.clone()));
///
/// let machine = EventMachineBuilder::in_memory(configuration, flavour)
///     .message_factory(factory)
///     .build()
///     .unwrap();
/// ```
pub struct EventMachineBuilder {
    configuration: CompiledConfiguration,
    flavour: Arc<dyn Flavour>,
    event_store: Arc<dyn EventStore>,
    document_store: Option<Arc<dyn DocumentStore>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    message_factory: Option<Arc<dyn MessageFactory>>,
    schema_assertion: Option<Arc<dyn SchemaAssertion>>,
    transactional: Vec<Arc<dyn Transactional>>,
    settings: Settings,
}

impl EventMachineBuilder {
    /// Starts a builder with the mandatory parts of a machine.
    pub fn new(
        configuration: CompiledConfiguration,
        flavour: Arc<dyn Flavour>,
        event_store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            configuration,
            flavour,
            event_store,
            document_store: None,
            snapshot_store: None,
            message_factory: None,
            schema_assertion: None,
            transactional: Vec::new(),
            settings: Settings::default(),
        }
    }

    /// Starts a builder with an in-memory event store and document store, both taking part in
    /// transactions.
    pub fn in_memory(configuration: CompiledConfiguration, flavour: Arc<dyn Flavour>) -> Self {
        let event_store = Arc::new(InMemoryEventStore::new());
        let document_store = Arc::new(InMemoryDocumentStore::new());
        Self::new(configuration, flavour, event_store.clone())
            .document_store(document_store.clone())
            .transactional(event_store)
            .transactional(document_store)
    }

    /// The store of read models, mandatory when projections are configured.
    pub fn document_store(mut self, document_store: Arc<dyn DocumentStore>) -> Self {
        self.document_store = Some(document_store);
        self
    }

    /// The store of snapshots, used when [Settings::snapshot_frequency] is set.
    pub fn snapshot_store(mut self, snapshot_store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(snapshot_store);
        self
    }

    /// The factory creating messages. Defaults to a factory validating payloads against the
    /// registered schemas.
    pub fn message_factory(mut self, message_factory: Arc<dyn MessageFactory>) -> Self {
        self.message_factory = Some(message_factory);
        self
    }

    /// The schema validation of the default message factory. Defaults to
    /// [BasicSchemaAssertion].
    pub fn schema_assertion(mut self, schema_assertion: Arc<dyn SchemaAssertion>) -> Self {
        self.schema_assertion = Some(schema_assertion);
        self
    }

    /// Adds a store to the transactions of the immediate consistency mode.
    pub fn transactional(mut self, participant: Arc<dyn Transactional>) -> Self {
        self.transactional.push(participant);
        self
    }

    /// The runtime settings.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Builds the machine. Fails with [Error::Configuration] if a store required by the
    /// configuration or the settings is missing.
    pub fn build(self) -> Result<EventMachine, Error> {
        let Self {
            configuration,
            flavour,
            event_store,
            document_store,
            snapshot_store,
            message_factory,
            schema_assertion,
            transactional,
            settings,
        } = self;

        let message_factory: Arc<dyn MessageFactory> = match message_factory {
            Some(message_factory) => message_factory,
            None => configuration.message_factory(
                schema_assertion.unwrap_or_else(|| Arc::new(BasicSchemaAssertion)),
            ),
        };

        let mut repository = AggregateRepository::new(
            event_store.clone(),
            flavour.clone(),
            configuration.aggregates.clone(),
        );
        match (snapshot_store, settings.snapshot_frequency) {
            (Some(store), Some(frequency)) => {
                repository = repository.with_snapshots(store, frequency);
            }
            (None, Some(_)) => {
                return Err(Error::configuration(
                    "snapshot_frequency is set but no snapshot store is provided",
                ))
            }
            (Some(_), None) => {
                log::warn!("A snapshot store is provided but snapshot_frequency is not set")
            }
            (None, None) => (),
        }
        let repository = Arc::new(repository);

        if settings.immediate_consistency && transactional.is_empty() {
            return Err(Error::configuration(
                "immediate consistency requires transactional stores",
            ));
        }

        let streams = configuration.streams();
        let projections = if configuration.projections.is_empty() {
            None
        } else {
            let document_store = document_store.ok_or_else(|| {
                Error::configuration("projections are configured but no document store is provided")
            })?;
            let projections = configuration
                .projections
                .into_iter()
                .map(|description| {
                    let projector: Arc<dyn Projector> = match description.kind() {
                        Some(ProjectionKind::Aggregate(aggregate_type)) => {
                            let state_store: Arc<dyn AggregateStateStore> = repository.clone();
                            Arc::new(AggregateProjector::new(
                                document_store.clone(),
                                state_store,
                                aggregate_type.clone(),
                            ))
                        }
                        Some(ProjectionKind::Custom(projector)) => projector.clone(),
                        None => {
                            return Err(Error::configuration(format!(
                                "projection of stream {} has no projector",
                                description.stream()
                            )))
                        }
                    };
                    Ok(Projection {
                        description,
                        projector,
                    })
                })
                .collect::<Result<Vec<_>, Error>>()?;
            Some(ProjectionRunner::new(
                projections,
                event_store.clone(),
                document_store,
                flavour.clone(),
                settings.app_version.clone(),
                settings.persist_block_size,
            ))
        };

        Ok(EventMachine {
            router: CommandRouter::new(configuration.routes, flavour.clone(), repository.clone()),
            listeners: configuration.listeners,
            resolvers: configuration.resolvers,
            transactions: TransactionManager::new(transactional),
            settings,
            flavour,
            message_factory,
            event_store,
            repository,
            projections,
            streams,
        })
    }
}

/// Dispatches messages through the command processors, the event listeners and the
/// projections.
///
/// Built with [EventMachineBuilder]. Call [setup](EventMachine::setup) once before dispatching.
pub struct EventMachine {
    settings: Settings,
    flavour: Arc<dyn Flavour>,
    message_factory: Arc<dyn MessageFactory>,
    event_store: Arc<dyn EventStore>,
    repository: Arc<AggregateRepository>,
    router: CommandRouter,
    listeners: HashMap<String, Vec<Arc<dyn EventListener>>>,
    resolvers: HashMap<String, Arc<dyn QueryResolver>>,
    projections: Option<ProjectionRunner>,
    transactions: TransactionManager,
    streams: Vec<String>,
}

impl EventMachine {
    /// The runtime settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Creates the missing event streams and prepares the read models of the current
    /// application version.
    pub async fn setup(&self) -> Result<(), Error> {
        for stream in &self.streams {
            if !self.event_store.has_stream(stream).await? {
                log::info!("Creating event stream {stream}");
                self.event_store.create_stream(stream).await?;
            }
        }
        if let Some(projections) = &self.projections {
            projections.prepare().await?;
        }
        Ok(())
    }

    /// Creates a message from a payload, validating it against the registered schema.
    pub fn create_message(&self, name: &str, payload: Value) -> Result<Message, Error> {
        self.message_factory.create_message(name, payload)
    }

    /// Dispatches a command or an event, and returns the events persisted along the way.
    ///
    /// The events of a command are persisted, then published to their listeners. Commands
    /// issued by listeners are dispatched in order, until no more commands are issued. An event
    /// is only published.
    pub async fn dispatch(&self, message: Message) -> Result<Vec<Message>, Error> {
        let mut messages = VecDeque::from([message]);
        let mut persisted = Vec::new();
        while let Some(message) = messages.pop_front() {
            match message.message_type() {
                MessageType::Command => {
                    let events = self.process(message).await?;
                    for event in &events {
                        messages.extend(self.publish(event).await?);
                    }
                    persisted.extend(events);
                }
                MessageType::Event => messages.extend(self.publish(&message).await?),
                MessageType::Query => {
                    return Err(Error::configuration(format!(
                        "{} is a query, it must be sent with query()",
                        message.name()
                    )))
                }
            }
        }
        Ok(persisted)
    }

    /// Resolves a query.
    pub async fn query(&self, query: Message) -> Result<Value, Error> {
        if query.message_type() != MessageType::Query {
            return Err(Error::configuration(format!(
                "{} is a {}, not a query",
                query.name(),
                query.message_type()
            )));
        }
        let resolver = self
            .resolvers
            .get(query.name())
            .ok_or_else(|| Error::NoHandler(query.name().to_string()))?;
        let query = self.flavour.convert_message_received_from_network(query, false)?;
        self.flavour
            .call_query_resolver(resolver.as_ref(), &query)
            .await
    }

    /// The current state of an aggregate, as plain data.
    pub async fn load_aggregate_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Value, Error> {
        self.repository
            .load_aggregate_state(aggregate_type, aggregate_id)
            .await
    }

    /// Projects the events appended since the last run, and returns their number.
    pub async fn run_projections(&self) -> Result<usize, Error> {
        match &self.projections {
            Some(projections) => projections.run().await,
            None => Ok(0),
        }
    }

    /// Rebuilds every read model from the start of the streams.
    pub async fn reset_projections(&self) -> Result<usize, Error> {
        match &self.projections {
            Some(projections) => projections.reset().await,
            None => Ok(0),
        }
    }

    /// The status of the projections, [Idle](ProjectionStatus::Idle) if there is none.
    pub fn projection_status(&self) -> Result<ProjectionStatus, Error> {
        match &self.projections {
            Some(projections) => projections.status(),
            None => Ok(ProjectionStatus::Idle),
        }
    }

    /// Stops the projections. Dispatched commands are still processed, read models catch up
    /// once the projections are started again.
    pub fn stop_projections(&self) -> Result<(), Error> {
        match &self.projections {
            Some(projections) => projections.stop(),
            None => Ok(()),
        }
    }

    /// Starts stopped projections.
    pub fn start_projections(&self) -> Result<(), Error> {
        match &self.projections {
            Some(projections) => projections.start(),
            None => Ok(()),
        }
    }

    async fn process(&self, command: Message) -> Result<Vec<Message>, Error> {
        let processor = self.router.route(&command)?;
        let outcome = if self.settings.immediate_consistency {
            self.transactions.begin().await?;
            match self.process_and_project(processor, command).await {
                Ok(outcome) => {
                    self.transactions.commit().await?;
                    outcome
                }
                Err(error) => {
                    if let Err(rollback_error) = self.transactions.rollback().await {
                        log::error!("Could not roll back after {error}: {rollback_error}");
                    }
                    return Err(error);
                }
            }
        } else {
            self.process_and_project(processor, command).await?
        };
        if let Some(snapshot) = outcome.snapshot {
            self.repository.save_snapshot(snapshot).await?;
        }
        Ok(outcome.events)
    }

    async fn process_and_project(
        &self,
        processor: CommandProcessor,
        command: Message,
    ) -> Result<CommandOutcome, Error> {
        let outcome = processor.process(command).await?;
        if outcome.events.is_empty() {
            return Ok(outcome);
        }
        match self.run_projections().await {
            Ok(_) => Ok(outcome),
            Err(error) if self.settings.immediate_consistency => Err(error),
            Err(error) => {
                // Events are appended, read models catch up on the next run.
                log::error!(
                    "Could not project {} appended events: {error}",
                    outcome.events.len()
                );
                Ok(outcome)
            }
        }
    }

    async fn publish(&self, event: &Message) -> Result<Vec<Message>, Error> {
        let Some(listeners) = self.listeners.get(event.name()) else {
            if self.listeners.is_empty() {
                log::trace!("No listener for event {}", event.name());
            } else {
                log::warn!("Event {} was published, but no listener handles it", event.name());
            }
            return Ok(Vec::new());
        };
        let mut commands = Vec::new();
        for listener in listeners {
            commands.extend(
                self.flavour
                    .call_event_listener(listener.as_ref(), event)
                    .await?,
            );
        }
        Ok(commands)
    }
}
