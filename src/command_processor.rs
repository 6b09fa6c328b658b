use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    meta, AggregateDescription, AggregateRepository, Callable, Error, Flavour,
    GenericAggregateRoot, Message, Snapshot,
};

/// The compiled description of how a command is processed.
#[derive(Debug, Clone)]
pub struct CommandRoute {
    /// The name of the command.
    pub command_name: String,
    /// The type of the targeted aggregate.
    pub aggregate_type: String,
    /// Whether the command creates a new aggregate.
    pub creates_aggregate: bool,
    /// The payload key holding the aggregate id.
    pub aggregate_identifier_key: String,
    /// The business function.
    pub business_function: Callable,
    /// The context provider, if any.
    pub context_provider: Option<Callable>,
    /// The pre-processors, run in order.
    pub pre_processors: Vec<Callable>,
    /// The events the business function may record.
    pub recorded_events: Vec<String>,
}

/// The result of processing a command.
#[derive(Debug, Default)]
pub struct CommandOutcome {
    /// The persisted events, in their plain form.
    pub events: Vec<Message>,
    /// Whether a pre-processor stopped the dispatch.
    pub stopped: bool,
    pub(crate) snapshot: Option<Snapshot>,
}

/// Processes one command: loads or creates the aggregate, calls the business function,
/// records the yielded events, and appends them to the event store.
pub struct CommandProcessor {
    route: Arc<CommandRoute>,
    description: Arc<AggregateDescription>,
    flavour: Arc<dyn Flavour>,
    repository: Arc<AggregateRepository>,
}

impl CommandProcessor {
    /// Creates a processor for a route.
    pub fn new(
        route: Arc<CommandRoute>,
        flavour: Arc<dyn Flavour>,
        repository: Arc<AggregateRepository>,
    ) -> Result<Self, Error> {
        let description = Arc::clone(repository.description(&route.aggregate_type)?);
        Ok(Self {
            route,
            description,
            flavour,
            repository,
        })
    }

    /// Processes a command.
    ///
    /// Nothing is persisted unless every yielded event has been recorded. Events missing from
    /// the `record_that` declarations of the command fail with [Error::UndeclaredEvent]. Fails with
    /// [Error::ConcurrencyConflict] if another writer modified the aggregate in between.
    pub async fn process(&self, command: Message) -> Result<CommandOutcome, Error> {
        if command.name() != self.route.command_name {
            return Err(Error::RoutingMismatch {
                expected: self.route.command_name.clone(),
                actual: command.name().to_string(),
            });
        }
        let mut command = self
            .flavour
            .convert_message_received_from_network(command, false)?;
        for pre_processor in &self.route.pre_processors {
            command = self
                .flavour
                .call_command_pre_processor(pre_processor, command)?;
            if command.meta(meta::STOP_DISPATCH) == Some(&Value::Bool(true)) {
                log::debug!("Dispatch of {} stopped by a pre-processor", command.name());
                return Ok(CommandOutcome {
                    stopped: true,
                    ..Default::default()
                });
            }
        }

        let aggregate_type = self.route.aggregate_type.as_str();
        let aggregate_id = self
            .flavour
            .get_aggregate_id_from_command(&self.route.aggregate_identifier_key, &command)?;
        let context = self
            .route
            .context_provider
            .as_ref()
            .map(|provider| self.flavour.call_context_provider(provider, &command))
            .transpose()?;

        let (mut aggregate, events) = if self.route.creates_aggregate {
            let aggregate = GenericAggregateRoot::new(
                aggregate_id,
                Arc::clone(&self.description),
                Arc::clone(&self.flavour),
            );
            let events = self.flavour.call_aggregate_factory(
                aggregate_type,
                &self.route.business_function,
                &command,
                context.as_ref(),
            )?;
            (aggregate, events)
        } else {
            let aggregate = self.repository.load(aggregate_type, &aggregate_id).await?;
            let state = aggregate.state().ok_or_else(|| Error::AggregateNotFound {
                aggregate_type: aggregate_type.to_string(),
                aggregate_id: aggregate_id.clone(),
            })?;
            let events = self.flavour.call_subsequent_aggregate_function(
                aggregate_type,
                &self.route.business_function,
                state,
                &command,
                context.as_ref(),
            )?;
            (aggregate, events)
        };

        let expected_version = aggregate.version();
        for event in events {
            if let Some(event) = event? {
                if !self.route.recorded_events.iter().any(|name| name == event.name()) {
                    return Err(Error::UndeclaredEvent {
                        command: command.name().to_string(),
                        event: event.name().to_string(),
                    });
                }
                aggregate.record_that(event)?;
            }
        }
        log::debug!(
            "{} recorded {} events on {aggregate_type} {}",
            command.name(),
            aggregate.version() - expected_version,
            aggregate.aggregate_id()
        );

        let events = self
            .repository
            .persist(&mut aggregate, expected_version)
            .await?;
        Ok(CommandOutcome {
            events,
            stopped: false,
            snapshot: self.repository.snapshot_due(&aggregate, expected_version),
        })
    }
}

/// Finds the processor of a command.
pub struct CommandRouter {
    routes: HashMap<String, Arc<CommandRoute>>,
    flavour: Arc<dyn Flavour>,
    repository: Arc<AggregateRepository>,
}

impl CommandRouter {
    /// Creates a router over compiled routes.
    pub fn new(
        routes: HashMap<String, Arc<CommandRoute>>,
        flavour: Arc<dyn Flavour>,
        repository: Arc<AggregateRepository>,
    ) -> Self {
        Self {
            routes,
            flavour,
            repository,
        }
    }

    /// Whether a command is routed.
    pub fn handles(&self, command_name: &str) -> bool {
        self.routes.contains_key(command_name)
    }

    /// Returns the processor of a command. Fails with [Error::NoHandler] if the command is not
    /// routed.
    pub fn route(&self, command: &Message) -> Result<CommandProcessor, Error> {
        let route = self
            .routes
            .get(command.name())
            .ok_or_else(|| Error::NoHandler(command.name().to_string()))?;
        log::debug!(
            "Routing {} to aggregate {}",
            command.name(),
            route.aggregate_type
        );
        CommandProcessor::new(
            Arc::clone(route),
            Arc::clone(&self.flavour),
            Arc::clone(&self.repository),
        )
    }
}
