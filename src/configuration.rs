use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::ops::{Add, AddAssign};
use std::sync::Arc;

use crate::message::validate_name;
use crate::{
    AggregateDescription, Callable, CommandRoute, Error, EventApplyMap, EventListener,
    MessageSchema, MessageType, ProjectionDescription, QueryResolver, SchemaAssertion,
    SchemaMessageFactory, TypedMessage,
};

/// The stream events are appended to when a processor does not name one.
pub const DEFAULT_STREAM: &str = "event_stream";

/// The description of an application: its messages, how commands are processed, and what
/// reacts to events.
///
/// Implements [Add] and [AddAssign] for composition of multiple configurations. Nothing is
/// checked until [compile](Configuration::compile), which reports every inconsistency at once.
///
/// # Example
/// ```
/// use augure::{prototyping, Configuration, JsonSchema, Message, RawEvent};
/// use serde_json::json;
///
/// let configuration = Configuration::new()
///     .register_command("RegisterUser", JsonSchema::any_object())
///     .register_event("UserWasRegistered", JsonSchema::any_object())
///     .process("RegisterUser", |processor| {
///         processor
///             .with_new("User")
///             .handle(prototyping::aggregate_factory(|command: &Message, _| {
///                 vec![Some(RawEvent::new("UserWasRegistered", json!({ "userId": command.get("userId").ok() })))]
///             }))
///             .record_that("UserWasRegistered")
///             .apply(prototyping::apply(|_, event: &Message| json!(event.raw_payload())))
///     });
///
/// let compiled = configuration.compile().unwrap();
/// assert_eq!(compiled.aggregate("User").unwrap().aggregate_identifier_key, "userId");
/// ```
#[derive(Default)]
pub struct Configuration {
    messages: Vec<(String, MessageSchema)>,
    processors: Vec<CommandProcessorDescription>,
    pre_processors: Vec<(String, Callable)>,
    listeners: Vec<(String, Arc<dyn EventListener>)>,
    resolvers: Vec<(String, Arc<dyn QueryResolver>)>,
    projections: Vec<ProjectionDescription>,
}

impl Configuration {
    /// Creates a new empty [Configuration].
    pub fn new() -> Self {
        Self::default()
    }

    fn register(mut self, name: String, message_type: MessageType, schema: Value) -> Self {
        self.messages.push((
            name,
            MessageSchema {
                message_type,
                schema,
            },
        ));
        self
    }

    /// Registers a command and the JSON schema of its payload.
    pub fn register_command(self, name: impl Into<String>, schema: Value) -> Self {
        self.register(name.into(), MessageType::Command, schema)
    }

    /// Registers an event and the JSON schema of its payload.
    pub fn register_event(self, name: impl Into<String>, schema: Value) -> Self {
        self.register(name.into(), MessageType::Event, schema)
    }

    /// Registers a query, the JSON schema of its payload, and its resolver.
    pub fn register_query(
        mut self,
        name: impl Into<String>,
        schema: Value,
        resolver: impl QueryResolver + 'static,
    ) -> Self {
        let name = name.into();
        self.resolvers.push((name.clone(), Arc::new(resolver)));
        self.register(name, MessageType::Query, schema)
    }

    /// Registers a custom typed command or event under its own name.
    pub fn register_typed<T: TypedMessage>(self, schema: Value) -> Self {
        self.register(T::NAME.to_string(), T::MESSAGE_TYPE, schema)
    }

    /// Describes how a command is processed. Takes ownership and returns the configuration to
    /// allow chaining.
    pub fn process<F>(mut self, command: impl Into<String>, describe: F) -> Self
    where
        F: FnOnce(CommandProcessorDescription) -> CommandProcessorDescription,
    {
        self.processors
            .push(describe(CommandProcessorDescription::new(command.into())));
        self
    }

    /// Adds a pre-processor to a command. Pre-processors run in the order they are added.
    pub fn pre_process(mut self, command: impl Into<String>, pre_processor: Callable) -> Self {
        self.pre_processors.push((command.into(), pre_processor));
        self
    }

    /// Adds a listener to an event.
    pub fn on(mut self, event: impl Into<String>, listener: impl EventListener + 'static) -> Self {
        self.listeners.push((event.into(), Arc::new(listener)));
        self
    }

    /// Describes a projection fed by the events of a stream.
    pub fn watch<F>(mut self, stream: impl Into<String>, describe: F) -> Self
    where
        F: FnOnce(ProjectionDescription) -> ProjectionDescription,
    {
        self.projections
            .push(describe(ProjectionDescription::new(stream.into())));
        self
    }

    /// Checks the configuration and freezes it.
    ///
    /// Fails with [Error::Configuration] listing every problem found.
    pub fn compile(self) -> Result<CompiledConfiguration, Error> {
        let mut errors = Vec::new();

        let mut messages = HashMap::new();
        for (name, schema) in self.messages {
            if let Err(error) = validate_name(&name) {
                errors.push(error.to_string());
            } else if messages.insert(name.clone(), schema).is_some() {
                errors.push(format!("Message {name} is registered more than once"));
            }
        }
        let check_message = |name: &str, expected: MessageType| match messages.get(name) {
            Some(message) if message.message_type == expected => None,
            Some(message) => Some(format!(
                "{name} is registered as {}, expected {expected}",
                message.message_type
            )),
            None => Some(format!("{expected} {name} is not registered")),
        };

        let mut pre_processors: HashMap<String, Vec<Callable>> = HashMap::new();
        for (command, pre_processor) in self.pre_processors {
            pre_processors.entry(command).or_default().push(pre_processor);
        }

        let mut aggregates: HashMap<String, AggregateDraft> = HashMap::new();
        let mut routes = HashMap::new();
        for processor in self.processors {
            let command = processor.command_name;
            errors.extend(processor.errors.into_iter().map(|error| format!("{command}: {error}")));
            errors.extend(check_message(&command, MessageType::Command));
            let Some(aggregate_type) = processor.aggregate_type else {
                errors.push(format!("{command}: call with_new or with_existing"));
                continue;
            };
            let Some(business_function) = processor.business_function else {
                errors.push(format!("{command}: missing business function, call handle"));
                continue;
            };
            let identifier_key = processor
                .identifier_key
                .unwrap_or_else(|| default_identifier_key(&aggregate_type));
            let stream_name = processor
                .stream_name
                .unwrap_or_else(|| DEFAULT_STREAM.to_string());

            let aggregate = aggregates
                .entry(aggregate_type.clone())
                .or_insert_with(|| AggregateDraft {
                    identifier_key: identifier_key.clone(),
                    stream_name: stream_name.clone(),
                    ..Default::default()
                });
            if aggregate.identifier_key != identifier_key {
                errors.push(format!(
                    "{command}: aggregate {aggregate_type} is identified by {}, not {identifier_key}",
                    aggregate.identifier_key
                ));
            }
            if aggregate.stream_name != stream_name {
                errors.push(format!(
                    "{command}: events of aggregate {aggregate_type} are stored in {}, not {stream_name}",
                    aggregate.stream_name
                ));
            }
            aggregate.has_factory |= processor.creates_aggregate;

            let mut recorded_events = Vec::new();
            for (event, apply) in processor.recorded_events {
                errors.extend(check_message(&event, MessageType::Event));
                aggregate.recorded_events.insert(event.clone());
                if let Some(apply) = apply {
                    if aggregate.event_apply_map.insert(event.clone(), apply).is_some() {
                        errors.push(format!(
                            "{command}: apply function for {event} is defined more than once on aggregate {aggregate_type}"
                        ));
                    }
                }
                recorded_events.push(event);
            }

            let route = CommandRoute {
                command_name: command.clone(),
                aggregate_type,
                creates_aggregate: processor.creates_aggregate,
                aggregate_identifier_key: identifier_key,
                business_function,
                context_provider: processor.context_provider,
                pre_processors: pre_processors.remove(&command).unwrap_or_default(),
                recorded_events,
            };
            if routes.insert(command.clone(), Arc::new(route)).is_some() {
                errors.push(format!("Command {command} has more than one processor"));
            }
        }
        for command in pre_processors.keys() {
            errors.push(format!("Pre-processor for {command}, which has no processor"));
        }

        let aggregates: HashMap<String, Arc<AggregateDescription>> = aggregates
            .into_iter()
            .map(|(aggregate_type, draft)| {
                if !draft.has_factory {
                    errors.push(format!(
                        "Aggregate {aggregate_type} is only used with with_existing, no command creates it"
                    ));
                }
                for event in &draft.recorded_events {
                    if !draft.event_apply_map.contains_key(event) {
                        errors.push(format!(
                            "Aggregate {aggregate_type} records {event} but has no apply function for it"
                        ));
                    }
                }
                let description = AggregateDescription {
                    aggregate_type: aggregate_type.clone(),
                    aggregate_identifier_key: draft.identifier_key,
                    stream_name: draft.stream_name,
                    event_apply_map: draft.event_apply_map,
                };
                (aggregate_type, Arc::new(description))
            })
            .collect();

        let mut listeners: HashMap<String, Vec<Arc<dyn EventListener>>> = HashMap::new();
        for (event, listener) in self.listeners {
            errors.extend(check_message(&event, MessageType::Event));
            listeners.entry(event).or_default().push(listener);
        }

        let mut resolvers = HashMap::new();
        for (query, resolver) in self.resolvers {
            if resolvers.insert(query.clone(), resolver).is_some() {
                errors.push(format!("Query {query} has more than one resolver"));
            }
        }

        let mut projection_names = BTreeSet::new();
        for projection in &self.projections {
            errors.extend(projection.errors());
            let Some(name) = projection.name() else {
                errors.push(format!(
                    "Projection of stream {} needs with_aggregate_projection or with_projection",
                    projection.stream()
                ));
                continue;
            };
            if !projection_names.insert(name.to_string()) {
                errors.push(format!("Projection {name} is defined more than once"));
            }
            if let Some(aggregate_type) = projection.aggregate_type() {
                if !aggregates.contains_key(aggregate_type) {
                    errors.push(format!("Projection {name}: unknown aggregate type {aggregate_type}"));
                }
            }
            for event in projection.events().into_iter().flatten() {
                errors.extend(check_message(event.as_str(), MessageType::Event));
            }
        }

        if !errors.is_empty() {
            return Err(Error::configuration(errors.join("; ")));
        }
        log::debug!(
            "Compiled configuration with {} messages, {} aggregates and {} projections",
            messages.len(),
            aggregates.len(),
            self.projections.len()
        );
        Ok(CompiledConfiguration {
            messages,
            aggregates,
            routes,
            listeners,
            resolvers,
            projections: self.projections,
        })
    }
}

impl Add for Configuration {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl AddAssign for Configuration {
    fn add_assign(&mut self, rhs: Self) {
        self.messages.extend(rhs.messages);
        self.processors.extend(rhs.processors);
        self.pre_processors.extend(rhs.pre_processors);
        self.listeners.extend(rhs.listeners);
        self.resolvers.extend(rhs.resolvers);
        self.projections.extend(rhs.projections);
    }
}

#[derive(Default)]
struct AggregateDraft {
    identifier_key: String,
    stream_name: String,
    has_factory: bool,
    recorded_events: BTreeSet<String>,
    event_apply_map: EventApplyMap,
}

/// `User` is identified by `userId`.
fn default_identifier_key(aggregate_type: &str) -> String {
    let mut chars = aggregate_type.chars();
    match chars.next() {
        Some(first) => format!("{}{}Id", first.to_lowercase(), chars.as_str()),
        None => "id".to_string(),
    }
}

/// How a command is processed: the aggregate it targets, the business function, and the
/// events it may record with their apply functions.
///
/// Misuses of the builder are reported by [Configuration::compile].
pub struct CommandProcessorDescription {
    command_name: String,
    aggregate_type: Option<String>,
    creates_aggregate: bool,
    identifier_key: Option<String>,
    business_function: Option<Callable>,
    context_provider: Option<Callable>,
    stream_name: Option<String>,
    recorded_events: Vec<(String, Option<Callable>)>,
    errors: Vec<String>,
}

impl CommandProcessorDescription {
    fn new(command_name: String) -> Self {
        Self {
            command_name,
            aggregate_type: None,
            creates_aggregate: false,
            identifier_key: None,
            business_function: None,
            context_provider: None,
            stream_name: None,
            recorded_events: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn target(mut self, aggregate_type: String, creates_aggregate: bool) -> Self {
        if let Some(current) = &self.aggregate_type {
            self.errors
                .push(format!("already targets aggregate {current}, cannot target {aggregate_type}"));
        }
        self.aggregate_type = Some(aggregate_type);
        self.creates_aggregate = creates_aggregate;
        self
    }

    /// The command creates a new aggregate of the given type.
    pub fn with_new(self, aggregate_type: impl Into<String>) -> Self {
        self.target(aggregate_type.into(), true)
    }

    /// The command targets an existing aggregate of the given type.
    pub fn with_existing(self, aggregate_type: impl Into<String>) -> Self {
        self.target(aggregate_type.into(), false)
    }

    /// The payload key holding the aggregate id. Defaults to the aggregate type in lower camel
    /// case followed by `Id`.
    pub fn identified_by(mut self, key: impl Into<String>) -> Self {
        if self.aggregate_type.is_none() {
            self.errors
                .push("identified_by must be called after with_new or with_existing".into());
        }
        self.identifier_key = Some(key.into());
        self
    }

    /// The business function, built with the constructors of the flavour in use.
    pub fn handle(mut self, business_function: Callable) -> Self {
        if self.business_function.is_some() {
            self.errors.push("handle is called more than once".into());
        }
        self.business_function = Some(business_function);
        self
    }

    /// Computes a context passed to the business function.
    pub fn provide_context(mut self, provider: Callable) -> Self {
        self.context_provider = Some(provider);
        self
    }

    /// The stream events are appended to. Defaults to [DEFAULT_STREAM].
    pub fn store_events_in(mut self, stream: impl Into<String>) -> Self {
        self.stream_name = Some(stream.into());
        self
    }

    /// An event the business function may record.
    pub fn record_that(mut self, event: impl Into<String>) -> Self {
        self.recorded_events.push((event.into(), None));
        self
    }

    /// An alternative event the business function may record instead, such as a failure
    /// event.
    pub fn or_record_that(mut self, event: impl Into<String>) -> Self {
        if self.recorded_events.is_empty() {
            self.errors
                .push("or_record_that must be called after record_that".into());
        }
        self.recorded_events.push((event.into(), None));
        self
    }

    /// The apply function of the last recorded event.
    pub fn apply(mut self, apply: Callable) -> Self {
        match self.recorded_events.last_mut() {
            None => self
                .errors
                .push("apply must be called after record_that".into()),
            Some((event, Some(_))) => self
                .errors
                .push(format!("apply is called more than once for {event}")),
            Some((_, slot)) => *slot = Some(apply),
        }
        self
    }
}

/// A checked [Configuration], ready to build an [EventMachine](crate::EventMachine).
pub struct CompiledConfiguration {
    pub(crate) messages: HashMap<String, MessageSchema>,
    pub(crate) aggregates: HashMap<String, Arc<AggregateDescription>>,
    pub(crate) routes: HashMap<String, Arc<CommandRoute>>,
    pub(crate) listeners: HashMap<String, Vec<Arc<dyn EventListener>>>,
    pub(crate) resolvers: HashMap<String, Arc<dyn QueryResolver>>,
    pub(crate) projections: Vec<ProjectionDescription>,
}

impl CompiledConfiguration {
    /// Creates a message factory validating payloads against the registered schemas.
    pub fn message_factory(&self, assertion: Arc<dyn SchemaAssertion>) -> Arc<SchemaMessageFactory> {
        Arc::new(SchemaMessageFactory::new(self.messages.clone(), assertion))
    }

    /// The registered messages.
    pub fn messages(&self) -> &HashMap<String, MessageSchema> {
        &self.messages
    }

    /// The description of an aggregate type.
    pub fn aggregate(&self, aggregate_type: &str) -> Option<&AggregateDescription> {
        self.aggregates.get(aggregate_type).map(Arc::as_ref)
    }

    /// The route of a command.
    pub fn route(&self, command: &str) -> Option<&CommandRoute> {
        self.routes.get(command).map(Arc::as_ref)
    }

    /// Every event stream used by an aggregate or watched by a projection, sorted.
    pub fn streams(&self) -> Vec<String> {
        let streams: BTreeSet<&str> = self
            .aggregates
            .values()
            .map(|aggregate| aggregate.stream_name.as_str())
            .chain(self.projections.iter().map(ProjectionDescription::stream))
            .collect();
        streams.into_iter().map(str::to_string).collect()
    }
}
