//! The functional flavour: business functions work with custom typed messages and states.
//!
//! A [FunctionalPort] converts plain messages received from the network into typed objects.
//! Business functions are pure: they receive the typed command (and the current state for
//! existing aggregates) and yield [TypedEvent]s. Apply functions take the previous state by
//! value and return the next one.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;

use super::{aggregate_id_from_payload, with_causation, Events, Flavour};
use crate::callable::{
    context_as, AggregateFactoryFn, AggregateFn, ApplyFn, ContextProviderFn, Yielded, Yields,
};
use crate::projection::Projector;
use crate::{
    Callable, Commands, Context, Error, EventListener, Message, MessageBag, MessageFactory,
    MessageType, Payload, QueryResolver, State, TypedData, TypedEvent, TypedMessage,
};

/// Converts between plain messages and custom typed messages.
pub trait FunctionalPort: Send + Sync {
    /// Deserializes the payload of a plain message into its typed object.
    fn deserialize(&self, message: &Message) -> Result<Arc<dyn TypedData>, Error>;

    /// Turns a typed message into its plain form.
    fn serialize_payload(&self, message: Message) -> Result<Message, Error> {
        message.to_raw()
    }

    /// Turns an event yielded by a business function into a message.
    fn decorate_event(&self, event: TypedEvent) -> Result<Message, Error> {
        Message::new(
            event.name(),
            MessageType::Event,
            Payload::Typed(MessageBag::new(event.into_data())),
        )
    }

    /// Extracts the aggregate id from a command.
    fn get_aggregate_id_from_command(
        &self,
        id_key: &str,
        command: &Message,
    ) -> Result<String, Error> {
        aggregate_id_from_payload(&command.payload_value()?, id_key, command)
    }
}

type Deserializer = fn(Map<String, Value>) -> Result<Arc<dyn TypedData>, Error>;

fn deserialize_typed<T: TypedMessage>(
    payload: Map<String, Value>,
) -> Result<Arc<dyn TypedData>, Error> {
    let data: T = serde_json::from_value(Value::Object(payload))?;
    Ok(Arc::new(data))
}

/// A [FunctionalPort] backed by a registry of [TypedMessage]s.
///
/// ```
/// # use augure::{functional::TypedPort, MessageType, TypedMessage};
/// # #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
/// # struct RegisterUser { username: String }
/// # impl TypedMessage for RegisterUser {
/// #     const NAME: &'static str = "RegisterUser";
/// #     const MESSAGE_TYPE: MessageType = MessageType::Command;
/// # }
/// let port = TypedPort::new().register::<RegisterUser>();
/// ```
#[derive(Default, Clone)]
pub struct TypedPort {
    deserializers: HashMap<&'static str, Deserializer>,
}

impl TypedPort {
    /// Creates an empty port.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed message.
    pub fn register<T: TypedMessage>(mut self) -> Self {
        self.deserializers.insert(T::NAME, deserialize_typed::<T>);
        self
    }
}

impl FunctionalPort for TypedPort {
    fn deserialize(&self, message: &Message) -> Result<Arc<dyn TypedData>, Error> {
        let deserializer = self
            .deserializers
            .get(message.name())
            .ok_or_else(|| Error::UnknownMessage(message.name().to_string()))?;
        deserializer(message.payload_value()?)
    }
}

/// A [Flavour] for pure functions over custom typed messages.
///
/// Messages are validated by the message factory when they are turned back into their plain
/// form, before being persisted or published.
#[derive(Clone)]
pub struct FunctionalFlavour {
    port: Arc<dyn FunctionalPort>,
    message_factory: Arc<dyn MessageFactory>,
}

impl FunctionalFlavour {
    /// Creates a new functional flavour.
    pub fn new(port: Arc<dyn FunctionalPort>, message_factory: Arc<dyn MessageFactory>) -> Self {
        Self {
            port,
            message_factory,
        }
    }

    /// Decorates a plain message with its typed object. Typed messages are returned as is.
    pub fn decorate(&self, message: Message) -> Result<Message, Error> {
        match message.payload() {
            Payload::Typed(_) => Ok(message),
            Payload::Raw(_) => {
                let data = self.port.deserialize(&message)?;
                Ok(message.with_payload(Payload::Typed(MessageBag::new(data))))
            }
        }
    }

    pub(crate) fn decorate_event(
        &self,
        event: TypedEvent,
        command: &Message,
    ) -> Result<Message, Error> {
        Ok(with_causation(self.port.decorate_event(event)?, command))
    }

    fn to_events(&self, yields: Yields, command: &Message) -> Events {
        let flavour = self.clone();
        let command = command.clone();
        Box::new(yields.map(move |event| match event {
            None => Ok(None),
            Some(Yielded::Typed(event)) => flavour.decorate_event(event, &command).map(Some),
            Some(Yielded::Raw(event)) => Err(Error::configuration(format!(
                "{} was yielded as a raw event, the functional flavour expects typed events",
                event.name
            ))),
        }))
    }
}

#[async_trait]
impl Flavour for FunctionalFlavour {
    fn get_aggregate_id_from_command(
        &self,
        id_key: &str,
        command: &Message,
    ) -> Result<String, Error> {
        self.port.get_aggregate_id_from_command(id_key, command)
    }

    fn call_aggregate_factory(
        &self,
        _aggregate_type: &str,
        factory: &Callable,
        command: &Message,
        context: Option<&Context>,
    ) -> Result<Events, Error> {
        let yields = (factory.downcast::<AggregateFactoryFn>()?.0)(command, context)?;
        Ok(self.to_events(yields, command))
    }

    fn call_subsequent_aggregate_function(
        &self,
        _aggregate_type: &str,
        function: &Callable,
        state: &State,
        command: &Message,
        context: Option<&Context>,
    ) -> Result<Events, Error> {
        let yields = (function.downcast::<AggregateFn>()?.0)(state, command, context)?;
        Ok(self.to_events(yields, command))
    }

    fn call_apply_first_event(&self, apply: &Callable, event: &Message) -> Result<State, Error> {
        (apply.downcast::<ApplyFn>()?.0)(None, event)
    }

    fn call_apply_subsequent_event(
        &self,
        apply: &Callable,
        state: State,
        event: &Message,
    ) -> Result<State, Error> {
        (apply.downcast::<ApplyFn>()?.0)(Some(state), event)
    }

    fn prepare_network_transmission(&self, message: Message) -> Result<Message, Error> {
        let message = self.port.serialize_payload(message)?;
        self.message_factory
            .create_message_from_array(message.name(), message.to_value()?)
    }

    fn convert_message_received_from_network(
        &self,
        message: Message,
        _first_aggregate_event: bool,
    ) -> Result<Message, Error> {
        self.decorate(message)
    }

    fn convert_aggregate_state_to_value(
        &self,
        _aggregate_type: &str,
        state: &State,
    ) -> Result<Value, Error> {
        state.to_value()
    }

    async fn call_projector(
        &self,
        projector: &dyn Projector,
        app_version: &str,
        projection_name: &str,
        event: &Message,
    ) -> Result<(), Error> {
        let event = self.decorate(event.clone())?;
        projector.handle(app_version, projection_name, &event).await
    }

    async fn call_event_listener(
        &self,
        listener: &dyn EventListener,
        event: &Message,
    ) -> Result<Commands, Error> {
        let event = self.decorate(event.clone())?;
        listener.handle(&event).await
    }

    async fn call_query_resolver(
        &self,
        resolver: &dyn QueryResolver,
        query: &Message,
    ) -> Result<Value, Error> {
        let query = self.decorate(query.clone())?;
        resolver.resolve(&query).await
    }
}

fn into_typed_state<S: Any>(state: State) -> Result<S, Error> {
    match state {
        State::Typed(state) => state
            .into_any()
            .downcast::<S>()
            .map(|state| *state)
            .map_err(|_| Error::Downcast(type_name::<S>())),
        State::Raw(_) => Err(Error::Downcast(type_name::<S>())),
    }
}

fn typed_yields<I>(events: I) -> Yields
where
    I: IntoIterator<Item = Option<TypedEvent>>,
    I::IntoIter: Send + 'static,
{
    Box::new(events.into_iter().map(|event| event.map(Yielded::Typed)))
}

/// Creates the business function of a command creating a new aggregate.
///
/// `X` is the type of the value computed by the [context_provider] of the command, any type
/// can be used if the command has none.
///
/// ```ignore
/// functional::aggregate_factory(|command: &RegisterUser, _: Option<&()>| {
///     events![UserWasRegistered::from(command)]
/// })
/// ```
pub fn aggregate_factory<C, X, F, I>(factory: F) -> Callable
where
    C: TypedMessage,
    X: Any,
    F: Fn(&C, Option<&X>) -> I + Send + Sync + 'static,
    I: IntoIterator<Item = Option<TypedEvent>>,
    I::IntoIter: Send + 'static,
{
    Callable::new(AggregateFactoryFn(Box::new(move |command, context| {
        let command = command.deserialize::<C>()?;
        Ok(typed_yields(factory(&command, context_as(context)?)))
    })))
}

/// Creates the business function of a command handled by an existing aggregate.
pub fn aggregate_function<S, C, X, F, I>(function: F) -> Callable
where
    S: Any,
    C: TypedMessage,
    X: Any,
    F: Fn(&S, &C, Option<&X>) -> I + Send + Sync + 'static,
    I: IntoIterator<Item = Option<TypedEvent>>,
    I::IntoIter: Send + 'static,
{
    Callable::new(AggregateFn(Box::new(move |state, command, context| {
        let command = command.deserialize::<C>()?;
        Ok(typed_yields(function(
            state.downcast_ref::<S>()?,
            &command,
            context_as(context)?,
        )))
    })))
}

/// Creates an apply function. It receives `None` for the first event of an aggregate.
pub fn apply<S, E, F>(apply: F) -> Callable
where
    S: TypedData,
    E: TypedMessage,
    F: Fn(Option<S>, &E) -> S + Send + Sync + 'static,
{
    Callable::new(ApplyFn(Box::new(move |state, event| {
        let state = state.map(into_typed_state::<S>).transpose()?;
        let event = event.deserialize::<E>()?;
        Ok(State::Typed(Box::new(apply(state, &event))))
    })))
}

/// Creates a context provider computing a value of any type from a typed command.
pub fn context_provider<C, X, F>(provider: F) -> Callable
where
    C: TypedMessage,
    X: Any + Send + Sync,
    F: Fn(&C) -> Result<X, Error> + Send + Sync + 'static,
{
    Callable::new(ContextProviderFn(Box::new(move |command| {
        Ok(Context::new(provider(&command.deserialize::<C>()?)?))
    })))
}
