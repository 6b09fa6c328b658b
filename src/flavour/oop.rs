//! The object-oriented flavour: aggregates are stateful objects recording their own events.
//!
//! Command methods mutate the aggregate and record [TypedEvent]s, which are popped by the
//! flavour and decorated with the aggregate instance. Applying such an event simply hands the
//! attached aggregate back. When an aggregate is loaded from history, it is reconstituted from
//! its first event and the following events are applied to it.

use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;

use super::{Events, Flavour, FunctionalFlavour};
use crate::callable::context_as;
use crate::message::downcast_mut;
use crate::projection::Projector;
use crate::{
    Callable, Commands, Context, Error, EventListener, Message, Payload, QueryResolver, State,
    TypedData, TypedEvent, TypedMessage,
};

/// An event-sourced object.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize)]
/// struct User {
///     username: String,
///     #[serde(skip)]
///     recorded: Vec<TypedEvent>,
/// }
///
/// impl User {
///     fn register(command: &RegisterUser) -> User { ... }
///     fn change_username(&mut self, command: &ChangeUsername) { ... }
/// }
///
/// impl OopAggregate for User {
///     fn reconstitute(first_event: &Message) -> Result<Self, Error> { ... }
///     fn apply(&mut self, event: &Message) -> Result<(), Error> { ... }
///     fn pop_recorded_events(&mut self) -> Vec<TypedEvent> {
///         std::mem::take(&mut self.recorded)
///     }
/// }
/// ```
pub trait OopAggregate: Serialize + Clone + Debug + Send + Sync + 'static {
    /// Creates the aggregate from the first event of its history.
    fn reconstitute(first_event: &Message) -> Result<Self, Error>;

    /// Applies an event of the history.
    fn apply(&mut self, event: &Message) -> Result<(), Error>;

    /// Returns and clears the events recorded since the last call.
    fn pop_recorded_events(&mut self) -> Vec<TypedEvent>;
}

/// Calls aggregate objects on behalf of the [OopFlavour].
pub trait OopPort: Send + Sync {
    /// Calls the factory creating a new aggregate.
    fn call_aggregate_factory(
        &self,
        aggregate_type: &str,
        factory: &Callable,
        command: &Message,
        context: Option<&Context>,
    ) -> Result<Box<dyn TypedData>, Error>;

    /// Calls a command method of an existing aggregate.
    fn call_aggregate_with_command(
        &self,
        aggregate: &mut dyn TypedData,
        method: &Callable,
        command: &Message,
        context: Option<&Context>,
    ) -> Result<(), Error>;

    /// Returns and clears the events recorded by an aggregate.
    fn pop_recorded_events(
        &self,
        aggregate_type: &str,
        aggregate: &mut dyn TypedData,
    ) -> Result<Vec<TypedEvent>, Error>;

    /// Applies an event of the history to an aggregate.
    fn apply_event(
        &self,
        aggregate_type: &str,
        aggregate: &mut dyn TypedData,
        event: &Message,
    ) -> Result<(), Error>;

    /// Serializes an aggregate, for read models and snapshots.
    fn serialize_aggregate(
        &self,
        _aggregate_type: &str,
        aggregate: &dyn TypedData,
    ) -> Result<Value, Error> {
        aggregate.to_value()
    }

    /// Creates an aggregate from the first event of its history.
    fn reconstitute_aggregate(
        &self,
        aggregate_type: &str,
        first_event: &Message,
    ) -> Result<Box<dyn TypedData>, Error>;
}

type Reconstitute = fn(&Message) -> Result<Box<dyn TypedData>, Error>;
type ApplyEvent = fn(&mut dyn TypedData, &Message) -> Result<(), Error>;
type PopRecordedEvents = fn(&mut dyn TypedData) -> Result<Vec<TypedEvent>, Error>;

#[derive(Clone, Copy)]
struct AggregateFns {
    reconstitute: Reconstitute,
    apply: ApplyEvent,
    pop_recorded_events: PopRecordedEvents,
}

impl AggregateFns {
    fn of<A: OopAggregate>() -> Self {
        Self {
            reconstitute: |event| {
                let aggregate: Box<dyn TypedData> = Box::new(A::reconstitute(event)?);
                Ok(aggregate)
            },
            apply: |aggregate, event| downcast_mut::<A>(aggregate)?.apply(event),
            pop_recorded_events: |aggregate| {
                Ok(downcast_mut::<A>(aggregate)?.pop_recorded_events())
            },
        }
    }
}

pub(crate) struct OopFactoryFn(
    Box<dyn Fn(&Message, Option<&Context>) -> Result<Box<dyn TypedData>, Error> + Send + Sync>,
);

type BoxedOopMethodFn =
    Box<dyn Fn(&mut dyn TypedData, &Message, Option<&Context>) -> Result<(), Error> + Send + Sync>;

pub(crate) struct OopMethodFn(BoxedOopMethodFn);

pub(crate) struct UseAggregate;

/// An [OopPort] backed by a registry of [OopAggregate] types.
#[derive(Default, Clone)]
pub struct AggregatePort {
    aggregates: HashMap<String, AggregateFns>,
}

impl AggregatePort {
    /// Creates an empty port.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the implementation of an aggregate type.
    pub fn register<A: OopAggregate>(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregates
            .insert(aggregate_type.into(), AggregateFns::of::<A>());
        self
    }

    fn aggregate(&self, aggregate_type: &str) -> Result<AggregateFns, Error> {
        self.aggregates.get(aggregate_type).copied().ok_or_else(|| {
            Error::configuration(format!("No aggregate registered for type {aggregate_type}"))
        })
    }
}

impl OopPort for AggregatePort {
    fn call_aggregate_factory(
        &self,
        _aggregate_type: &str,
        factory: &Callable,
        command: &Message,
        context: Option<&Context>,
    ) -> Result<Box<dyn TypedData>, Error> {
        (factory.downcast::<OopFactoryFn>()?.0)(command, context)
    }

    fn call_aggregate_with_command(
        &self,
        aggregate: &mut dyn TypedData,
        method: &Callable,
        command: &Message,
        context: Option<&Context>,
    ) -> Result<(), Error> {
        (method.downcast::<OopMethodFn>()?.0)(aggregate, command, context)
    }

    fn pop_recorded_events(
        &self,
        aggregate_type: &str,
        aggregate: &mut dyn TypedData,
    ) -> Result<Vec<TypedEvent>, Error> {
        (self.aggregate(aggregate_type)?.pop_recorded_events)(aggregate)
    }

    fn apply_event(
        &self,
        aggregate_type: &str,
        aggregate: &mut dyn TypedData,
        event: &Message,
    ) -> Result<(), Error> {
        (self.aggregate(aggregate_type)?.apply)(aggregate, event)
    }

    fn reconstitute_aggregate(
        &self,
        aggregate_type: &str,
        first_event: &Message,
    ) -> Result<Box<dyn TypedData>, Error> {
        (self.aggregate(aggregate_type)?.reconstitute)(first_event)
    }
}

/// A [Flavour] for stateful aggregate objects.
///
/// Messages are converted by the wrapped [FunctionalFlavour].
pub struct OopFlavour {
    port: Arc<dyn OopPort>,
    functional: FunctionalFlavour,
}

impl OopFlavour {
    /// Creates a new object-oriented flavour.
    pub fn new(port: Arc<dyn OopPort>, functional: FunctionalFlavour) -> Self {
        Self { port, functional }
    }

    fn recorded_events(
        &self,
        aggregate_type: &str,
        mut aggregate: Box<dyn TypedData>,
        command: &Message,
    ) -> Result<Events, Error> {
        let recorded = self
            .port
            .pop_recorded_events(aggregate_type, aggregate.as_mut())?;
        let aggregate: Arc<dyn TypedData> = Arc::from(aggregate);
        let events = recorded
            .into_iter()
            .map(|event| -> Result<Option<Message>, Error> {
                let event = self.functional.decorate_event(event, command)?;
                Ok(Some(attach_aggregate(event, Arc::clone(&aggregate))))
            })
            .collect::<Vec<_>>();
        Ok(Box::new(events.into_iter()))
    }
}

fn attach_aggregate(event: Message, aggregate: Arc<dyn TypedData>) -> Message {
    match event.payload() {
        Payload::Typed(bag) => {
            let bag = bag.clone().with_aggregate(aggregate);
            event.with_payload(Payload::Typed(bag))
        }
        Payload::Raw(_) => event,
    }
}

fn attached_aggregate(event: &Message) -> Option<State> {
    event
        .bag()
        .and_then(|bag| bag.aggregate())
        .map(|aggregate| State::Typed(aggregate.clone_boxed()))
}

fn aggregate_type_of(event: &Message) -> Result<&str, Error> {
    event.aggregate_type().ok_or_else(|| {
        Error::configuration(format!(
            "Event {} does not carry its aggregate type",
            event.name()
        ))
    })
}

#[async_trait]
impl Flavour for OopFlavour {
    fn call_command_pre_processor(
        &self,
        pre_processor: &Callable,
        command: Message,
    ) -> Result<Message, Error> {
        self.functional
            .call_command_pre_processor(pre_processor, command)
    }

    fn get_aggregate_id_from_command(
        &self,
        id_key: &str,
        command: &Message,
    ) -> Result<String, Error> {
        self.functional.get_aggregate_id_from_command(id_key, command)
    }

    fn call_context_provider(
        &self,
        provider: &Callable,
        command: &Message,
    ) -> Result<Context, Error> {
        self.functional.call_context_provider(provider, command)
    }

    fn call_aggregate_factory(
        &self,
        aggregate_type: &str,
        factory: &Callable,
        command: &Message,
        context: Option<&Context>,
    ) -> Result<Events, Error> {
        let aggregate = self
            .port
            .call_aggregate_factory(aggregate_type, factory, command, context)?;
        self.recorded_events(aggregate_type, aggregate, command)
    }

    fn call_subsequent_aggregate_function(
        &self,
        aggregate_type: &str,
        function: &Callable,
        state: &State,
        command: &Message,
        context: Option<&Context>,
    ) -> Result<Events, Error> {
        let State::Typed(aggregate) = state else {
            return Err(Error::Downcast("dyn OopAggregate"));
        };
        let mut aggregate = aggregate.clone_boxed();
        self.port
            .call_aggregate_with_command(aggregate.as_mut(), function, command, context)?;
        self.recorded_events(aggregate_type, aggregate, command)
    }

    fn call_apply_first_event(&self, _apply: &Callable, event: &Message) -> Result<State, Error> {
        attached_aggregate(event).ok_or_else(|| {
            Error::configuration(format!(
                "Event {} is not attached to an aggregate",
                event.name()
            ))
        })
    }

    fn call_apply_subsequent_event(
        &self,
        _apply: &Callable,
        mut state: State,
        event: &Message,
    ) -> Result<State, Error> {
        if let Some(aggregate) = attached_aggregate(event) {
            return Ok(aggregate);
        }
        self.port
            .apply_event(aggregate_type_of(event)?, state.typed_mut()?, event)?;
        Ok(state)
    }

    fn prepare_network_transmission(&self, message: Message) -> Result<Message, Error> {
        self.functional.prepare_network_transmission(message)
    }

    fn convert_message_received_from_network(
        &self,
        message: Message,
        first_aggregate_event: bool,
    ) -> Result<Message, Error> {
        let message = self
            .functional
            .convert_message_received_from_network(message, first_aggregate_event)?;
        if !first_aggregate_event {
            return Ok(message);
        }
        let aggregate = self
            .port
            .reconstitute_aggregate(aggregate_type_of(&message)?, &message)?;
        Ok(attach_aggregate(message, Arc::from(aggregate)))
    }

    fn convert_aggregate_state_to_value(
        &self,
        aggregate_type: &str,
        state: &State,
    ) -> Result<Value, Error> {
        match state {
            State::Typed(aggregate) => self
                .port
                .serialize_aggregate(aggregate_type, aggregate.as_ref()),
            State::Raw(value) => Ok(value.clone()),
        }
    }

    async fn call_projector(
        &self,
        projector: &dyn Projector,
        app_version: &str,
        projection_name: &str,
        event: &Message,
    ) -> Result<(), Error> {
        self.functional
            .call_projector(projector, app_version, projection_name, event)
            .await
    }

    async fn call_event_listener(
        &self,
        listener: &dyn EventListener,
        event: &Message,
    ) -> Result<Commands, Error> {
        self.functional.call_event_listener(listener, event).await
    }

    async fn call_query_resolver(
        &self,
        resolver: &dyn QueryResolver,
        query: &Message,
    ) -> Result<Value, Error> {
        self.functional.call_query_resolver(resolver, query).await
    }
}

/// Creates the factory of a command creating a new aggregate.
///
/// The factory returns the new aggregate, which has recorded its first events.
pub fn aggregate_factory<A, C, X, F>(factory: F) -> Callable
where
    A: OopAggregate,
    C: TypedMessage,
    X: Any,
    F: Fn(&C, Option<&X>) -> Result<A, Error> + Send + Sync + 'static,
{
    Callable::new(OopFactoryFn(Box::new(move |command, context| {
        let command = command.deserialize::<C>()?;
        let aggregate: Box<dyn TypedData> = Box::new(factory(&command, context_as(context)?)?);
        Ok(aggregate)
    })))
}

/// Creates a command method of an existing aggregate.
pub fn aggregate_method<A, C, X, F>(method: F) -> Callable
where
    A: OopAggregate,
    C: TypedMessage,
    X: Any,
    F: Fn(&mut A, &C, Option<&X>) -> Result<(), Error> + Send + Sync + 'static,
{
    Callable::new(OopMethodFn(Box::new(move |aggregate, command, context| {
        let command = command.deserialize::<C>()?;
        method(downcast_mut(aggregate)?, &command, context_as(context)?)
    })))
}

/// The apply function of object-oriented aggregates: events are applied by the aggregate
/// itself.
pub fn use_aggregate() -> Callable {
    Callable::new(UseAggregate)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::functional::TypedPort;
    use crate::{
        meta, BasicSchemaAssertion, JsonSchema, MessageSchema, MessageType, SchemaMessageFactory,
    };
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct RegisterUser {
        username: String,
    }

    impl TypedMessage for RegisterUser {
        const NAME: &'static str = "RegisterUser";
        const MESSAGE_TYPE: MessageType = MessageType::Command;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ChangeUsername {
        username: String,
    }

    impl TypedMessage for ChangeUsername {
        const NAME: &'static str = "ChangeUsername";
        const MESSAGE_TYPE: MessageType = MessageType::Command;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct UsernameSet {
        username: String,
    }

    impl TypedMessage for UsernameSet {
        const NAME: &'static str = "UsernameSet";
        const MESSAGE_TYPE: MessageType = MessageType::Event;
    }

    #[derive(Debug, Clone, Serialize)]
    struct User {
        username: String,
        #[serde(skip)]
        recorded: Vec<TypedEvent>,
    }

    impl User {
        fn set_username(&mut self, username: &str) {
            self.username = username.to_string();
            self.recorded.push(
                UsernameSet {
                    username: username.to_string(),
                }
                .into(),
            );
        }
    }

    impl OopAggregate for User {
        fn reconstitute(first_event: &Message) -> Result<Self, Error> {
            let mut user = User {
                username: String::new(),
                recorded: vec![],
            };
            user.apply(first_event)?;
            Ok(user)
        }

        fn apply(&mut self, event: &Message) -> Result<(), Error> {
            self.username = event.deserialize::<UsernameSet>()?.username;
            Ok(())
        }

        fn pop_recorded_events(&mut self) -> Vec<TypedEvent> {
            std::mem::take(&mut self.recorded)
        }
    }

    fn flavour() -> OopFlavour {
        OopFlavour::new(
            Arc::new(AggregatePort::new().register::<User>("User")),
            FunctionalFlavour::new(
                Arc::new(
                    TypedPort::new()
                        .register::<RegisterUser>()
                        .register::<ChangeUsername>()
                        .register::<UsernameSet>(),
                ),
                Arc::new(SchemaMessageFactory::new(
                    messages(),
                    Arc::new(BasicSchemaAssertion),
                )),
            ),
        )
    }

    fn messages() -> HashMap<String, MessageSchema> {
        let username = || {
            JsonSchema::object(
                [("username", JsonSchema::min_length(JsonSchema::string(), 3))],
                ["username"],
            )
        };
        [
            (RegisterUser::NAME, MessageType::Command),
            (ChangeUsername::NAME, MessageType::Command),
            (UsernameSet::NAME, MessageType::Event),
        ]
        .into_iter()
        .map(|(name, message_type)| {
            (
                name.to_string(),
                MessageSchema {
                    message_type,
                    schema: username(),
                },
            )
        })
        .collect()
    }

    fn username(state: &State) -> &str {
        &state.downcast_ref::<User>().unwrap().username
    }

    #[test]
    fn test_recorded_events_carry_the_aggregate() {
        let flavour = flavour();
        let factory = aggregate_factory(|command: &RegisterUser, _: Option<&()>| {
            let mut user = User {
                username: String::new(),
                recorded: vec![],
            };
            user.set_username(&command.username);
            Ok(user)
        });
        let method = aggregate_method(|user: &mut User, command: &ChangeUsername, _: Option<&()>| {
            user.set_username(&command.username);
            Ok(())
        });
        let register = Message::from_typed(RegisterUser {
            username: "Alex".into(),
        })
        .unwrap();
        let change = Message::from_typed(ChangeUsername {
            username: "John".into(),
        })
        .unwrap();

        let registered = flavour
            .call_aggregate_factory("User", &factory, &register, None)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .unwrap();
        let state = flavour
            .call_apply_first_event(&use_aggregate(), &registered)
            .unwrap();
        let changed: Vec<_> = flavour
            .call_subsequent_aggregate_function("User", &method, &state, &change, None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let changed = changed[0].as_ref().unwrap();
        let next = flavour
            .call_apply_subsequent_event(&use_aggregate(), state.clone(), changed)
            .unwrap();

        assert_eq!(username(&state), "Alex");
        assert_eq!(username(&next), "John");
        assert_eq!(changed.meta(meta::CAUSATION_NAME), Some(&json!("ChangeUsername")));
        assert_eq!(
            flavour.convert_aggregate_state_to_value("User", &next).unwrap(),
            json!({ "username": "John" })
        );
    }

    #[test]
    fn test_replay_from_network() {
        let flavour = flavour();
        let history: Vec<_> = ["Alex", "John"]
            .into_iter()
            .map(|username| {
                Message::from_typed(UsernameSet {
                    username: username.into(),
                })
                .unwrap()
                .with_added_metadata(meta::AGGREGATE_TYPE, "User")
                .to_raw()
                .unwrap()
            })
            .collect();

        let first = flavour
            .convert_message_received_from_network(history[0].clone(), true)
            .unwrap();
        let second = flavour
            .convert_message_received_from_network(history[1].clone(), false)
            .unwrap();
        let state = flavour
            .call_apply_first_event(&use_aggregate(), &first)
            .unwrap();
        let state = flavour
            .call_apply_subsequent_event(&use_aggregate(), state, &second)
            .unwrap();

        assert_eq!(username(&state), "John");
    }

    #[test]
    fn test_recorded_events_are_validated_before_transmission() {
        let flavour = flavour();
        let factory = aggregate_factory(|command: &RegisterUser, _: Option<&()>| {
            let mut user = User {
                username: String::new(),
                recorded: vec![],
            };
            user.set_username(&command.username);
            Ok(user)
        });
        let register = Message::from_typed(RegisterUser {
            username: "Al".into(),
        })
        .unwrap();

        let recorded = flavour
            .call_aggregate_factory("User", &factory, &register, None)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .unwrap();
        let error = flavour.prepare_network_transmission(recorded).unwrap_err();

        assert!(matches!(error, Error::Validation(_)));
    }

    #[test]
    fn test_unregistered_aggregate_type() {
        let event = Message::from_typed(UsernameSet {
            username: "Alex".into(),
        })
        .unwrap()
        .with_added_metadata(meta::AGGREGATE_TYPE, "Admin");

        let error = flavour()
            .convert_message_received_from_network(event, true)
            .unwrap_err();

        assert!(matches!(error, Error::Configuration(_)));
    }
}
