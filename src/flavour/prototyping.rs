//! The prototyping flavour: business functions work with plain JSON.
//!
//! Commands and events are [messages](Message) with a plain payload, states are
//! [JSON values](Value) and business functions yield [raw events](RawEvent), which are
//! validated by the [message factory](MessageFactory).

use serde_json::{json, Value};
use std::sync::Arc;

use super::{aggregate_id_from_payload, with_causation, Events, Flavour};
use crate::callable::{
    context_as, AggregateFactoryFn, AggregateFn, ApplyFn, ContextProviderFn, Yielded, Yields,
};
use crate::{
    Callable, Context, Error, Message, MessageFactory, MessageType, RawEvent, State,
};

/// A [Flavour] where everything is plain data.
pub struct PrototypingFlavour {
    message_factory: Arc<dyn MessageFactory>,
}

impl PrototypingFlavour {
    /// Creates a new prototyping flavour, using a message factory to turn yielded events into
    /// messages.
    pub fn new(message_factory: Arc<dyn MessageFactory>) -> Self {
        Self { message_factory }
    }

    fn to_events(&self, yields: Yields, command: &Message) -> Events {
        let message_factory = Arc::clone(&self.message_factory);
        let command = command.clone();
        Box::new(yields.map(move |event| match event {
            None => Ok(None),
            Some(event) => {
                let event = to_message(message_factory.as_ref(), event)?;
                Ok(Some(with_causation(event, &command)))
            }
        }))
    }
}

fn to_message(message_factory: &dyn MessageFactory, event: Yielded) -> Result<Message, Error> {
    let event = match event {
        Yielded::Raw(event) => event,
        Yielded::Typed(event) => RawEvent::new(event.name(), event.data().to_value()?),
    };
    let (name, payload) = event.payload_object()?;
    let message = message_factory.create_message_from_array(&name, json!({ "payload": payload }))?;
    if message.message_type() != MessageType::Event {
        return Err(Error::configuration(format!(
            "{name} was recorded by an aggregate but is a {}",
            message.message_type()
        )));
    }
    Ok(message)
}

impl Flavour for PrototypingFlavour {
    fn get_aggregate_id_from_command(
        &self,
        id_key: &str,
        command: &Message,
    ) -> Result<String, Error> {
        aggregate_id_from_payload(&command.payload_value()?, id_key, command)
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
        message.to_raw()
    }

    fn convert_message_received_from_network(
        &self,
        message: Message,
        _first_aggregate_event: bool,
    ) -> Result<Message, Error> {
        Ok(message)
    }

    fn convert_aggregate_state_to_value(
        &self,
        _aggregate_type: &str,
        state: &State,
    ) -> Result<Value, Error> {
        state.to_value()
    }
}

/// Creates the business function of a command creating a new aggregate.
///
/// The function receives the command and the context computed by the context provider, if
/// any, and yields raw events. A `None` item records nothing.
pub fn aggregate_factory<F, I>(factory: F) -> Callable
where
    F: Fn(&Message, Option<&Value>) -> I + Send + Sync + 'static,
    I: IntoIterator<Item = Option<RawEvent>>,
    I::IntoIter: Send + 'static,
{
    Callable::new(AggregateFactoryFn(Box::new(move |command, context| {
        let yields: Yields = Box::new(
            factory(command, context_as(context)?)
                .into_iter()
                .map(|event| event.map(Yielded::Raw)),
        );
        Ok(yields)
    })))
}

/// Creates the business function of a command handled by an existing aggregate.
///
/// The function receives the current state first.
pub fn aggregate_function<F, I>(function: F) -> Callable
where
    F: Fn(&Value, &Message, Option<&Value>) -> I + Send + Sync + 'static,
    I: IntoIterator<Item = Option<RawEvent>>,
    I::IntoIter: Send + 'static,
{
    Callable::new(AggregateFn(Box::new(move |state, command, context| {
        let state = state
            .as_raw()
            .ok_or(Error::Downcast("serde_json::Value"))?;
        let yields: Yields = Box::new(
            function(state, command, context_as(context)?)
                .into_iter()
                .map(|event| event.map(Yielded::Raw)),
        );
        Ok(yields)
    })))
}

/// Creates an apply function. It receives `None` for the first event of an aggregate.
pub fn apply<F>(apply: F) -> Callable
where
    F: Fn(Option<Value>, &Message) -> Value + Send + Sync + 'static,
{
    Callable::new(ApplyFn(Box::new(move |state, event| {
        let state = match state {
            None => None,
            Some(State::Raw(state)) => Some(state),
            Some(State::Typed(_)) => return Err(Error::Downcast("serde_json::Value")),
        };
        Ok(State::Raw(apply(state, event)))
    })))
}

/// Creates a context provider.
pub fn context_provider<F>(provider: F) -> Callable
where
    F: Fn(&Message) -> Result<Value, Error> + Send + Sync + 'static,
{
    Callable::new(ContextProviderFn(Box::new(move |command| {
        Ok(Context::new(provider(command)?))
    })))
}
