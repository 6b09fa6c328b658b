use serde_json::{Map, Value};
use std::any::{type_name, Any};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::message::downcast_ref;
use crate::{Error, Message, TypedData, TypedMessage};

/// A user function that has been boxed to be stored in a description.
///
/// Each [Flavour](crate::Flavour) knows the shape of the functions it calls and downcasts the
/// callable accordingly. Callables are built with the constructors of the flavour modules, for
/// instance [prototyping::aggregate_factory](crate::prototyping::aggregate_factory).
#[derive(Clone)]
pub struct Callable {
    kind: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Callable {
    pub(crate) fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self {
            kind: type_name::<T>(),
            inner: Arc::new(inner),
        }
    }

    /// The type of the boxed function.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub(crate) fn downcast<T: Any>(&self) -> Result<&T, Error> {
        self.inner
            .downcast_ref()
            .ok_or(Error::CallableMismatch {
                expected: type_name::<T>(),
                actual: self.kind,
            })
    }
}

impl Debug for Callable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Callable({})", self.kind)
    }
}

/// Side-channel data computed from a command and passed to business functions.
#[derive(Clone)]
pub struct Context(Arc<dyn Any + Send + Sync>);

impl Context {
    /// Wraps a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcasts the wrapped value.
    pub fn downcast_ref<T: Any>(&self) -> Result<&T, Error> {
        self.0.downcast_ref().ok_or(Error::Downcast(type_name::<T>()))
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Context")
    }
}

pub(crate) fn context_as<T: Any>(context: Option<&Context>) -> Result<Option<&T>, Error> {
    context
        .map(|context| context.downcast_ref::<T>())
        .transpose()
}

/// The state of an aggregate.
#[derive(Debug)]
pub enum State {
    /// Plain data, used by the prototyping flavour.
    Raw(Value),
    /// A custom state or aggregate object.
    Typed(Box<dyn TypedData>),
}

impl State {
    /// The state as plain data.
    pub fn to_value(&self) -> Result<Value, Error> {
        match self {
            State::Raw(value) => Ok(value.clone()),
            State::Typed(data) => data.to_value(),
        }
    }

    /// The plain state, if it is one.
    pub fn as_raw(&self) -> Option<&Value> {
        match self {
            State::Raw(value) => Some(value),
            State::Typed(_) => None,
        }
    }

    /// Downcasts a typed state.
    pub fn downcast_ref<T: Any>(&self) -> Result<&T, Error> {
        match self {
            State::Typed(data) => downcast_ref(data.as_ref()),
            State::Raw(_) => Err(Error::Downcast(type_name::<T>())),
        }
    }

    pub(crate) fn typed_mut(&mut self) -> Result<&mut dyn TypedData, Error> {
        match self {
            State::Typed(data) => Ok(data.as_mut()),
            State::Raw(_) => Err(Error::Downcast("dyn TypedData")),
        }
    }
}

impl Clone for State {
    fn clone(&self) -> Self {
        match self {
            State::Raw(value) => State::Raw(value.clone()),
            State::Typed(data) => State::Typed(data.clone_boxed()),
        }
    }
}

/// An event yielded by a prototyping business function: a name and a plain payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// The name of the event.
    pub name: String,
    /// The payload of the event.
    pub payload: Value,
}

impl RawEvent {
    /// Creates a new raw event.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub(crate) fn payload_object(self) -> Result<(String, Map<String, Value>), Error> {
        match self.payload {
            Value::Object(payload) => Ok((self.name, payload)),
            Value::Null => Ok((self.name, Map::new())),
            _ => Err(Error::Downcast("Map<String, Value>")),
        }
    }
}

/// A custom typed event yielded by a functional business function or recorded by an
/// object-oriented aggregate.
#[derive(Debug, Clone)]
pub struct TypedEvent {
    name: &'static str,
    data: Arc<dyn TypedData>,
}

impl TypedEvent {
    /// The name of the event.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The typed event.
    pub fn data(&self) -> &dyn TypedData {
        self.data.as_ref()
    }

    pub(crate) fn into_data(self) -> Arc<dyn TypedData> {
        self.data
    }
}

impl<E: TypedMessage> From<E> for TypedEvent {
    fn from(event: E) -> Self {
        Self {
            name: E::NAME,
            data: Arc::new(event),
        }
    }
}

/// An event yielded by a business function, before it is turned into a [Message].
#[derive(Debug, Clone)]
pub enum Yielded {
    /// From the prototyping flavour.
    Raw(RawEvent),
    /// From the functional flavour.
    Typed(TypedEvent),
}

/// The lazy sequence of events yielded by a business function. `None` items are skipped.
pub type Yields = Box<dyn Iterator<Item = Option<Yielded>> + Send>;

pub(crate) struct AggregateFactoryFn(
    pub(crate) Box<dyn Fn(&Message, Option<&Context>) -> Result<Yields, Error> + Send + Sync>,
);

type BoxedAggregateFn =
    Box<dyn Fn(&State, &Message, Option<&Context>) -> Result<Yields, Error> + Send + Sync>;

pub(crate) struct AggregateFn(pub(crate) BoxedAggregateFn);

pub(crate) struct ApplyFn(
    pub(crate) Box<dyn Fn(Option<State>, &Message) -> Result<State, Error> + Send + Sync>,
);

pub(crate) struct ContextProviderFn(
    pub(crate) Box<dyn Fn(&Message) -> Result<Context, Error> + Send + Sync>,
);

pub(crate) struct PreProcessorFn(
    pub(crate) Box<dyn Fn(Message) -> Result<Message, Error> + Send + Sync>,
);

/// Creates a command pre-processor, shared by every flavour.
///
/// A pre-processor may rewrite a command before it reaches its aggregate, or veto it by
/// setting the [STOP_DISPATCH](crate::meta::STOP_DISPATCH) metadata to `true`.
pub fn pre_processor<F>(pre_processor: F) -> Callable
where
    F: Fn(Message) -> Result<Message, Error> + Send + Sync + 'static,
{
    Callable::new(PreProcessorFn(Box::new(pre_processor)))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_callable_mismatch() {
        let callable = pre_processor(Ok);

        assert!(callable.downcast::<PreProcessorFn>().is_ok());
        assert!(matches!(
            callable.downcast::<ApplyFn>(),
            Err(Error::CallableMismatch { .. })
        ));
    }

    #[test]
    fn test_state_clone_and_downcast() {
        let state = State::Typed(Box::new(vec![1u8, 2, 3]));

        let clone = state.clone();

        assert_eq!(clone.downcast_ref::<Vec<u8>>().unwrap(), &vec![1, 2, 3]);
        assert_eq!(clone.to_value().unwrap(), json!([1, 2, 3]));
        assert!(State::Raw(json!({})).downcast_ref::<Vec<u8>>().is_err());
    }

    #[test]
    fn test_context() {
        let context = Context::new(json!({ "taken": false }));

        assert_eq!(
            context_as::<Value>(Some(&context)).unwrap(),
            Some(&json!({ "taken": false }))
        );
        assert!(context_as::<String>(Some(&context)).is_err());
        assert_eq!(context_as::<String>(None).unwrap(), None);
    }
}
