//! Flavours translate between the generic message protocol and a programming style.
//!
//! Three flavours are provided:
//!
//! * [PrototypingFlavour] - business functions work with plain JSON payloads and states,
//! * [FunctionalFlavour] - business functions work with custom typed messages and states,
//! * [OopFlavour] - aggregates are stateful objects recording their own events.
//!
//! Every hook of the [Flavour] trait can be overridden independently.

pub mod functional;
pub mod oop;
pub mod prototyping;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::callable::{ContextProviderFn, PreProcessorFn};
use crate::projection::Projector;
use crate::{
    meta, Callable, Commands, Context, Error, EventListener, Message, QueryResolver, State,
};

pub use functional::{FunctionalFlavour, FunctionalPort, TypedPort};
pub use oop::{AggregatePort, OopAggregate, OopFlavour, OopPort};
pub use prototyping::PrototypingFlavour;

/// The events produced by a business function, already turned into messages. `None` items
/// are placeholders for steps where nothing was recorded.
pub type Events = Box<dyn Iterator<Item = Result<Option<Message>, Error>> + Send>;

/// Strategy translating between the generic message and aggregate protocol and the
/// programming style of an application.
#[async_trait]
pub trait Flavour: Send + Sync {
    /// Runs a command pre-processor, which may rewrite the command.
    fn call_command_pre_processor(
        &self,
        pre_processor: &Callable,
        command: Message,
    ) -> Result<Message, Error> {
        (pre_processor.downcast::<PreProcessorFn>()?.0)(command)
    }

    /// Extracts the aggregate id from a command.
    fn get_aggregate_id_from_command(&self, id_key: &str, command: &Message)
        -> Result<String, Error>;

    /// Computes the context passed to business functions.
    fn call_context_provider(&self, provider: &Callable, command: &Message) -> Result<Context, Error> {
        (provider.downcast::<ContextProviderFn>()?.0)(command)
    }

    /// Calls the business function creating a new aggregate.
    fn call_aggregate_factory(
        &self,
        aggregate_type: &str,
        factory: &Callable,
        command: &Message,
        context: Option<&Context>,
    ) -> Result<Events, Error>;

    /// Calls a business function of an existing aggregate.
    fn call_subsequent_aggregate_function(
        &self,
        aggregate_type: &str,
        function: &Callable,
        state: &State,
        command: &Message,
        context: Option<&Context>,
    ) -> Result<Events, Error>;

    /// Applies the first event of an aggregate.
    fn call_apply_first_event(&self, apply: &Callable, event: &Message) -> Result<State, Error>;

    /// Applies an event to the current state of an aggregate.
    fn call_apply_subsequent_event(
        &self,
        apply: &Callable,
        state: State,
        event: &Message,
    ) -> Result<State, Error>;

    /// Turns a message into the plain form that is persisted and published.
    fn prepare_network_transmission(&self, message: Message) -> Result<Message, Error>;

    /// Turns a plain message into the form expected by the application.
    ///
    /// `first_aggregate_event` is set for the first event of an aggregate history.
    fn convert_message_received_from_network(
        &self,
        message: Message,
        first_aggregate_event: bool,
    ) -> Result<Message, Error>;

    /// Turns an aggregate state into plain data.
    fn convert_aggregate_state_to_value(
        &self,
        aggregate_type: &str,
        state: &State,
    ) -> Result<Value, Error>;

    /// Calls a projector.
    async fn call_projector(
        &self,
        projector: &dyn Projector,
        app_version: &str,
        projection_name: &str,
        event: &Message,
    ) -> Result<(), Error> {
        projector.handle(app_version, projection_name, event).await
    }

    /// Calls an event listener.
    async fn call_event_listener(
        &self,
        listener: &dyn EventListener,
        event: &Message,
    ) -> Result<Commands, Error> {
        listener.handle(event).await
    }

    /// Calls a query resolver.
    async fn call_query_resolver(
        &self,
        resolver: &dyn QueryResolver,
        query: &Message,
    ) -> Result<Value, Error> {
        resolver.resolve(query).await
    }
}

pub(crate) fn with_causation(event: Message, command: &Message) -> Message {
    let mut metadata = event.metadata().clone();
    metadata.insert(meta::CAUSATION_ID.into(), command.uuid().to_string().into());
    metadata.insert(meta::CAUSATION_NAME.into(), command.name().into());
    event.with_metadata(metadata)
}

pub(crate) fn aggregate_id_from_payload(
    payload: &Map<String, Value>,
    id_key: &str,
    command: &Message,
) -> Result<String, Error> {
    match payload.get(id_key) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(Error::MissingIdentifier {
            command: command.name().to_string(),
            key: id_key.to_string(),
        }),
    }
}
