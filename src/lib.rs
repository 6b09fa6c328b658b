//! # Augure \o.ɡyʁ\
//!
//! Augure is a Rust library for event-sourced applications following the command-query
//! responsibility segregation pattern.
//!
//! ## Concepts
//!
//! Everything that can happen is modeled with a [Message]: commands ask for a change, events
//! tell what changed and queries ask for data. Business entities are event-sourced
//! [aggregates](GenericAggregateRoot): their state is rebuilt by applying the events they
//! recorded, and a command is processed by calling a business function with that state.
//!
//! The application is described with a [Configuration]: the messages and their schemas, which
//! command targets which aggregate, the events each command may record and how they are
//! applied, the listeners of events and the projections building read models.
//!
//! ## Event machine
//!
//! The [EventMachine] is the main entry point. It routes a command to its processor, which
//! loads the aggregate, calls the business function, and appends the recorded events to the
//! event store with optimistic concurrency. The events are then projected into read models and
//! published to their [listeners](EventListener). Listeners can return new commands, which are
//! also dispatched. The process continues as long as commands are issued.
//!
//! ## Flavours
//!
//! A [Flavour] decides how business functions are written:
//!
//! * with the [prototyping] flavour, they work with plain JSON payloads and states,
//! * with the [functional] flavour, they work with custom typed messages and states,
//! * with the [oop] flavour, aggregates are objects recording their own events.
//!
//! ## Features
//!
//! The `derive` feature, which is enabled by default, provides derive macros for
//! [TypedMessage] (`Command`, `Event` and `Query`), as well as an attribute macro to easily
//! create [event listeners](EventListener).

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(__docs, feature(doc_auto_cfg))]

mod aggregate;
mod callable;
mod command;
mod command_processor;
mod configuration;
mod document_store;
mod error;
mod event;
mod event_store;
mod flavour;
mod machine;
mod message;
mod message_factory;
mod projection;
mod repository;
mod schema;
mod settings;
mod snapshot_store;
mod transaction;

pub use aggregate::{AggregateDescription, AggregateLifecycle, EventApplyMap, GenericAggregateRoot};
pub use callable::{pre_processor, Callable, Context, RawEvent, State, TypedEvent, Yielded, Yields};
pub use command::Commands;
pub use command_processor::{CommandOutcome, CommandProcessor, CommandRoute, CommandRouter};
pub use configuration::{
    CommandProcessorDescription, CompiledConfiguration, Configuration, DEFAULT_STREAM,
};
pub use document_store::{DocumentStore, Filter, InMemoryDocumentStore, Index};
pub use error::Error;
pub use event::{EventListener, QueryResolver};
pub use event_store::{EventStore, InMemoryEventStore, MetadataMatcher, StoredEvent};
pub use flavour::{functional, oop, prototyping, Events, Flavour};
pub use machine::{EventMachine, EventMachineBuilder};
pub use message::{
    meta, validate_name, Message, MessageBag, MessageType, Payload, TypedData, TypedMessage,
};
pub use message_factory::{MessageFactory, MessageSchema, SchemaMessageFactory};
pub use projection::{
    collection_name, AggregateProjector, Projection, ProjectionDescription, ProjectionRunner,
    ProjectionStatus, Projector, POSITIONS_COLLECTION, VERSIONS_COLLECTION,
};
pub use repository::{AggregateRepository, AggregateStateStore};
pub use schema::{BasicSchemaAssertion, JsonSchema, SchemaAssertion, ValidationError, Violation};
pub use settings::Settings;
pub use snapshot_store::{InMemorySnapshotStore, Snapshot, SnapshotStore};
pub use transaction::{TransactionManager, Transactional};

#[cfg(feature = "derive")]
pub use augure_macros::{event_listener, Command, Event, Query};

#[cfg(feature = "derive")]
#[doc(hidden)]
pub use async_trait::async_trait;
