use async_trait::async_trait;
use serde_json::Value;

use crate::{Commands, Error, Message};

/// Reacts to published events.
///
/// Listeners run after the events of a command have been persisted. They can issue follow-up
/// [commands](Commands), which are dispatched in order once the current command is done.
///
/// With the `derive` feature, the `#[event_listener]` attribute creates a listener from an
/// async function taking a typed event.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Handles an event.
    async fn handle(&self, event: &Message) -> Result<Commands, Error>;
}

/// Resolves queries.
#[async_trait]
pub trait QueryResolver: Send + Sync {
    /// Resolves a query to plain data.
    async fn resolve(&self, query: &Message) -> Result<Value, Error>;
}
