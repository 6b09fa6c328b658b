use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    Error, Message, MessageType, Payload, SchemaAssertion, ValidationError, Violation,
};

/// Creates messages from plain data, validating their payload.
pub trait MessageFactory: Send + Sync {
    /// Creates a message from `{payload, metadata?, uuid?, created_at?}`.
    ///
    /// Fails with [Error::UnknownMessage] if `name` is not registered, or with
    /// [Error::Validation] if the payload does not match the registered schema.
    fn create_message_from_array(&self, name: &str, data: Value) -> Result<Message, Error>;

    /// The kind of a registered message.
    fn message_type(&self, name: &str) -> Option<MessageType>;

    /// Creates a message with a fresh id from a payload.
    fn create_message(&self, name: &str, payload: Value) -> Result<Message, Error> {
        self.create_message_from_array(name, json!({ "payload": payload }))
    }
}

/// A registered message: its kind and the JSON schema of its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSchema {
    /// The kind of message.
    pub message_type: MessageType,
    /// The JSON schema of the payload.
    pub schema: Value,
}

/// A [MessageFactory] validating payloads with a [SchemaAssertion].
pub struct SchemaMessageFactory {
    messages: HashMap<String, MessageSchema>,
    assertion: Arc<dyn SchemaAssertion>,
}

#[derive(Deserialize)]
struct MessageData {
    #[serde(default)]
    payload: Map<String, Value>,
    #[serde(default)]
    metadata: Map<String, Value>,
    uuid: Option<Uuid>,
    created_at: Option<String>,
}

impl SchemaMessageFactory {
    /// Creates a factory for the given messages.
    pub fn new(
        messages: HashMap<String, MessageSchema>,
        assertion: Arc<dyn SchemaAssertion>,
    ) -> Self {
        Self {
            messages,
            assertion,
        }
    }

    /// Validates a payload against the schema registered for `name`.
    pub fn assert_payload(&self, name: &str, payload: &Map<String, Value>) -> Result<(), Error> {
        let message = self
            .messages
            .get(name)
            .ok_or_else(|| Error::UnknownMessage(name.to_string()))?;
        self.assertion
            .assert(name, &Value::Object(payload.clone()), &message.schema)?;
        Ok(())
    }
}

impl MessageFactory for SchemaMessageFactory {
    fn create_message_from_array(&self, name: &str, data: Value) -> Result<Message, Error> {
        let message_type = self
            .message_type(name)
            .ok_or_else(|| Error::UnknownMessage(name.to_string()))?;

        let data: MessageData = serde_json::from_value(data)
            .map_err(|error| ValidationError::new(name, vec![Violation::new("", error.to_string())]))?;

        self.assert_payload(name, &data.payload)?;

        let created_at = match data.created_at {
            Some(created_at) => OffsetDateTime::parse(&created_at, &Rfc3339).map_err(|error| {
                ValidationError::new(name, vec![Violation::new("created_at", error.to_string())])
            })?,
            None => OffsetDateTime::now_utc(),
        };

        Message::from_parts(
            name.to_string(),
            message_type,
            Payload::Raw(data.payload),
            data.metadata,
            data.uuid.unwrap_or_else(Uuid::new_v4),
            created_at,
        )
    }

    fn message_type(&self, name: &str) -> Option<MessageType> {
        self.messages.get(name).map(|message| message.message_type)
    }
}
