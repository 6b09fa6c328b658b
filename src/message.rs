use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::{type_name, Any};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::Error;

/// Metadata keys attached by the framework. Their names are part of the persisted format.
pub mod meta {
    /// The id of the aggregate that recorded the event.
    pub const AGGREGATE_ID: &str = "_aggregate_id";
    /// The type of the aggregate that recorded the event.
    pub const AGGREGATE_TYPE: &str = "_aggregate_type";
    /// The version of the aggregate after the event, starting at 1.
    pub const AGGREGATE_VERSION: &str = "_aggregate_version";
    /// The id of the command that caused the event.
    pub const CAUSATION_ID: &str = "_causation_id";
    /// The name of the command that caused the event.
    pub const CAUSATION_NAME: &str = "_causation_name";
    /// Set to `true` by a command pre-processor to stop the dispatch of a command.
    pub const STOP_DISPATCH: &str = "_stop_dispatch";
}

/// The kind of a [Message].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A request to modify the system.
    Command,
    /// Something that happened in the past.
    Event,
    /// A request for data.
    Query,
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Command => write!(f, "command"),
            MessageType::Event => write!(f, "event"),
            MessageType::Query => write!(f, "query"),
        }
    }
}

/// A type-erased value that can be cloned, downcast, and serialized back to plain data.
///
/// Implemented for every `Serialize + Clone + Debug + Send + Sync + 'static` type, which
/// includes custom messages, custom aggregate states and [serde_json::Value].
pub trait TypedData: Any + Debug + Send + Sync {
    /// Serializes the value to plain data.
    fn to_value(&self) -> Result<Value, Error>;

    /// Clones the value into a new box.
    fn clone_boxed(&self) -> Box<dyn TypedData>;

    /// Upcasts to [Any] for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Upcasts to [Any] for mutable downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Upcasts a boxed value to [Any] to take it back by value.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    /// The name of the concrete type.
    fn type_name(&self) -> &'static str;
}

impl<T> TypedData for T
where
    T: Serialize + Clone + Debug + Send + Sync + 'static,
{
    fn to_value(&self) -> Result<Value, Error> {
        Ok(serde_json::to_value(self)?)
    }

    fn clone_boxed(&self) -> Box<dyn TypedData> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

pub(crate) fn downcast_ref<T: Any>(data: &dyn TypedData) -> Result<&T, Error> {
    data.as_any()
        .downcast_ref()
        .ok_or(Error::Downcast(type_name::<T>()))
}

pub(crate) fn downcast_mut<T: Any>(data: &mut dyn TypedData) -> Result<&mut T, Error> {
    data.as_any_mut()
        .downcast_mut()
        .ok_or(Error::Downcast(type_name::<T>()))
}

/// A custom typed message, used by the functional and object-oriented flavours.
///
/// Can be derived with `#[derive(Command)]`, `#[derive(Event)]` or `#[derive(Query)]` when the
/// `derive` feature is enabled.
///
/// # Example
///
/// ```
/// use augure::{MessageType, TypedMessage};
///
/// #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
/// pub struct RegisterUser {
///     #[serde(rename = "userId")]
///     pub user_id: String,
///     pub username: String,
/// }
///
/// impl TypedMessage for RegisterUser {
///     const NAME: &'static str = "RegisterUser";
///     const MESSAGE_TYPE: MessageType = MessageType::Command;
/// }
/// ```
pub trait TypedMessage:
    Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static
{
    /// The name of the message. Must be unique.
    const NAME: &'static str;

    /// The kind of message.
    const MESSAGE_TYPE: MessageType;
}

/// The payload of a message decorated with a custom typed object.
///
/// The object-oriented flavour also attaches the aggregate that recorded an event, so that
/// applying the event does not need to replay anything.
#[derive(Debug, Clone)]
pub struct MessageBag {
    data: Arc<dyn TypedData>,
    aggregate: Option<Arc<dyn TypedData>>,
}

impl MessageBag {
    /// Creates a new bag around a typed object.
    pub fn new(data: Arc<dyn TypedData>) -> Self {
        Self {
            data,
            aggregate: None,
        }
    }

    /// Attaches an aggregate to the bag.
    pub fn with_aggregate(mut self, aggregate: Arc<dyn TypedData>) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    /// The typed object.
    pub fn data(&self) -> &dyn TypedData {
        self.data.as_ref()
    }

    /// The attached aggregate, if any.
    pub fn aggregate(&self) -> Option<&dyn TypedData> {
        self.aggregate.as_deref()
    }
}

/// The payload of a [Message]: either plain data or a custom typed object.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A plain JSON object.
    Raw(Map<String, Value>),
    /// A decorated custom object.
    Typed(MessageBag),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Raw(Map::new())
    }
}

/// An immutable envelope for commands, events and queries.
///
/// Modifiers such as [with_added_metadata](Message::with_added_metadata) return a modified
/// copy.
#[derive(Debug, Clone)]
pub struct Message {
    name: String,
    message_type: MessageType,
    payload: Payload,
    metadata: Map<String, Value>,
    uuid: Uuid,
    created_at: OffsetDateTime,
}

impl Message {
    /// Creates a new message with a random id. Fails if the name is invalid.
    ///
    /// The payload is not validated: use a [MessageFactory](crate::MessageFactory) to create
    /// messages from untrusted data.
    pub fn new(
        name: impl Into<String>,
        message_type: MessageType,
        payload: Payload,
    ) -> Result<Self, Error> {
        Self::from_parts(
            name.into(),
            message_type,
            payload,
            Map::new(),
            Uuid::new_v4(),
            OffsetDateTime::now_utc(),
        )
    }

    /// Creates a message decorated with a custom typed object.
    pub fn from_typed<T: TypedMessage>(data: T) -> Result<Self, Error> {
        Self::new(
            T::NAME,
            T::MESSAGE_TYPE,
            Payload::Typed(MessageBag::new(Arc::new(data))),
        )
    }

    pub(crate) fn from_parts(
        name: String,
        message_type: MessageType,
        payload: Payload,
        metadata: Map<String, Value>,
        uuid: Uuid,
        created_at: OffsetDateTime,
    ) -> Result<Self, Error> {
        validate_name(&name)?;
        Ok(Self {
            name,
            message_type,
            payload,
            metadata,
            uuid,
            created_at,
        })
    }

    /// The name of the message.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kind of message.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The unique id of the message.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// When the message was created.
    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    /// The payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The plain payload, or `None` if the message is decorated with a typed object.
    pub fn raw_payload(&self) -> Option<&Map<String, Value>> {
        match &self.payload {
            Payload::Raw(payload) => Some(payload),
            Payload::Typed(_) => None,
        }
    }

    /// The bag of a decorated message.
    pub fn bag(&self) -> Option<&MessageBag> {
        match &self.payload {
            Payload::Raw(_) => None,
            Payload::Typed(bag) => Some(bag),
        }
    }

    /// The payload as plain data, serializing the typed object if needed.
    pub fn payload_value(&self) -> Result<Map<String, Value>, Error> {
        match &self.payload {
            Payload::Raw(payload) => Ok(payload.clone()),
            Payload::Typed(bag) => match bag.data().to_value()? {
                Value::Object(payload) => Ok(payload),
                Value::Null => Ok(Map::new()),
                _ => Err(Error::Downcast("Map<String, Value>")),
            },
        }
    }

    /// The value of a payload key. Fails if the key is missing.
    pub fn get(&self, key: &str) -> Result<Value, Error> {
        self.payload_value()?.remove(key).ok_or_else(|| {
            crate::ValidationError::new(
                self.name.clone(),
                vec![crate::Violation::new(key, "is required")],
            )
            .into()
        })
    }

    /// The value of a payload key, or `default` if it is missing.
    pub fn get_or_default(&self, key: &str, default: Value) -> Value {
        self.payload_value()
            .ok()
            .and_then(|mut payload| payload.remove(key))
            .unwrap_or(default)
    }

    /// Downcasts the typed object of a decorated message.
    pub fn typed<T: Any>(&self) -> Result<&T, Error> {
        match &self.payload {
            Payload::Typed(bag) => downcast_ref(bag.data()),
            Payload::Raw(_) => Err(Error::Downcast(type_name::<T>())),
        }
    }

    /// Returns the payload as a concrete type: the typed object is cloned if the message is
    /// decorated with a `T`, otherwise the plain payload is deserialized.
    pub fn deserialize<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned + Clone + Any,
    {
        if let Ok(data) = self.typed::<T>() {
            return Ok(data.clone());
        }
        Ok(serde_json::from_value(Value::Object(self.payload_value()?))?)
    }

    /// The metadata.
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// A metadata value.
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// The `_aggregate_id` metadata.
    pub fn aggregate_id(&self) -> Option<&str> {
        self.meta(meta::AGGREGATE_ID).and_then(Value::as_str)
    }

    /// The `_aggregate_type` metadata.
    pub fn aggregate_type(&self) -> Option<&str> {
        self.meta(meta::AGGREGATE_TYPE).and_then(Value::as_str)
    }

    /// The `_aggregate_version` metadata.
    pub fn aggregate_version(&self) -> Option<u64> {
        self.meta(meta::AGGREGATE_VERSION).and_then(Value::as_u64)
    }

    /// Returns a copy with an additional metadata entry.
    pub fn with_added_metadata(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut message = self.clone();
        message.metadata.insert(key.into(), value.into());
        message
    }

    /// Returns a copy with the metadata replaced.
    pub fn with_metadata(&self, metadata: Map<String, Value>) -> Self {
        Self {
            metadata,
            ..self.clone()
        }
    }

    /// Returns a copy with the payload replaced, keeping id, date and metadata.
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Returns a copy with a plain payload.
    pub fn to_raw(&self) -> Result<Self, Error> {
        match &self.payload {
            Payload::Raw(_) => Ok(self.clone()),
            Payload::Typed(_) => Ok(self.with_payload(Payload::Raw(self.payload_value()?))),
        }
    }

    /// The plain data representation of the message.
    pub fn to_value(&self) -> Result<Value, Error> {
        let created_at = self
            .created_at
            .format(&Rfc3339)
            .map_err(|error| Error::Storage(error.to_string()))?;
        Ok(serde_json::json!({
            "message_name": self.name,
            "message_type": self.message_type,
            "uuid": self.uuid.to_string(),
            "created_at": created_at,
            "payload": self.payload_value()?,
            "metadata": self.metadata,
        }))
    }
}

/// Checks that a message name matches `^[A-Za-z0-9_.\-/]+$`.
pub fn validate_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidMessageName(name.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UsernameChanged {
        #[serde(rename = "oldName")]
        old_name: String,
        #[serde(rename = "newName")]
        new_name: String,
    }

    impl TypedMessage for UsernameChanged {
        const NAME: &'static str = "UsernameChanged";
        const MESSAGE_TYPE: MessageType = MessageType::Event;
    }

    fn raw(payload: Value) -> Message {
        let Value::Object(payload) = payload else {
            panic!("payload must be an object")
        };
        Message::new("UsernameChanged", MessageType::Event, Payload::Raw(payload)).unwrap()
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("App.Command/Register_user-1").is_ok());
        assert!(matches!(
            validate_name("Register User"),
            Err(Error::InvalidMessageName(_))
        ));
        assert!(validate_name("").is_err());
    }

    #[test]
    fn test_metadata_modifiers_return_copies() {
        let message = raw(json!({ "oldName": "Alex", "newName": "John" }));

        let decorated = message.with_added_metadata(meta::AGGREGATE_VERSION, 2);

        assert_eq!(message.aggregate_version(), None);
        assert_eq!(decorated.aggregate_version(), Some(2));
        assert_eq!(decorated.uuid(), message.uuid());
        assert!(decorated.with_metadata(Map::new()).metadata().is_empty());
    }

    #[test]
    fn test_get() {
        let message = raw(json!({ "oldName": "Alex", "newName": "John" }));

        assert_eq!(message.get("newName").unwrap(), json!("John"));
        assert_eq!(message.get_or_default("missing", json!(1)), json!(1));
        assert_eq!(message.get("missing").unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_typed_payload() {
        let event = UsernameChanged {
            old_name: "Alex".into(),
            new_name: "John".into(),
        };
        let message = Message::from_typed(event.clone()).unwrap();

        assert_eq!(message.typed::<UsernameChanged>().unwrap(), &event);
        assert_eq!(message.deserialize::<UsernameChanged>().unwrap(), event);
        assert_eq!(message.get("oldName").unwrap(), json!("Alex"));
        assert!(message.raw_payload().is_none());

        let raw = message.to_raw().unwrap();
        assert_eq!(raw.raw_payload().unwrap()["newName"], json!("John"));
        assert_eq!(raw.deserialize::<UsernameChanged>().unwrap(), event);
        assert!(raw.typed::<UsernameChanged>().is_err());
    }

    #[test]
    fn test_to_value() {
        let message = raw(json!({ "oldName": "Alex", "newName": "John" }))
            .with_added_metadata(meta::AGGREGATE_ID, "u-1");

        let value = message.to_value().unwrap();

        assert_eq!(value["message_name"], json!("UsernameChanged"));
        assert_eq!(value["message_type"], json!("event"));
        assert_eq!(value["metadata"]["_aggregate_id"], json!("u-1"));
        assert_eq!(value["uuid"], json!(message.uuid().to_string()));
    }
}
