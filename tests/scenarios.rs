//! End-to-end scenarios run against every flavour.
//!
//! The same `User` aggregate is written three times: with plain JSON values, with pure
//! functions over typed messages, and as an object recording its own events. Every scenario
//! must behave the same whichever flavour is used.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use augure::functional::{FunctionalFlavour, TypedPort};
use augure::oop::{AggregatePort, OopFlavour};
use augure::prototyping::{self, PrototypingFlavour};
use augure::{
    collection_name, event_listener, events, meta, AggregateProjector, BasicSchemaAssertion,
    Commands, Configuration, DocumentStore, Error, EventMachine, EventMachineBuilder, EventStore,
    Flavour, InMemoryDocumentStore, InMemoryEventStore, JsonSchema, Message, MetadataMatcher,
    RawEvent, Settings, StoredEvent, DEFAULT_STREAM,
};
use serde_json::{json, Value};

mod messages {
    use augure::{Command, Event, JsonSchema};
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Debug, Clone, Serialize, Deserialize, Command)]
    #[serde(rename_all = "camelCase")]
    pub struct RegisterUser {
        pub user_id: String,
        pub username: String,
        pub email: String,
        #[serde(default)]
        pub should_fail: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, Command)]
    #[serde(rename_all = "camelCase")]
    pub struct ChangeUsername {
        pub user_id: String,
        pub username: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, Event)]
    #[serde(rename_all = "camelCase")]
    pub struct UserWasRegistered {
        pub user_id: String,
        pub username: String,
        pub email: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, Event)]
    #[serde(rename_all = "camelCase")]
    pub struct UserRegistrationFailed {
        pub user_id: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, Event)]
    #[serde(rename_all = "camelCase")]
    #[augure(name = "UsernameChanged")]
    pub struct UsernameWasChanged {
        pub user_id: String,
        pub old_name: String,
        pub new_name: String,
    }

    pub fn register_user_schema() -> Value {
        JsonSchema::object(
            [
                ("userId", JsonSchema::string()),
                ("username", JsonSchema::min_length(JsonSchema::string(), 1)),
                ("email", JsonSchema::string()),
                ("shouldFail", JsonSchema::boolean()),
            ],
            ["userId", "username", "email"],
        )
    }

    pub fn change_username_schema() -> Value {
        JsonSchema::object(
            [
                ("userId", JsonSchema::string()),
                ("username", JsonSchema::min_length(JsonSchema::string(), 1)),
            ],
            ["userId", "username"],
        )
    }

    pub fn user_was_registered_schema() -> Value {
        JsonSchema::object(
            [
                ("userId", JsonSchema::string()),
                ("username", JsonSchema::string()),
                ("email", JsonSchema::string()),
            ],
            ["userId", "username", "email"],
        )
    }

    pub fn user_registration_failed_schema() -> Value {
        JsonSchema::object([("userId", JsonSchema::string())], ["userId"])
    }

    pub fn username_changed_schema() -> Value {
        JsonSchema::object(
            [
                ("userId", JsonSchema::string()),
                ("oldName", JsonSchema::string()),
                ("newName", JsonSchema::string()),
            ],
            ["userId", "oldName", "newName"],
        )
    }
}

use messages::*;

fn messages() -> Configuration {
    Configuration::new()
        .register_typed::<RegisterUser>(register_user_schema())
        .register_typed::<ChangeUsername>(change_username_schema())
        .register_typed::<UserWasRegistered>(user_was_registered_schema())
        .register_typed::<UserRegistrationFailed>(user_registration_failed_schema())
        .register_typed::<UsernameWasChanged>(username_changed_schema())
        .watch(DEFAULT_STREAM, |projection| {
            projection.with_aggregate_projection("User")
        })
}

fn typed_port() -> TypedPort {
    TypedPort::new()
        .register::<RegisterUser>()
        .register::<ChangeUsername>()
        .register::<UserWasRegistered>()
        .register::<UserRegistrationFailed>()
        .register::<UsernameWasChanged>()
}

fn prototyping_configuration() -> Configuration {
    messages()
        .process("RegisterUser", |processor| {
            processor
                .with_new("User")
                .handle(prototyping::aggregate_factory(|command: &Message, _| {
                    let user_id = command.get_or_default("userId", Value::Null);
                    if command.get_or_default("shouldFail", json!(false)) == json!(true) {
                        vec![Some(RawEvent::new(
                            "UserRegistrationFailed",
                            json!({ "userId": user_id }),
                        ))]
                    } else {
                        vec![Some(RawEvent::new(
                            "UserWasRegistered",
                            json!({
                                "userId": user_id,
                                "username": command.get_or_default("username", Value::Null),
                                "email": command.get_or_default("email", Value::Null),
                            }),
                        ))]
                    }
                }))
                .record_that("UserWasRegistered")
                .apply(prototyping::apply(|_, event: &Message| {
                    json!({
                        "username": event.get_or_default("username", Value::Null),
                        "email": event.get_or_default("email", Value::Null),
                        "failed": false,
                    })
                }))
                .or_record_that("UserRegistrationFailed")
                .apply(prototyping::apply(|_, _: &Message| json!({ "failed": true })))
        })
        .process("ChangeUsername", |processor| {
            processor
                .with_existing("User")
                .handle(prototyping::aggregate_function(
                    |state: &Value, command: &Message, _| {
                        let new_name = command.get_or_default("username", Value::Null);
                        if state["username"] == new_name {
                            vec![None]
                        } else {
                            vec![Some(RawEvent::new(
                                "UsernameChanged",
                                json!({
                                    "userId": command.get_or_default("userId", Value::Null),
                                    "oldName": state["username"],
                                    "newName": new_name,
                                }),
                            ))]
                        }
                    },
                ))
                .record_that("UsernameChanged")
                .apply(prototyping::apply(|state: Option<Value>, event: &Message| {
                    let mut state = state.unwrap_or_else(|| json!({}));
                    state["username"] = event.get_or_default("newName", Value::Null);
                    state
                }))
        })
}

mod functional_user {
    use super::messages::*;
    use augure::{events, functional, Configuration};
    use serde::Serialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize)]
    pub struct User {
        pub username: String,
        pub email: String,
        pub failed: bool,
    }

    pub fn configuration() -> Configuration {
        with_messages(super::messages())
    }

    pub fn with_messages(messages: Configuration) -> Configuration {
        messages
            .process("RegisterUser", |processor| {
                processor
                    .with_new("User")
                    .handle(functional::aggregate_factory(
                        |command: &RegisterUser, _: Option<&()>| {
                            if command.should_fail {
                                events![UserRegistrationFailed {
                                    user_id: command.user_id.clone(),
                                }]
                            } else {
                                events![UserWasRegistered {
                                    user_id: command.user_id.clone(),
                                    username: command.username.clone(),
                                    email: command.email.clone(),
                                }]
                            }
                        },
                    ))
                    .record_that("UserWasRegistered")
                    .apply(functional::apply(
                        |_: Option<User>, event: &UserWasRegistered| User {
                            username: event.username.clone(),
                            email: event.email.clone(),
                            failed: false,
                        },
                    ))
                    .or_record_that("UserRegistrationFailed")
                    .apply(functional::apply(
                        |_: Option<User>, _: &UserRegistrationFailed| User {
                            failed: true,
                            ..Default::default()
                        },
                    ))
            })
            .process("ChangeUsername", |processor| {
                processor
                    .with_existing("User")
                    .handle(functional::aggregate_function(
                        |user: &User, command: &ChangeUsername, _: Option<&()>| {
                            if user.username == command.username {
                                vec![None]
                            } else {
                                events![UsernameWasChanged {
                                    user_id: command.user_id.clone(),
                                    old_name: user.username.clone(),
                                    new_name: command.username.clone(),
                                }]
                            }
                        },
                    ))
                    .record_that("UsernameChanged")
                    .apply(functional::apply(
                        |user: Option<User>, event: &UsernameWasChanged| User {
                            username: event.new_name.clone(),
                            ..user.unwrap_or_default()
                        },
                    ))
            })
    }
}

mod oop_user {
    use super::messages::*;
    use augure::oop::{self, OopAggregate};
    use augure::{Configuration, Error, Message, TypedEvent};
    use serde::Serialize;

    #[derive(Debug, Clone, Default, Serialize)]
    pub struct User {
        username: String,
        email: String,
        failed: bool,
        #[serde(skip)]
        recorded: Vec<TypedEvent>,
    }

    impl User {
        fn register(command: &RegisterUser) -> User {
            let mut user = User::default();
            if command.should_fail {
                user.failed = true;
                user.recorded.push(
                    UserRegistrationFailed {
                        user_id: command.user_id.clone(),
                    }
                    .into(),
                );
            } else {
                user.username = command.username.clone();
                user.email = command.email.clone();
                user.recorded.push(
                    UserWasRegistered {
                        user_id: command.user_id.clone(),
                        username: command.username.clone(),
                        email: command.email.clone(),
                    }
                    .into(),
                );
            }
            user
        }

        fn change_username(&mut self, command: &ChangeUsername) {
            if self.username == command.username {
                return;
            }
            let old_name = std::mem::replace(&mut self.username, command.username.clone());
            self.recorded.push(
                UsernameWasChanged {
                    user_id: command.user_id.clone(),
                    old_name,
                    new_name: command.username.clone(),
                }
                .into(),
            );
        }
    }

    impl OopAggregate for User {
        fn reconstitute(first_event: &Message) -> Result<Self, Error> {
            let mut user = User::default();
            user.apply(first_event)?;
            Ok(user)
        }

        fn apply(&mut self, event: &Message) -> Result<(), Error> {
            match event.name() {
                "UserWasRegistered" => {
                    let event = event.deserialize::<UserWasRegistered>()?;
                    self.username = event.username;
                    self.email = event.email;
                }
                "UserRegistrationFailed" => self.failed = true,
                "UsernameChanged" => {
                    self.username = event.deserialize::<UsernameWasChanged>()?.new_name;
                }
                name => {
                    return Err(Error::UnknownEvent {
                        aggregate_type: "User".into(),
                        event: name.into(),
                    })
                }
            }
            Ok(())
        }

        fn pop_recorded_events(&mut self) -> Vec<TypedEvent> {
            std::mem::take(&mut self.recorded)
        }
    }

    pub fn configuration() -> Configuration {
        super::messages()
            .process("RegisterUser", |processor| {
                processor
                    .with_new("User")
                    .handle(oop::aggregate_factory(
                        |command: &RegisterUser, _: Option<&()>| Ok(User::register(command)),
                    ))
                    .record_that("UserWasRegistered")
                    .apply(oop::use_aggregate())
                    .or_record_that("UserRegistrationFailed")
                    .apply(oop::use_aggregate())
            })
            .process("ChangeUsername", |processor| {
                processor
                    .with_existing("User")
                    .handle(oop::aggregate_method(
                        |user: &mut User, command: &ChangeUsername, _: Option<&()>| {
                            user.change_username(command);
                            Ok(())
                        },
                    ))
                    .record_that("UsernameChanged")
                    .apply(oop::use_aggregate())
            })
    }
}

#[derive(Debug, Clone, Copy)]
enum Style {
    Prototyping,
    Functional,
    Oop,
}

const STYLES: [Style; 3] = [Style::Prototyping, Style::Functional, Style::Oop];

struct Fixture {
    machine: EventMachine,
    documents: Arc<InMemoryDocumentStore>,
}

impl Fixture {
    async fn new(style: Style) -> Self {
        Self::with_event_store(style, Arc::new(InMemoryEventStore::new()), Configuration::new())
            .await
    }

    async fn with_event_store(
        style: Style,
        event_store: Arc<dyn EventStore>,
        extra: Configuration,
    ) -> Self {
        let configuration = match style {
            Style::Prototyping => prototyping_configuration(),
            Style::Functional => functional_user::configuration(),
            Style::Oop => oop_user::configuration(),
        };
        let configuration = (configuration + extra).compile().unwrap();
        let factory = configuration.message_factory(Arc::new(BasicSchemaAssertion));
        let flavour: Arc<dyn Flavour> = match style {
            Style::Prototyping => Arc::new(PrototypingFlavour::new(factory.clone())),
            Style::Functional => Arc::new(FunctionalFlavour::new(
                Arc::new(typed_port()),
                factory.clone(),
            )),
            Style::Oop => Arc::new(OopFlavour::new(
                Arc::new(AggregatePort::new().register::<oop_user::User>("User")),
                FunctionalFlavour::new(Arc::new(typed_port()), factory.clone()),
            )),
        };
        let documents = Arc::new(InMemoryDocumentStore::new());
        let machine = EventMachineBuilder::new(configuration, flavour, event_store)
            .document_store(documents.clone())
            .message_factory(factory)
            .settings(Settings::default())
            .build()
            .unwrap();
        machine.setup().await.unwrap();
        Self { machine, documents }
    }

    async fn dispatch(&self, name: &str, payload: Value) -> Result<Vec<Message>, Error> {
        let command = self.machine.create_message(name, payload)?;
        self.machine.dispatch(command).await
    }

    async fn register(&self) -> Vec<Message> {
        self.dispatch(
            "RegisterUser",
            json!({ "userId": "u-1", "username": "Alex", "email": "a@x.com" }),
        )
        .await
        .unwrap()
    }

    async fn read_model(&self, id: &str) -> Option<Value> {
        let collection = collection_name("0.1.0", &AggregateProjector::projection_name("User"));
        self.documents.get_doc(&collection, id).await.unwrap()
    }
}

fn names(events: &[Message]) -> Vec<&str> {
    events.iter().map(Message::name).collect()
}

#[tokio::test]
async fn test_register_user() {
    for style in STYLES {
        let fixture = Fixture::new(style).await;

        let events = fixture.register().await;

        assert_eq!(names(&events), vec!["UserWasRegistered"], "{style:?}");
        let event = &events[0];
        assert_eq!(event.aggregate_version(), Some(1), "{style:?}");
        assert_eq!(event.aggregate_id(), Some("u-1"), "{style:?}");
        assert_eq!(event.aggregate_type(), Some("User"), "{style:?}");
        assert_eq!(event.get("email").unwrap(), json!("a@x.com"), "{style:?}");
        let state = fixture
            .machine
            .load_aggregate_state("User", "u-1")
            .await
            .unwrap();
        assert_eq!(state["username"], json!("Alex"), "{style:?}");
        assert_eq!(state["failed"], json!(false), "{style:?}");
    }
}

#[tokio::test]
async fn test_events_carry_their_causation() {
    for style in STYLES {
        let fixture = Fixture::new(style).await;
        let command = fixture
            .machine
            .create_message(
                "RegisterUser",
                json!({ "userId": "u-1", "username": "Alex", "email": "a@x.com" }),
            )
            .unwrap();

        let events = fixture.machine.dispatch(command.clone()).await.unwrap();

        assert_eq!(
            events[0].meta(meta::CAUSATION_ID),
            Some(&json!(command.uuid().to_string())),
            "{style:?}"
        );
        assert_eq!(
            events[0].meta(meta::CAUSATION_NAME),
            Some(&json!("RegisterUser")),
            "{style:?}"
        );
    }
}

#[tokio::test]
async fn test_change_username() {
    for style in STYLES {
        let fixture = Fixture::new(style).await;
        fixture.register().await;

        let events = fixture
            .dispatch("ChangeUsername", json!({ "userId": "u-1", "username": "Sam" }))
            .await
            .unwrap();

        assert_eq!(names(&events), vec!["UsernameChanged"], "{style:?}");
        assert_eq!(events[0].aggregate_version(), Some(2), "{style:?}");
        assert_eq!(events[0].get("oldName").unwrap(), json!("Alex"), "{style:?}");
        assert_eq!(events[0].get("newName").unwrap(), json!("Sam"), "{style:?}");
        let state = fixture
            .machine
            .load_aggregate_state("User", "u-1")
            .await
            .unwrap();
        assert_eq!(state["username"], json!("Sam"), "{style:?}");
    }
}

#[tokio::test]
async fn test_failed_registration() {
    for style in STYLES {
        let fixture = Fixture::new(style).await;

        let events = fixture
            .dispatch(
                "RegisterUser",
                json!({ "userId": "u-1", "username": "Alex", "email": "a@x.com", "shouldFail": true }),
            )
            .await
            .unwrap();

        assert_eq!(names(&events), vec!["UserRegistrationFailed"], "{style:?}");
        let state = fixture
            .machine
            .load_aggregate_state("User", "u-1")
            .await
            .unwrap();
        assert_eq!(state["failed"], json!(true), "{style:?}");
    }
}

#[tokio::test]
async fn test_nothing_is_recorded_for_an_unchanged_username() {
    for style in STYLES {
        let fixture = Fixture::new(style).await;
        fixture.register().await;

        let events = fixture
            .dispatch("ChangeUsername", json!({ "userId": "u-1", "username": "Alex" }))
            .await
            .unwrap();

        assert!(events.is_empty(), "{style:?}");
        let events = fixture
            .dispatch("ChangeUsername", json!({ "userId": "u-1", "username": "Sam" }))
            .await
            .unwrap();
        assert_eq!(events[0].aggregate_version(), Some(2), "{style:?}");
    }
}

#[tokio::test]
async fn test_unknown_aggregate() {
    for style in STYLES {
        let fixture = Fixture::new(style).await;

        let error = fixture
            .dispatch("ChangeUsername", json!({ "userId": "u-2", "username": "Sam" }))
            .await
            .unwrap_err();

        assert!(
            matches!(error, Error::AggregateNotFound { .. }),
            "{style:?}: {error}"
        );
        assert_eq!(error.status_code(), 404, "{style:?}");
    }
}

#[tokio::test]
async fn test_invalid_command_is_rejected_before_dispatch() {
    let fixture = Fixture::new(Style::Prototyping).await;

    let error = fixture
        .machine
        .create_message("RegisterUser", json!({ "userId": "u-1", "username": "" }))
        .unwrap_err();

    assert!(matches!(error, Error::Validation(_)), "{error}");
    assert_eq!(error.status_code(), 400);
}

#[tokio::test]
async fn test_read_model_follows_the_aggregate() {
    for style in STYLES {
        let fixture = Fixture::new(style).await;
        fixture.register().await;
        fixture
            .dispatch("ChangeUsername", json!({ "userId": "u-1", "username": "Sam" }))
            .await
            .unwrap();

        let document = fixture.read_model("u-1").await.unwrap();
        assert_eq!(document["username"], json!("Sam"), "{style:?}");
        assert_eq!(document["email"], json!("a@x.com"), "{style:?}");

        assert_eq!(fixture.machine.reset_projections().await.unwrap(), 2, "{style:?}");
        assert_eq!(fixture.read_model("u-1").await.unwrap(), document, "{style:?}");
    }
}

/// An event store where another writer always wins the first race on an existing aggregate.
struct RacingEventStore {
    inner: InMemoryEventStore,
    raced: AtomicBool,
}

impl RacingEventStore {
    fn new() -> Self {
        Self {
            inner: InMemoryEventStore::new(),
            raced: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventStore for RacingEventStore {
    async fn create_stream(&self, stream: &str) -> Result<(), Error> {
        self.inner.create_stream(stream).await
    }

    async fn has_stream(&self, stream: &str) -> Result<bool, Error> {
        self.inner.has_stream(stream).await
    }

    async fn append(
        &self,
        stream: &str,
        expected_version: u64,
        events: Vec<Message>,
    ) -> Result<(), Error> {
        if expected_version > 0 && !self.raced.swap(true, Ordering::SeqCst) {
            if let Some(first) = events.first() {
                self.inner
                    .append(stream, expected_version, vec![first.clone()])
                    .await?;
            }
        }
        self.inner.append(stream, expected_version, events).await
    }

    async fn load(
        &self,
        stream: &str,
        from_version: u64,
        matcher: &MetadataMatcher,
    ) -> Result<Vec<Message>, Error> {
        self.inner.load(stream, from_version, matcher).await
    }

    async fn read(&self, stream: &str, after_position: u64) -> Result<Vec<StoredEvent>, Error> {
        self.inner.read(stream, after_position).await
    }
}

#[tokio::test]
async fn test_concurrent_changes_conflict() {
    for style in STYLES {
        let event_store = Arc::new(RacingEventStore::new());
        let fixture = Fixture::with_event_store(style, event_store.clone(), Configuration::new()).await;
        fixture.register().await;

        let error = fixture
            .dispatch("ChangeUsername", json!({ "userId": "u-1", "username": "Sam" }))
            .await
            .unwrap_err();

        assert!(
            matches!(
                &error,
                Error::ConcurrencyConflict { expected: 1, actual: 2, .. }
            ),
            "{style:?}: {error}"
        );
        assert!(error.is_retryable(), "{style:?}");
        let stored = event_store.read(DEFAULT_STREAM, 0).await.unwrap();
        let stored: Vec<_> = stored.iter().map(|event| event.message.name()).collect();
        assert_eq!(stored, vec!["UserWasRegistered", "UsernameChanged"], "{style:?}");

        let events = fixture
            .dispatch("ChangeUsername", json!({ "userId": "u-1", "username": "Max" }))
            .await
            .unwrap();
        assert_eq!(events[0].aggregate_version(), Some(3), "{style:?}");
        assert_eq!(events[0].get("oldName").unwrap(), json!("Sam"), "{style:?}");
    }
}

static REGISTERED: Mutex<Vec<String>> = Mutex::new(Vec::new());

#[event_listener]
async fn remember_registration(event: UserWasRegistered) -> Result<Commands, Error> {
    REGISTERED.lock()?.push(event.username);
    Ok(Commands::new())
}

#[tokio::test]
async fn test_event_listener_attribute() {
    let fixture = Fixture::with_event_store(
        Style::Functional,
        Arc::new(InMemoryEventStore::new()),
        Configuration::new().on(remember_registration::EVENT_NAME, remember_registration),
    )
    .await;

    fixture.register().await;

    assert_eq!(remember_registration::EVENT_NAME, "UserWasRegistered");
    assert_eq!(*REGISTERED.lock().unwrap(), vec!["Alex".to_string()]);
}

#[test]
fn test_derived_message_names() {
    use augure::{MessageType, TypedMessage};

    assert_eq!(RegisterUser::NAME, "RegisterUser");
    assert_eq!(RegisterUser::MESSAGE_TYPE, MessageType::Command);
    assert_eq!(UsernameWasChanged::NAME, "UsernameChanged");
    assert_eq!(UsernameWasChanged::MESSAGE_TYPE, MessageType::Event);
    assert_eq!(
        Message::from_typed(UserRegistrationFailed {
            user_id: "u-1".into()
        })
        .unwrap()
        .get("userId")
        .unwrap(),
        json!("u-1")
    );
}

#[test]
fn test_events_macro() {
    let yielded = events![UserRegistrationFailed {
        user_id: "u-1".into()
    }];

    assert_eq!(yielded.len(), 1);
    assert_eq!(yielded[0].as_ref().map(|event| event.name()), Some("UserRegistrationFailed"));
}

#[tokio::test]
async fn test_raw_events_are_rejected_by_the_functional_flavour() {
    let configuration = messages()
        .process("RegisterUser", |processor| {
            processor
                .with_new("User")
                .handle(prototyping::aggregate_factory(|_: &Message, _| {
                    vec![Some(RawEvent::new("UserRegistrationFailed", json!({ "userId": "u-1" })))]
                }))
                .record_that("UserRegistrationFailed")
                .apply(prototyping::apply(|_, _: &Message| json!({ "failed": true })))
        })
        .compile()
        .unwrap();
    let factory = configuration.message_factory(Arc::new(BasicSchemaAssertion));
    let machine = EventMachineBuilder::in_memory(
        configuration,
        Arc::new(FunctionalFlavour::new(Arc::new(typed_port()), factory.clone())),
    )
    .message_factory(factory)
    .build()
    .unwrap();
    machine.setup().await.unwrap();
    let command = machine
        .create_message(
            "RegisterUser",
            json!({ "userId": "u-1", "username": "Alex", "email": "a@x.com" }),
        )
        .unwrap();

    let error = machine.dispatch(command).await.unwrap_err();

    assert!(matches!(error, Error::Configuration(_)), "{error}");
}

#[tokio::test]
async fn test_typed_events_violating_their_schema_are_not_persisted() {
    let strict_messages = Configuration::new()
        .register_typed::<RegisterUser>(register_user_schema())
        .register_typed::<ChangeUsername>(change_username_schema())
        .register_typed::<UserWasRegistered>(JsonSchema::object(
            [
                ("userId", JsonSchema::string()),
                ("username", JsonSchema::min_length(JsonSchema::string(), 5)),
                ("email", JsonSchema::string()),
            ],
            ["userId", "username", "email"],
        ))
        .register_typed::<UserRegistrationFailed>(user_registration_failed_schema())
        .register_typed::<UsernameWasChanged>(username_changed_schema());
    let configuration = functional_user::with_messages(strict_messages)
        .compile()
        .unwrap();
    let factory = configuration.message_factory(Arc::new(BasicSchemaAssertion));
    let machine = EventMachineBuilder::in_memory(
        configuration,
        Arc::new(FunctionalFlavour::new(Arc::new(typed_port()), factory.clone())),
    )
    .message_factory(factory)
    .build()
    .unwrap();
    machine.setup().await.unwrap();
    let register = |username: &str| {
        machine
            .create_message(
                "RegisterUser",
                json!({ "userId": "u-1", "username": username, "email": "a@x.com" }),
            )
            .unwrap()
    };

    let error = machine.dispatch(register("Al")).await.unwrap_err();
    let events = machine.dispatch(register("Alexandra")).await.unwrap();

    assert!(matches!(error, Error::Validation(_)), "{error}");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload_value().unwrap()["username"], json!("Alexandra"));
}
