use crate::{Error, Message, MessageType, TypedMessage};

/// Follow-up commands returned by an [EventListener](crate::EventListener).
///
/// They are dispatched by the [EventMachine](crate::EventMachine) once the current command has
/// been fully processed.
#[derive(Debug, Default, Clone)]
#[repr(transparent)]
pub struct Commands(pub Vec<Message>);

impl Commands {
    /// Creates an empty [Commands].
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a command. Fails if the message is not a command.
    pub fn add(&mut self, command: Message) -> Result<(), Error> {
        if command.message_type() != MessageType::Command {
            return Err(Error::configuration(format!(
                "{} is a {}, only commands can be issued by a listener",
                command.name(),
                command.message_type()
            )));
        }
        self.0.push(command);
        Ok(())
    }

    /// Wraps a typed command and adds it.
    pub fn add_typed<C: TypedMessage>(&mut self, command: C) -> Result<(), Error> {
        self.add(Message::from_typed(command)?)
    }

    /// Whether no command was issued.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Message> for Commands {
    fn from_iter<T: IntoIterator<Item = Message>>(iter: T) -> Self {
        Commands(iter.into_iter().collect())
    }
}

impl IntoIterator for Commands {
    type Item = Message;
    type IntoIter = <Vec<Message> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Creates a new [Commands] containing the command messages passed as arguments.
#[macro_export]
macro_rules! commands {
    ($($commands: expr),* $(,)?) => {
        $crate::Commands(vec![$($commands),*])
    }
}

/// Creates a vector of yielded typed events, to be returned by a functional business function.
///
/// ```ignore
/// functional::aggregate_factory(|command: &RegisterUser, _| {
///     events![UserWasRegistered { user_id: command.user_id.clone() }]
/// })
/// ```
#[macro_export]
macro_rules! events {
    ($($events: expr),* $(,)?) => {
        vec![$(Some($crate::TypedEvent::from($events))),*]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Payload;

    #[test]
    fn test_only_commands_can_be_added() {
        let mut commands = Commands::new();
        let event = Message::new("UserWasRegistered", MessageType::Event, Payload::default())
            .unwrap();
        let command =
            Message::new("SendWelcomeMail", MessageType::Command, Payload::default()).unwrap();

        assert!(commands.add(event).is_err());
        commands.add(command).unwrap();

        assert_eq!(commands.into_iter().count(), 1);
    }

    #[test]
    fn test_commands_macro() {
        let command =
            Message::new("SendWelcomeMail", MessageType::Command, Payload::default()).unwrap();

        let commands = commands![command.clone(), command];

        assert_eq!(commands.0.len(), 2);
        assert!(commands!().is_empty());
    }
}
