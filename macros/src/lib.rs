use proc_macro::TokenStream;

mod event_listener;
mod message;
pub(crate) mod utils;

#[proc_macro_derive(Command, attributes(augure))]
pub fn derive_command(command: TokenStream) -> TokenStream {
    message::derive_message(command, message::Kind::Command)
}

#[proc_macro_derive(Event, attributes(augure))]
pub fn derive_event(event: TokenStream) -> TokenStream {
    message::derive_message(event, message::Kind::Event)
}

#[proc_macro_derive(Query, attributes(augure))]
pub fn derive_query(query: TokenStream) -> TokenStream {
    message::derive_message(query, message::Kind::Query)
}

#[proc_macro_attribute]
pub fn event_listener(arguments: TokenStream, listener: TokenStream) -> TokenStream {
    event_listener::event_listener(arguments, listener)
}
