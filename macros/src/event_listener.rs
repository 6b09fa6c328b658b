use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn, Signature};

use crate::utils::{error, extract_parameter};

pub fn event_listener(arguments: TokenStream, listener: TokenStream) -> TokenStream {
    let ItemFn {
        vis,
        sig,
        block,
        attrs,
        ..
    } = parse_macro_input!(listener as ItemFn);

    let Signature {
        asyncness,
        ident: listener_name,
        inputs,
        generics,
        ..
    } = sig;

    if !arguments.is_empty() {
        return error(listener_name, "an event listener takes no argument");
    }
    if asyncness.is_none() {
        return error(listener_name, "an event listener must be async");
    }
    if !generics.params.is_empty() {
        return error(generics, "an event listener cannot be generic");
    }

    let (parameter, parameter_type) = match extract_parameter(&inputs) {
        Some(result) => result,
        None => {
            return error(
                inputs,
                r#"arguments of an event listener should match "(event: E)" where E is a typed event"#,
            )
        }
    };

    TokenStream::from(quote! {
        #(#attrs)*
        #[allow(non_camel_case_types)]
        #vis struct #listener_name;

        impl #listener_name {
            /// The name of the event handled by this listener.
            #vis const EVENT_NAME: &'static str = <#parameter_type as augure::TypedMessage>::NAME;
        }

        #[augure::async_trait]
        impl augure::EventListener for #listener_name {
            async fn handle(
                &self,
                event: &augure::Message,
            ) -> ::std::result::Result<augure::Commands, augure::Error> {
                let #parameter: #parameter_type = event.deserialize()?;
                #block
            }
        }
    })
}
