use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, Item, LitStr, Token};

use crate::utils::{error, has_name, str_literal_from_ident};

#[derive(Copy, Clone)]
pub enum Kind {
    Command,
    Event,
    Query,
}

impl Kind {
    fn message_type(self) -> quote::__private::TokenStream {
        match self {
            Kind::Command => quote! { augure::MessageType::Command },
            Kind::Event => quote! { augure::MessageType::Event },
            Kind::Query => quote! { augure::MessageType::Query },
        }
    }

    fn label(self) -> &'static str {
        match self {
            Kind::Command => "Command",
            Kind::Event => "Event",
            Kind::Query => "Query",
        }
    }
}

pub fn derive_message(message: TokenStream, kind: Kind) -> TokenStream {
    let item = parse_macro_input!(message as Item);

    let (type_name, generics, attributes) = match item {
        Item::Struct(item) => (item.ident, item.generics, item.attrs),
        Item::Enum(item) => (item.ident, item.generics, item.attrs),
        _ => {
            return error(
                item,
                format!("{} can only be derived for a struct or an enum", kind.label()),
            )
        }
    };

    let message_name = match MessageInfo::try_from(attributes.as_slice()) {
        Ok(info) => info
            .message_name
            .unwrap_or_else(|| str_literal_from_ident(&type_name)),
        Err(error) => return error.into_compile_error().into(),
    };
    if message_name.value().trim().is_empty() {
        return error(message_name, "a message name must not be empty");
    }

    let message_type = kind.message_type();
    let (impl_generics, type_generics, where_clause) = generics.split_for_impl();

    TokenStream::from(quote! {
        impl #impl_generics augure::TypedMessage for #type_name #type_generics #where_clause {
            const NAME: &'static str = #message_name;
            const MESSAGE_TYPE: augure::MessageType = #message_type;
        }
    })
}

#[derive(Default)]
struct MessageInfo {
    message_name: Option<LitStr>,
}

impl Parse for MessageInfo {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            Ok(MessageInfo::default())
        } else {
            let argument = input.parse::<Ident>()?;
            if argument != "name" {
                Err(syn::Error::new_spanned(argument, "unexpected argument"))
            } else {
                input.parse::<Token![=]>()?;
                Ok(MessageInfo {
                    message_name: Some(input.parse()?),
                })
            }
        }
    }
}

impl TryFrom<&[Attribute]> for MessageInfo {
    type Error = syn::Error;

    fn try_from(attributes: &[Attribute]) -> Result<Self, Self::Error> {
        for attribute in attributes {
            if has_name(attribute, "augure") {
                return attribute.parse_args();
            }
        }
        Ok(MessageInfo::default())
    }
}
