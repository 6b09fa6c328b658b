use proc_macro::TokenStream;
use quote::ToTokens;
use std::fmt::Display;
use syn::punctuated::Punctuated;
use syn::token::Comma;
use syn::{Attribute, FnArg, Ident, LitStr, Pat, Type};

pub fn error(tokens: impl ToTokens, message: impl Display) -> TokenStream {
    syn::Error::new_spanned(tokens, message)
        .to_compile_error()
        .into()
}

pub fn has_name(attribute: &Attribute, name: &str) -> bool {
    let path = attribute.path();
    path.segments.len() == 1 && path.segments[0].ident == name
}

pub fn extract_parameter(inputs: &Punctuated<FnArg, Comma>) -> Option<(&Pat, &Type)> {
    match inputs.first() {
        Some(FnArg::Typed(parameter)) if inputs.len() == 1 => {
            match parameter.ty.as_ref() {
                Type::Reference(_) => None,
                parameter_type => Some((parameter.pat.as_ref(), parameter_type)),
            }
        }
        _ => None,
    }
}

/// Messages are named after their type, `RegisterUser` for `struct RegisterUser`.
pub fn str_literal_from_ident(type_name: &Ident) -> LitStr {
    LitStr::new(&type_name.to_string(), type_name.span())
}
