//! `#[derive(Error)]` for VM and store error enums.
//!
//! ```ignore
//! use gnovm_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum StoreError {
//!     #[error("object {0} not found")]
//!     MissingObject(ObjectId),
//!
//!     #[error("duplicate type {id}: {existing} vs {incoming}")]
//!     DuplicateType { id: TypeId, existing: String, incoming: String },
//!
//!     #[error("decode failed: {0}")]
//!     Decode(#[from] DecodeError),
//! }
//! ```
//!
//! Positional placeholders (`{0}`, `{1:?}`) refer to tuple fields, named
//! placeholders refer to struct fields by name.
//! A `#[from]` field gets a `From` impl and is reported as the `source()`.

use proc_macro::TokenStream;
use quote::{format_ident, quote, ToTokens};
use syn::{parse_macro_input, Data, DeriveInput, Fields, Lit, Meta};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

struct FromField {
    variant: syn::Ident,
    ty: syn::Type,
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (display_body, from_fields) = match &input.data {
        Data::Enum(data) => {
            let mut arms = Vec::with_capacity(data.variants.len());
            let mut from_fields = Vec::new();
            for variant in &data.variants {
                let ident = &variant.ident;
                let msg = message(&variant.attrs, ident, &format!("variant `{}`", ident))?;
                let arm = match &variant.fields {
                    Fields::Unit => quote! { Self::#ident => write!(f, #msg), },
                    Fields::Unnamed(fields) => {
                        let binds: Vec<_> =
                            (0..fields.unnamed.len()).map(|i| format_ident!("f{}", i)).collect();
                        let msg = positional_to_named(&msg, fields.unnamed.len());
                        if let Some(from) = from_field(variant, fields)? {
                            from_fields.push(from);
                        }
                        let args = referenced(&msg, binds.iter());
                        quote! { Self::#ident(#(#binds),*) => write!(f, #msg #(, #args = #args)*), }
                    }
                    Fields::Named(fields) => {
                        let binds: Vec<_> = fields.named.iter().filter_map(|f| f.ident.clone()).collect();
                        let args = referenced(&msg, binds.iter());
                        quote! { Self::#ident { #(#binds),* } => write!(f, #msg #(, #args = #args)*), }
                    }
                };
                arms.push(arm);
            }
            (quote! { match self { #(#arms)* } }, from_fields)
        }
        Data::Struct(data) => {
            let msg = message(&input.attrs, &input.ident, &format!("type `{}`", input.ident))?;
            let body = match &data.fields {
                Fields::Unit => quote! { write!(f, #msg) },
                Fields::Named(fields) => {
                    let binds: Vec<_> = fields.named.iter().filter_map(|f| f.ident.clone()).collect();
                    let args = referenced(&msg, binds.iter());
                    quote! {
                        let Self { #(#binds),* } = self;
                        write!(f, #msg #(, #args = #args)*)
                    }
                }
                Fields::Unnamed(fields) => {
                    let binds: Vec<_> =
                        (0..fields.unnamed.len()).map(|i| format_ident!("f{}", i)).collect();
                    let msg = positional_to_named(&msg, fields.unnamed.len());
                    let args = referenced(&msg, binds.iter());
                    quote! {
                        let Self(#(#binds),*) = self;
                        write!(f, #msg #(, #args = #args)*)
                    }
                }
            };
            (body, Vec::new())
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(input, "Error derive does not support unions"));
        }
    };

    let source_arms = from_fields.iter().map(|from| {
        let variant = &from.variant;
        quote! { Self::#variant(inner) => Some(inner), }
    });
    let source_fn = if from_fields.is_empty() {
        quote! {}
    } else {
        quote! {
            fn source(&self) -> Option<&(dyn ::std::error::Error + 'static)> {
                #[allow(unreachable_patterns)]
                match self {
                    #(#source_arms)*
                    _ => None,
                }
            }
        }
    };
    let from_impls = from_fields.iter().map(|from| {
        let variant = &from.variant;
        let ty = &from.ty;
        quote! {
            impl #impl_generics ::std::convert::From<#ty> for #name #ty_generics #where_clause {
                fn from(inner: #ty) -> Self {
                    Self::#variant(inner)
                }
            }
        }
    });

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #display_body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {
            #source_fn
        }

        #(#from_impls)*
    })
}

fn from_field(variant: &syn::Variant, fields: &syn::FieldsUnnamed) -> syn::Result<Option<FromField>> {
    let marked: Vec<_> = fields
        .unnamed
        .iter()
        .filter(|f| f.attrs.iter().any(|a| a.path().is_ident("from")))
        .collect();
    match (marked.len(), fields.unnamed.len()) {
        (0, _) => Ok(None),
        (1, 1) => Ok(Some(FromField {
            variant: variant.ident.clone(),
            ty: marked[0].ty.clone(),
        })),
        _ => Err(syn::Error::new_spanned(
            &variant.ident,
            "#[from] is only supported on single-field tuple variants",
        )),
    }
}

fn message<T: ToTokens>(attrs: &[syn::Attribute], target: &T, desc: &str) -> syn::Result<String> {
    let Some(attr) = attrs.iter().find(|a| a.path().is_ident("error")) else {
        return Err(syn::Error::new_spanned(
            target,
            format!("missing #[error(\"...\")] attribute on {}", desc),
        ));
    };
    let Meta::List(list) = &attr.meta else {
        return Err(syn::Error::new_spanned(&attr.meta, "expected #[error(\"message\")]"));
    };
    match syn::parse2::<Lit>(list.tokens.clone()) {
        Ok(Lit::Str(lit)) => Ok(lit.value()),
        _ => Err(syn::Error::new_spanned(
            &attr.meta,
            "#[error] message must be a string literal",
        )),
    }
}

/// Fields named by a `{name}` or `{name:...}` placeholder in `msg`.
fn referenced<'a>(msg: &str, binds: impl Iterator<Item = &'a syn::Ident>) -> Vec<&'a syn::Ident> {
    binds
        .filter(|ident| {
            let name = ident.to_string();
            msg.contains(&format!("{{{}}}", name)) || msg.contains(&format!("{{{}:", name))
        })
        .collect()
}

/// Rewrites `{0}` and `{0:?}` style placeholders to `{f0}` and `{f0:?}`.
fn positional_to_named(msg: &str, field_count: usize) -> String {
    let mut out = String::with_capacity(msg.len() + 8);
    let bytes = msg.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
            out.push_str("{{");
            i += 2;
            continue;
        }
        if bytes[i] == b'{' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            let closes = matches!(bytes.get(end), Some(b'}') | Some(b':'));
            if end > start && closes {
                if let Ok(idx) = msg[start..end].parse::<usize>() {
                    if idx < field_count {
                        out.push_str("{f");
                        out.push_str(&msg[start..end]);
                        i = end;
                        continue;
                    }
                }
            }
        }
        let ch = msg[i..].chars().next().unwrap_or('\u{fffd}');
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}
