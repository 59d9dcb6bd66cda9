//! `#[derive(BinaryCodec)]` for store records and image types.
//!
//! Fields are written in declaration order using the `Encode`/`Decode`
//! impls from `crate::types::encoding`. Enums carry a one-byte tag; an
//! unknown tag on decode becomes `DecodeError::InvalidTag`.
//!
//! ```ignore
//! #[derive(BinaryCodec)]
//! pub struct ObjectRecord {
//!     pub id: ObjectId,
//!     pub hash: Hash,
//!     pub image: Vec<u8>,
//! }
//! ```

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Data, DataEnum, DeriveInput, Fields};

pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (encode_body, decode_body) = match &input.data {
        Data::Struct(data) => {
            let (pattern, encode, construct) = fields_codec(&data.fields, quote! { Self });
            (
                quote! {
                    let #pattern = self;
                    #encode
                },
                quote! { Ok(#construct) },
            )
        }
        Data::Enum(data) => enum_codec(data)?,
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "BinaryCodec derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn decode(
                input: &mut &[u8],
            ) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                #decode_body
            }
        }
    })
}

/// Builds the destructuring pattern, the encode statements and the
/// constructor expression for one set of fields under `path`.
fn fields_codec(
    fields: &Fields,
    path: proc_macro2::TokenStream,
) -> (proc_macro2::TokenStream, proc_macro2::TokenStream, proc_macro2::TokenStream) {
    let decode_one = quote! { crate::types::encoding::Decode::decode(input)? };
    match fields {
        Fields::Unit => (path.clone(), quote! {}, path),
        Fields::Unnamed(fields) => {
            let binds: Vec<_> = (0..fields.unnamed.len()).map(|i| format_ident!("f{}", i)).collect();
            let decodes = binds.iter().map(|_| decode_one.clone());
            (
                quote! { #path(#(#binds),*) },
                quote! { #(crate::types::encoding::Encode::encode(#binds, out);)* },
                quote! { #path(#(#decodes),*) },
            )
        }
        Fields::Named(fields) => {
            let binds: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
            (
                quote! { #path { #(#binds),* } },
                quote! { #(crate::types::encoding::Encode::encode(#binds, out);)* },
                quote! { #path { #(#binds: #decode_one),* } },
            )
        }
    }
}

fn enum_codec(
    data: &DataEnum,
) -> syn::Result<(proc_macro2::TokenStream, proc_macro2::TokenStream)> {
    let tags = discriminants(data)?;
    let mut encode_arms = Vec::with_capacity(tags.len());
    let mut decode_arms = Vec::with_capacity(tags.len());
    for (variant, tag) in data.variants.iter().zip(tags) {
        let ident = &variant.ident;
        let (pattern, encode, construct) = fields_codec(&variant.fields, quote! { Self::#ident });
        encode_arms.push(quote! {
            #pattern => {
                crate::types::encoding::Encode::encode(&#tag, out);
                #encode
            }
        });
        decode_arms.push(quote! { #tag => Ok(#construct), });
    }
    let encode = quote! {
        match self {
            #(#encode_arms)*
        }
    };
    let decode = quote! {
        let tag: u8 = crate::types::encoding::Decode::decode(input)?;
        match tag {
            #(#decode_arms)*
            other => Err(crate::types::encoding::DecodeError::InvalidTag(other)),
        }
    };
    Ok((encode, decode))
}

/// Tags follow Rust's discriminant rules: explicit integer literals are
/// honored and the rest count up from the previous variant.
fn discriminants(data: &DataEnum) -> syn::Result<Vec<u8>> {
    let mut tags = Vec::with_capacity(data.variants.len());
    let mut next: u16 = 0;
    for variant in &data.variants {
        let tag = match &variant.discriminant {
            Some((_, syn::Expr::Lit(syn::ExprLit { lit: syn::Lit::Int(lit), .. }))) => {
                lit.base10_parse::<u8>()?
            }
            Some((_, expr)) => {
                return Err(syn::Error::new_spanned(
                    expr,
                    "discriminant must be an integer literal",
                ));
            }
            None => u8::try_from(next).map_err(|_| {
                syn::Error::new_spanned(&variant.ident, "more than 256 variants")
            })?,
        };
        tags.push(tag);
        next = u16::from(tag) + 1;
    }
    Ok(tags)
}
