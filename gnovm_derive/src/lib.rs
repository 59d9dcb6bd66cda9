//! Derive macros for the gnovm crate.
//!
//! - `#[derive(BinaryCodec)]` writes the deterministic `Encode`/`Decode` impls
//!   used for store records.
//! - `#[derive(Error)]` writes `Display`, `Error` and `#[from]` conversions.

mod binary_codec;
mod error;

use proc_macro::TokenStream;

#[proc_macro_derive(BinaryCodec)]
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    binary_codec::derive_binary_codec(input)
}

#[proc_macro_derive(Error, attributes(error, from))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}
