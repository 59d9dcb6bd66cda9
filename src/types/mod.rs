//! Deterministic encoding and hashing primitives shared by the VM and the
//! store.

pub mod encoding;
pub mod hash;
