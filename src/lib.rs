//! Tree-walking virtual machine for a Go-like contract language.
//!
//! Provides the interpreter, its value model and type system, and realm
//! ownership tracking that persists reachable objects into a content-hashed
//! store.

pub mod types;
pub mod utils;
pub mod virtual_machine;
