//! Stack-based tree-walking interpreter with persistent realms.
//!
//! The interpreter executes pre-resolved syntax trees (see [`ast`]) one op at
//! a time. Every name reference carries a `(depth, index)` path into the
//! block chain, so execution never looks names up by string.
//!
//! # Architecture
//!
//! - **Op stack**: [`machine::Machine`] pops an op, dispatches it to an
//!   `op_*` handler and handlers push further ops, values and blocks
//! - **Heap**: arrays, structs, maps, blocks and boxed values live in an
//!   arena addressed by [`values::ObjRef`]; every allocation is charged to
//!   the [`alloc::Allocator`]
//! - **Panics**: language panics unwind call frames and run deferred calls,
//!   which may recover them; anything else is a fatal [`errors::MachineError`]
//! - **Realms**: packages under `gno.land/r/` own their reachable objects;
//!   at finalization [`realm::Realm`] assigns ids, counts references and
//!   writes hashed images through the [`store::Store`]
//!
//! # Modules
//!
//! - [`alloc`]: allocation accounting against a ceiling
//! - [`ast`]: resolved syntax tree and test builders
//! - [`convert`]: value conversions between types
//! - [`errors`]: fatal, conversion and store errors
//! - [`heap`]: object arena and value copying
//! - [`image`]: persisted object images and their hashes
//! - [`machine`]: the interpreter and its entry points
//! - [`native`]: host function bridge
//! - [`ownership`]: object ids and ownership metadata
//! - [`realm`]: dirty tracking and realm finalization
//! - [`store`]: persistence backends
//! - [`type_system`]: types and type ids
//! - [`uverse`]: predeclared types and builtins
//! - [`values`]: runtime values

pub mod alloc;
pub mod ast;
pub mod convert;
pub mod errors;
pub mod heap;
pub mod image;
pub mod machine;
pub mod native;
pub mod ownership;
pub mod realm;
pub mod store;
pub mod type_system;
pub mod uverse;
pub mod values;
