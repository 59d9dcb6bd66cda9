use crate::types::encoding::DecodeError;
use crate::virtual_machine::ownership::ObjectId;
use crate::virtual_machine::type_system::{Kind, TypeId};
use gnovm_derive::Error;

/// Fatal interpreter errors.
///
/// Language-level panics never surface as a `MachineError` while a deferred
/// call can still recover them. Everything here aborts the execution and the
/// active realm's working sets are discarded.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("allocation limit exceeded: {used} > {ceiling}")]
    AllocationLimit { used: u64, ceiling: u64 },
    #[error("{0} stack underflow")]
    StackUnderflow(&'static str),
    #[error("no call frame found")]
    MissingFrame,
    #[error("malformed node: {0}")]
    MalformedNode(String),
    #[error("unexpected value: expected {expected}, got {actual}")]
    UnexpectedValue { expected: &'static str, actual: String },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("untyped type {0} has no type id")]
    UntypedTypeId(String),
    #[error("{0:?} is not comparable")]
    UncomparableKind(Kind),
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),
    #[error("duplicate package {0}")]
    DuplicatePackage(String),
    #[error("package {0} not found")]
    MissingPackage(String),
    #[error("duplicate object {0}")]
    DuplicateObject(ObjectId),
    #[error("duplicate type {0}")]
    DuplicateType(TypeId),
    #[error("object {0} not found")]
    MissingObject(ObjectId),
    #[error("type {0} not found")]
    MissingType(TypeId),
    #[error("native function {pkg_path}.{name} not registered")]
    MissingNative { pkg_path: String, name: String },
    #[error("cannot modify object {0} owned by another realm")]
    CrossRealmWrite(ObjectId),
    #[error("unrecovered panic: {value}\n{trace}")]
    UnrecoveredPanic { value: String, trace: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("machine not empty: {0}")]
    LeftoverState(String),
}

impl MachineError {
    pub fn malformed(what: impl Into<String>) -> Self {
        MachineError::MalformedNode(what.into())
    }

    pub fn unexpected(expected: &'static str, actual: impl std::fmt::Debug) -> Self {
        MachineError::UnexpectedValue {
            expected,
            actual: format!("{:?}", actual),
        }
    }
}

/// Illegal or lossy conversions. Raised as language-level panics, except
/// for unsupported kinds and allocation failures which are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("cannot convert {from} to {to}")]
    Invalid { from: String, to: String },
    #[error("constant {value} overflows {target}")]
    Overflow { value: String, target: String },
    #[error("unsupported kind: {0}")]
    Unsupported(String),
    #[error("allocation limit exceeded: {used} > {ceiling}")]
    AllocationLimit { used: u64, ceiling: u64 },
}

impl ConvertError {
    pub fn invalid(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        ConvertError::Invalid {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<MachineError> for ConvertError {
    fn from(err: MachineError) -> Self {
        match err {
            MachineError::AllocationLimit { used, ceiling } => {
                ConvertError::AllocationLimit { used, ceiling }
            }
            other => ConvertError::Unsupported(other.to_string()),
        }
    }
}

/// Persistence-layer failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("package {0} already exists")]
    DuplicatePackage(String),
    #[error("object {0} already exists")]
    DuplicateObject(ObjectId),
    #[error("type {id} already registered as {existing}, got {incoming}")]
    DuplicateType {
        id: TypeId,
        existing: String,
        incoming: String,
    },
    #[error("type {0} not found")]
    MissingType(TypeId),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] DecodeError),
}

impl StoreError {
    /// Lifts duplicate registrations to their fatal machine counterparts.
    pub fn into_machine(self) -> MachineError {
        match self {
            StoreError::DuplicatePackage(path) => MachineError::DuplicatePackage(path),
            StoreError::DuplicateObject(id) => MachineError::DuplicateObject(id),
            StoreError::DuplicateType { id, .. } => MachineError::DuplicateType(id),
            StoreError::MissingType(id) => MachineError::MissingType(id),
            other => MachineError::Store(other),
        }
    }
}
