//! Runtime type descriptions, kinds and content-addressed type identity.
//!
//! Types are compared structurally through their [`TypeId`], never by
//! pointer, so a type decoded from the store is interchangeable with the one
//! built by declarations.

use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use crate::types::hash::{Hash, HashBuilder};
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::values::FuncValue;
use gnovm_derive::BinaryCodec;
use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

pub type Name = Rc<str>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BinaryCodec)]
pub struct TypeId(pub Hash);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0.short())
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Coarse category of a type, used for operator dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BinaryCodec)]
pub enum Kind {
    Invalid,
    Bool,
    String,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bigint,
    Array,
    Slice,
    Pointer,
    Struct,
    Package,
    Interface,
    Chan,
    Func,
    Map,
    Type,
    Block,
    Tuple,
    Native,
}

impl Kind {
    pub fn is_signed_int(self) -> bool {
        matches!(self, Kind::Int | Kind::Int8 | Kind::Int16 | Kind::Int32 | Kind::Int64)
    }

    pub fn is_unsigned_int(self) -> bool {
        matches!(
            self,
            Kind::Uint | Kind::Uint8 | Kind::Uint16 | Kind::Uint32 | Kind::Uint64
        )
    }

    pub fn is_integer(self) -> bool {
        self.is_signed_int() || self.is_unsigned_int()
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self == Kind::Bigint
    }

    /// Bit width of a fixed-size integer kind.
    pub fn bits(self) -> u32 {
        match self {
            Kind::Int8 | Kind::Uint8 => 8,
            Kind::Int16 | Kind::Uint16 => 16,
            Kind::Int32 | Kind::Uint32 => 32,
            _ => 64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BinaryCodec)]
pub enum PrimitiveType {
    UntypedBool,
    Bool,
    UntypedString,
    String,
    Int,
    Int8,
    Int16,
    UntypedRune,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    UntypedBigint,
    Bigint,
}

impl PrimitiveType {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::UntypedBool => "untyped bool",
            PrimitiveType::Bool => "bool",
            PrimitiveType::UntypedString => "untyped string",
            PrimitiveType::String => "string",
            PrimitiveType::Int => "int",
            PrimitiveType::Int8 => "int8",
            PrimitiveType::Int16 => "int16",
            PrimitiveType::UntypedRune => "untyped rune",
            PrimitiveType::Int32 => "int32",
            PrimitiveType::Int64 => "int64",
            PrimitiveType::Uint => "uint",
            PrimitiveType::Uint8 => "uint8",
            PrimitiveType::Uint16 => "uint16",
            PrimitiveType::Uint32 => "uint32",
            PrimitiveType::Uint64 => "uint64",
            PrimitiveType::UntypedBigint => "untyped bigint",
            PrimitiveType::Bigint => "bigint",
        }
    }

    pub fn kind(self) -> Kind {
        match self {
            PrimitiveType::UntypedBool | PrimitiveType::Bool => Kind::Bool,
            PrimitiveType::UntypedString | PrimitiveType::String => Kind::String,
            PrimitiveType::Int => Kind::Int,
            PrimitiveType::Int8 => Kind::Int8,
            PrimitiveType::Int16 => Kind::Int16,
            PrimitiveType::UntypedRune | PrimitiveType::Int32 => Kind::Int32,
            PrimitiveType::Int64 => Kind::Int64,
            PrimitiveType::Uint => Kind::Uint,
            PrimitiveType::Uint8 => Kind::Uint8,
            PrimitiveType::Uint16 => Kind::Uint16,
            PrimitiveType::Uint32 => Kind::Uint32,
            PrimitiveType::Uint64 => Kind::Uint64,
            PrimitiveType::UntypedBigint | PrimitiveType::Bigint => Kind::Bigint,
        }
    }

    pub fn is_untyped(self) -> bool {
        matches!(
            self,
            PrimitiveType::UntypedBool
                | PrimitiveType::UntypedString
                | PrimitiveType::UntypedRune
                | PrimitiveType::UntypedBigint
        )
    }

    /// Type an untyped constant takes when nothing else constrains it.
    pub fn default_type(self) -> PrimitiveType {
        match self {
            PrimitiveType::UntypedBool => PrimitiveType::Bool,
            PrimitiveType::UntypedString => PrimitiveType::String,
            PrimitiveType::UntypedRune => PrimitiveType::Int32,
            PrimitiveType::UntypedBigint => PrimitiveType::Int,
            other => other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldType {
    pub name: Name,
    pub typ: Type,
    pub embedded: bool,
}

impl FieldType {
    pub fn new(name: &str, typ: Type) -> Self {
        FieldType {
            name: Rc::from(name),
            typ,
            embedded: false,
        }
    }

    pub fn embedded(typ: Type) -> Self {
        let name = match &typ {
            Type::Declared(dt) => dt.name.clone(),
            Type::Pointer(pt) => match &pt.elem {
                Type::Declared(dt) => dt.name.clone(),
                other => Rc::from(other.to_string()),
            },
            other => Rc::from(other.to_string()),
        };
        FieldType {
            name,
            typ,
            embedded: true,
        }
    }

    pub fn is_exported(&self) -> bool {
        is_exported(&self.name)
    }
}

pub fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_uppercase())
}

#[derive(Debug)]
pub struct PointerType {
    pub elem: Type,
    id: OnceCell<TypeId>,
}

#[derive(Debug)]
pub struct ArrayType {
    pub len: usize,
    pub elem: Type,
    id: OnceCell<TypeId>,
}

#[derive(Debug)]
pub struct SliceType {
    pub elem: Type,
    /// Set for the trailing `...T` parameter of a variadic function.
    pub variadic: bool,
    id: OnceCell<TypeId>,
}

#[derive(Debug)]
pub struct StructType {
    pub pkg_path: Name,
    pub fields: Vec<FieldType>,
    /// Field name to index path, including fields promoted from embedded
    /// structs. Shallower names win.
    paths: HashMap<Name, Vec<u16>>,
    id: OnceCell<TypeId>,
}

impl StructType {
    pub fn field_path(&self, name: &str) -> Option<&[u16]> {
        self.paths.get(name).map(|p| p.as_slice())
    }

    pub fn field_index(&self, name: &str) -> Option<u16> {
        self.fields
            .iter()
            .position(|f| &*f.name == name)
            .map(|i| i as u16)
    }
}

#[derive(Debug)]
pub struct MapType {
    pub key: Type,
    pub value: Type,
    id: OnceCell<TypeId>,
}

#[derive(Debug)]
pub struct FuncType {
    pub params: Vec<FieldType>,
    pub results: Vec<FieldType>,
    pub variadic: bool,
    id: OnceCell<TypeId>,
}

impl FuncType {
    pub fn has_named_results(&self) -> bool {
        self.results.iter().any(|r| !r.name.is_empty() && &*r.name != "_")
    }
}

#[derive(Debug)]
pub struct InterfaceType {
    pub pkg_path: Name,
    /// Sorted by name.
    pub methods: Vec<FieldType>,
    id: OnceCell<TypeId>,
}

/// A method bound to a declared type.
#[derive(Clone, Debug)]
pub struct Method {
    pub name: Name,
    pub ptr_recv: bool,
    /// Signature without the receiver.
    pub typ: Type,
    pub func: Rc<FuncValue>,
}

pub struct DeclaredType {
    pub pkg_path: Name,
    pub name: Name,
    base: OnceCell<Type>,
    methods: RefCell<Vec<Method>>,
    id: OnceCell<TypeId>,
}

impl fmt::Debug for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeclaredType({})", self.qualified_name())
    }
}

impl DeclaredType {
    pub fn base(&self) -> Option<&Type> {
        self.base.get()
    }

    /// Completes a forward declaration. Fails if the base was already set.
    pub fn set_base(&self, base: Type) -> Result<(), MachineError> {
        self.base
            .set(base)
            .map_err(|_| MachineError::malformed(format!("type {} declared twice", self.name)))
    }

    pub fn qualified_name(&self) -> String {
        if self.pkg_path.is_empty() {
            self.name.to_string()
        } else {
            format!("{}.{}", self.pkg_path, self.name)
        }
    }

    /// Appends a method. Redefinition replaces the binding for that name.
    pub fn add_method(&self, method: Method) {
        let mut methods = self.methods.borrow_mut();
        match methods.binary_search_by(|m| m.name.cmp(&method.name)) {
            Ok(i) => methods[i] = method,
            Err(i) => methods.insert(i, method),
        }
    }

    pub fn find_method(&self, name: &str) -> Option<Method> {
        let methods = self.methods.borrow();
        methods
            .binary_search_by(|m| (*m.name).cmp(name))
            .ok()
            .map(|i| methods[i].clone())
    }

    pub fn method_names(&self) -> Vec<Name> {
        self.methods.borrow().iter().map(|m| m.name.clone()).collect()
    }
}

#[derive(Debug)]
pub struct ChanType {
    pub elem: Type,
    id: OnceCell<TypeId>,
}

#[derive(Debug)]
pub struct NativeType {
    pub name: Name,
    id: OnceCell<TypeId>,
}

#[derive(Debug)]
pub struct TupleType {
    pub elems: Vec<Type>,
    id: OnceCell<TypeId>,
}

#[derive(Clone, Debug)]
pub enum Type {
    Primitive(PrimitiveType),
    Pointer(Rc<PointerType>),
    Array(Rc<ArrayType>),
    Slice(Rc<SliceType>),
    Struct(Rc<StructType>),
    Map(Rc<MapType>),
    Func(Rc<FuncType>),
    Interface(Rc<InterfaceType>),
    Declared(Rc<DeclaredType>),
    Chan(Rc<ChanType>),
    Native(Rc<NativeType>),
    Tuple(Rc<TupleType>),
    Package,
    TypeType,
    Block,
}

impl Type {
    pub const BOOL: Type = Type::Primitive(PrimitiveType::Bool);
    pub const STRING: Type = Type::Primitive(PrimitiveType::String);
    pub const INT: Type = Type::Primitive(PrimitiveType::Int);
    pub const INT32: Type = Type::Primitive(PrimitiveType::Int32);
    pub const INT64: Type = Type::Primitive(PrimitiveType::Int64);
    pub const UINT8: Type = Type::Primitive(PrimitiveType::Uint8);
    pub const UINT64: Type = Type::Primitive(PrimitiveType::Uint64);
    pub const BIGINT: Type = Type::Primitive(PrimitiveType::Bigint);
    pub const UNTYPED_BIGINT: Type = Type::Primitive(PrimitiveType::UntypedBigint);
    pub const UNTYPED_BOOL: Type = Type::Primitive(PrimitiveType::UntypedBool);
    pub const UNTYPED_STRING: Type = Type::Primitive(PrimitiveType::UntypedString);
    pub const UNTYPED_RUNE: Type = Type::Primitive(PrimitiveType::UntypedRune);

    pub fn pointer(elem: Type) -> Type {
        Type::Pointer(Rc::new(PointerType {
            elem,
            id: OnceCell::new(),
        }))
    }

    pub fn array(len: usize, elem: Type) -> Type {
        Type::Array(Rc::new(ArrayType {
            len,
            elem,
            id: OnceCell::new(),
        }))
    }

    pub fn slice(elem: Type) -> Type {
        Type::Slice(Rc::new(SliceType {
            elem,
            variadic: false,
            id: OnceCell::new(),
        }))
    }

    pub fn variadic(elem: Type) -> Type {
        Type::Slice(Rc::new(SliceType {
            elem,
            variadic: true,
            id: OnceCell::new(),
        }))
    }

    pub fn map(key: Type, value: Type) -> Type {
        Type::Map(Rc::new(MapType {
            key,
            value,
            id: OnceCell::new(),
        }))
    }

    pub fn chan(elem: Type) -> Type {
        Type::Chan(Rc::new(ChanType {
            elem,
            id: OnceCell::new(),
        }))
    }

    pub fn native(name: &str) -> Type {
        Type::Native(Rc::new(NativeType {
            name: Rc::from(name),
            id: OnceCell::new(),
        }))
    }

    pub fn tuple(elems: Vec<Type>) -> Type {
        Type::Tuple(Rc::new(TupleType {
            elems,
            id: OnceCell::new(),
        }))
    }

    pub fn func(params: Vec<FieldType>, results: Vec<FieldType>, variadic: bool) -> Type {
        Type::Func(Rc::new(FuncType {
            params,
            results,
            variadic,
            id: OnceCell::new(),
        }))
    }

    pub fn strukt(pkg_path: &str, fields: Vec<FieldType>) -> Type {
        let mut paths: HashMap<Name, Vec<u16>> = HashMap::new();
        for (i, field) in fields.iter().enumerate() {
            paths.insert(field.name.clone(), vec![i as u16]);
        }
        for (i, field) in fields.iter().enumerate() {
            if !field.embedded {
                continue;
            }
            if let Type::Struct(inner) = field.typ.base() {
                for (name, path) in &inner.paths {
                    paths.entry(name.clone()).or_insert_with(|| {
                        let mut full = Vec::with_capacity(path.len() + 1);
                        full.push(i as u16);
                        full.extend_from_slice(path);
                        full
                    });
                }
            }
        }
        Type::Struct(Rc::new(StructType {
            pkg_path: Rc::from(pkg_path),
            fields,
            paths,
            id: OnceCell::new(),
        }))
    }

    pub fn interface(pkg_path: &str, mut methods: Vec<FieldType>) -> Type {
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        Type::Interface(Rc::new(InterfaceType {
            pkg_path: Rc::from(pkg_path),
            methods,
            id: OnceCell::new(),
        }))
    }

    /// A declared type whose base is set later with [`DeclaredType::set_base`].
    pub fn declared_forward(pkg_path: &str, name: &str) -> Type {
        Type::Declared(Rc::new(DeclaredType {
            pkg_path: Rc::from(pkg_path),
            name: Rc::from(name),
            base: OnceCell::new(),
            methods: RefCell::new(Vec::new()),
            id: OnceCell::new(),
        }))
    }

    pub fn declared(pkg_path: &str, name: &str, base: Type) -> Type {
        let base = base.base();
        let dt = DeclaredType {
            pkg_path: Rc::from(pkg_path),
            name: Rc::from(name),
            base: OnceCell::new(),
            methods: RefCell::new(Vec::new()),
            id: OnceCell::new(),
        };
        let _ = dt.base.set(base);
        Type::Declared(Rc::new(dt))
    }

    /// Structural kind; looks through declared types.
    pub fn kind(&self) -> Kind {
        match self {
            Type::Primitive(p) => p.kind(),
            Type::Pointer(_) => Kind::Pointer,
            Type::Array(_) => Kind::Array,
            Type::Slice(_) => Kind::Slice,
            Type::Struct(_) => Kind::Struct,
            Type::Map(_) => Kind::Map,
            Type::Func(_) => Kind::Func,
            Type::Interface(_) => Kind::Interface,
            Type::Declared(dt) => dt.base().map_or(Kind::Invalid, |b| b.kind()),
            Type::Chan(_) => Kind::Chan,
            Type::Native(_) => Kind::Native,
            Type::Tuple(_) => Kind::Tuple,
            Type::Package => Kind::Package,
            Type::TypeType => Kind::Type,
            Type::Block => Kind::Block,
        }
    }

    /// Underlying type with all declared wrappers removed.
    pub fn base(&self) -> Type {
        match self {
            Type::Declared(dt) => match dt.base() {
                Some(b) => b.base(),
                None => self.clone(),
            },
            other => other.clone(),
        }
    }

    pub fn elem(&self) -> Option<Type> {
        match self.base() {
            Type::Pointer(t) => Some(t.elem.clone()),
            Type::Array(t) => Some(t.elem.clone()),
            Type::Slice(t) => Some(t.elem.clone()),
            Type::Map(t) => Some(t.value.clone()),
            Type::Chan(t) => Some(t.elem.clone()),
            _ => None,
        }
    }

    pub fn is_untyped(&self) -> bool {
        matches!(self, Type::Primitive(p) if p.is_untyped())
    }

    pub fn is_interface(&self) -> bool {
        self.kind() == Kind::Interface
    }

    pub fn is_declared(&self) -> bool {
        matches!(self, Type::Declared(_))
    }

    pub fn as_struct(&self) -> Option<Rc<StructType>> {
        match self.base() {
            Type::Struct(st) => Some(st),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<Rc<FuncType>> {
        match self.base() {
            Type::Func(ft) => Some(ft),
            _ => None,
        }
    }

    pub fn as_declared(&self) -> Option<&Rc<DeclaredType>> {
        match self {
            Type::Declared(dt) => Some(dt),
            _ => None,
        }
    }

    /// Default type for untyped constants, identity otherwise.
    pub fn default_type(&self) -> Type {
        match self {
            Type::Primitive(p) => Type::Primitive(p.default_type()),
            other => other.clone(),
        }
    }

    /// Content hash of the canonical description. Memoized per instance.
    pub fn type_id(&self) -> Result<TypeId, MachineError> {
        let cell = match self {
            Type::Primitive(p) => {
                if p.is_untyped() {
                    return Err(MachineError::UntypedTypeId(p.name().to_string()));
                }
                return Ok(TypeId(Hash::digest(p.name().as_bytes())));
            }
            Type::Package | Type::TypeType | Type::Block => {
                return Ok(TypeId(Hash::digest(self.to_string().as_bytes())));
            }
            Type::Pointer(t) => &t.id,
            Type::Array(t) => &t.id,
            Type::Slice(t) => &t.id,
            Type::Struct(t) => &t.id,
            Type::Map(t) => &t.id,
            Type::Func(t) => &t.id,
            Type::Interface(t) => &t.id,
            Type::Declared(t) => &t.id,
            Type::Chan(t) => &t.id,
            Type::Native(t) => &t.id,
            Type::Tuple(t) => &t.id,
        };
        if let Some(id) = cell.get() {
            return Ok(*id);
        }
        let id = self.compute_type_id()?;
        let _ = cell.set(id);
        Ok(id)
    }

    fn compute_type_id(&self) -> Result<TypeId, MachineError> {
        if let Type::Declared(dt) = self {
            let base = dt
                .base()
                .ok_or_else(|| MachineError::malformed(format!("type {} has no base", dt.name)))?;
            let base_id = base.type_id()?;
            let mut h = HashBuilder::new();
            h.update(b"declared:");
            h.update(dt.qualified_name().as_bytes());
            h.update(&base_id.0 .0);
            return Ok(TypeId(h.finalize()));
        }
        self.check_typed()?;
        Ok(TypeId(Hash::digest(self.to_string().as_bytes())))
    }

    fn check_typed(&self) -> Result<(), MachineError> {
        match self {
            Type::Primitive(p) if p.is_untyped() => {
                Err(MachineError::UntypedTypeId(p.name().to_string()))
            }
            Type::Pointer(t) => t.elem.check_typed(),
            Type::Array(t) => t.elem.check_typed(),
            Type::Slice(t) => t.elem.check_typed(),
            Type::Chan(t) => t.elem.check_typed(),
            Type::Map(t) => {
                t.key.check_typed()?;
                t.value.check_typed()
            }
            Type::Struct(t) => t.fields.iter().try_for_each(|f| f.typ.check_typed()),
            Type::Func(t) => t
                .params
                .iter()
                .chain(t.results.iter())
                .try_for_each(|f| f.typ.check_typed()),
            Type::Interface(t) => t.methods.iter().try_for_each(|f| f.typ.check_typed()),
            Type::Tuple(t) => t.elems.iter().try_for_each(|e| e.check_typed()),
            _ => Ok(()),
        }
    }

    /// Method lookup through declared types and pointers to them.
    /// Value receivers see only value methods.
    pub fn find_method(&self, name: &str) -> Option<Method> {
        match self {
            Type::Declared(dt) => dt.find_method(name).filter(|m| !m.ptr_recv),
            Type::Pointer(pt) => match &pt.elem {
                Type::Declared(dt) => dt.find_method(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Reports whether `self`, an interface type, is satisfied by `t`.
    pub fn is_implemented_by(&self, t: &Type) -> bool {
        let Type::Interface(it) = self.base() else {
            return false;
        };
        it.methods.iter().all(|im| {
            let candidate = match t.base() {
                Type::Interface(other) => other
                    .methods
                    .iter()
                    .find(|m| m.name == im.name)
                    .map(|m| m.typ.clone()),
                _ => t.find_method(&im.name).map(|m| m.typ),
            };
            candidate.is_some_and(|ct| ct == im.typ)
        })
    }

    /// Writes the persisted image. Nested declared types are written as
    /// references so recursive declarations terminate.
    pub fn encode_image<S: EncodeSink>(&self, out: &mut S) {
        self.encode_inner(out, true);
    }

    fn encode_inner<S: EncodeSink>(&self, out: &mut S, top: bool) {
        match self {
            Type::Primitive(p) => {
                0u8.encode(out);
                p.encode(out);
            }
            Type::Pointer(t) => {
                1u8.encode(out);
                t.elem.encode_inner(out, false);
            }
            Type::Array(t) => {
                2u8.encode(out);
                t.len.encode(out);
                t.elem.encode_inner(out, false);
            }
            Type::Slice(t) => {
                3u8.encode(out);
                t.variadic.encode(out);
                t.elem.encode_inner(out, false);
            }
            Type::Struct(t) => {
                4u8.encode(out);
                t.pkg_path.encode(out);
                encode_fields(&t.fields, out);
            }
            Type::Map(t) => {
                5u8.encode(out);
                t.key.encode_inner(out, false);
                t.value.encode_inner(out, false);
            }
            Type::Func(t) => {
                6u8.encode(out);
                encode_fields(&t.params, out);
                encode_fields(&t.results, out);
                t.variadic.encode(out);
            }
            Type::Interface(t) => {
                7u8.encode(out);
                t.pkg_path.encode(out);
                encode_fields(&t.methods, out);
            }
            Type::Declared(dt) if top => {
                8u8.encode(out);
                dt.pkg_path.encode(out);
                dt.name.encode(out);
                match dt.base() {
                    Some(b) => b.encode_inner(out, false),
                    None => Type::Block.encode_inner(out, false),
                }
            }
            Type::Declared(dt) => {
                9u8.encode(out);
                dt.pkg_path.encode(out);
                dt.name.encode(out);
                // Unresolvable without a base; written as zero.
                self.type_id().unwrap_or_default().encode(out);
            }
            Type::Chan(t) => {
                10u8.encode(out);
                t.elem.encode_inner(out, false);
            }
            Type::Native(t) => {
                11u8.encode(out);
                t.name.encode(out);
            }
            Type::Tuple(t) => {
                12u8.encode(out);
                t.elems.len().encode(out);
                for e in &t.elems {
                    e.encode_inner(out, false);
                }
            }
            Type::Package => 13u8.encode(out),
            Type::TypeType => 14u8.encode(out),
            Type::Block => 15u8.encode(out),
        }
    }

    pub fn image(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_image(&mut out);
        out
    }

    pub fn decode_image(
        input: &mut &[u8],
        resolver: &mut dyn ResolveType,
    ) -> Result<Type, DecodeError> {
        let mut pending = Vec::new();
        decode_inner(input, resolver, &mut pending)
    }
}

/// Resolves declared-type references found inside a type image.
pub trait ResolveType {
    fn resolve(&mut self, id: TypeId) -> Result<Type, DecodeError>;
}

impl ResolveType for HashMap<TypeId, Type> {
    fn resolve(&mut self, id: TypeId) -> Result<Type, DecodeError> {
        self.get(&id).cloned().ok_or(DecodeError::InvalidValue)
    }
}

fn encode_fields<S: EncodeSink>(fields: &[FieldType], out: &mut S) {
    fields.len().encode(out);
    for f in fields {
        f.name.encode(out);
        f.embedded.encode(out);
        f.typ.encode_inner(out, false);
    }
}

fn decode_fields(
    input: &mut &[u8],
    resolver: &mut dyn ResolveType,
    pending: &mut Vec<Type>,
) -> Result<Vec<FieldType>, DecodeError> {
    let n = usize::decode(input)?;
    let mut fields = Vec::with_capacity(n.min(256));
    for _ in 0..n {
        let name = Name::decode(input)?;
        let embedded = bool::decode(input)?;
        let typ = decode_inner(input, resolver, pending)?;
        fields.push(FieldType {
            name,
            typ,
            embedded,
        });
    }
    Ok(fields)
}

fn decode_inner(
    input: &mut &[u8],
    resolver: &mut dyn ResolveType,
    pending: &mut Vec<Type>,
) -> Result<Type, DecodeError> {
    let tag = u8::decode(input)?;
    let t = match tag {
        0 => Type::Primitive(PrimitiveType::decode(input)?),
        1 => Type::pointer(decode_inner(input, resolver, pending)?),
        2 => {
            let len = usize::decode(input)?;
            Type::array(len, decode_inner(input, resolver, pending)?)
        }
        3 => {
            let variadic = bool::decode(input)?;
            let elem = decode_inner(input, resolver, pending)?;
            if variadic {
                Type::variadic(elem)
            } else {
                Type::slice(elem)
            }
        }
        4 => {
            let pkg = Name::decode(input)?;
            Type::strukt(&pkg, decode_fields(input, resolver, pending)?)
        }
        5 => {
            let key = decode_inner(input, resolver, pending)?;
            let value = decode_inner(input, resolver, pending)?;
            Type::map(key, value)
        }
        6 => {
            let params = decode_fields(input, resolver, pending)?;
            let results = decode_fields(input, resolver, pending)?;
            let variadic = bool::decode(input)?;
            Type::func(params, results, variadic)
        }
        7 => {
            let pkg = Name::decode(input)?;
            Type::interface(&pkg, decode_fields(input, resolver, pending)?)
        }
        8 => {
            let pkg = Name::decode(input)?;
            let name = Name::decode(input)?;
            let shell = Type::declared_forward(&pkg, &name);
            pending.push(shell.clone());
            let base = decode_inner(input, resolver, pending)?;
            pending.pop();
            if let Type::Declared(dt) = &shell {
                let _ = dt.base.set(base.base());
            }
            shell
        }
        9 => {
            let pkg = Name::decode(input)?;
            let name = Name::decode(input)?;
            let id = TypeId::decode(input)?;
            let open = pending.iter().find(|t| {
                t.as_declared()
                    .is_some_and(|dt| dt.pkg_path == pkg && dt.name == name)
            });
            match open {
                Some(t) => t.clone(),
                None => resolver.resolve(id)?,
            }
        }
        10 => Type::chan(decode_inner(input, resolver, pending)?),
        11 => Type::native(&Name::decode(input)?),
        12 => {
            let n = usize::decode(input)?;
            let mut elems = Vec::with_capacity(n.min(64));
            for _ in 0..n {
                elems.push(decode_inner(input, resolver, pending)?);
            }
            Type::tuple(elems)
        }
        13 => Type::Package,
        14 => Type::TypeType,
        15 => Type::Block,
        other => return Err(DecodeError::InvalidTag(other)),
    };
    Ok(t)
}

impl PartialEq for Type {
    fn eq(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Primitive(a), Type::Primitive(b)) => a == b,
            (Type::Declared(a), Type::Declared(b)) if Rc::ptr_eq(a, b) => true,
            _ => match (self.type_id(), other.type_id()) {
                (Ok(a), Ok(b)) => a == b,
                _ => self.to_string() == other.to_string(),
            },
        }
    }
}

fn write_fields(f: &mut fmt::Formatter<'_>, pkg: &str, fields: &[FieldType]) -> fmt::Result {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            write!(f, ";")?;
        }
        if field.embedded {
            write!(f, "~")?;
        }
        if field.is_exported() || pkg.is_empty() {
            write!(f, "{} {}", field.name, field.typ)?;
        } else {
            write!(f, "{}.{} {}", pkg, field.name, field.typ)?;
        }
    }
    Ok(())
}

fn write_types(f: &mut fmt::Formatter<'_>, fields: &[FieldType], variadic: bool) -> fmt::Result {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        match &field.typ {
            Type::Slice(st) if variadic && i + 1 == fields.len() => write!(f, "...{}", st.elem)?,
            t => write!(f, "{}", t)?,
        }
    }
    Ok(())
}

/// Canonical description. Also the preimage of non-declared type ids.
impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Primitive(p) => write!(f, "{}", p.name()),
            Type::Pointer(t) => write!(f, "*{}", t.elem),
            Type::Array(t) => write!(f, "[{}]{}", t.len, t.elem),
            Type::Slice(t) if t.variadic => write!(f, "...{}", t.elem),
            Type::Slice(t) => write!(f, "[]{}", t.elem),
            Type::Struct(t) => {
                write!(f, "struct{{")?;
                write_fields(f, &t.pkg_path, &t.fields)?;
                write!(f, "}}")
            }
            Type::Map(t) => write!(f, "map[{}]{}", t.key, t.value),
            Type::Func(t) => {
                write!(f, "func(")?;
                write_types(f, &t.params, t.variadic)?;
                write!(f, ")(")?;
                write_types(f, &t.results, false)?;
                write!(f, ")")
            }
            Type::Interface(t) => {
                write!(f, "interface{{")?;
                write_fields(f, &t.pkg_path, &t.methods)?;
                write!(f, "}}")
            }
            Type::Declared(dt) => write!(f, "{}", dt.qualified_name()),
            Type::Chan(t) => write!(f, "chan {}", t.elem),
            Type::Native(t) => write!(f, "native{{{}}}", t.name),
            Type::Tuple(t) => {
                write!(f, "(")?;
                for (i, e) in t.elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            Type::Package => write!(f, "package{{}}"),
            Type::TypeType => write!(f, "type{{}}"),
            Type::Block => write!(f, "block{{}}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(pkg: &str) -> Type {
        Type::strukt(
            pkg,
            vec![FieldType::new("X", Type::INT), FieldType::new("Y", Type::INT)],
        )
    }

    #[test]
    fn kind_looks_through_declared() {
        let t = Type::declared("gno.land/r/test", "Point", point("gno.land/r/test"));
        assert_eq!(t.kind(), Kind::Struct);
        let inner = Type::declared("gno.land/r/test", "Alias", t.clone());
        assert_eq!(inner.kind(), Kind::Struct);
        assert!(matches!(inner.base(), Type::Struct(_)));
    }

    #[test]
    fn canonical_strings() {
        assert_eq!(Type::slice(Type::INT).to_string(), "[]int");
        assert_eq!(Type::array(3, Type::UINT8).to_string(), "[3]uint8");
        assert_eq!(
            Type::map(Type::STRING, Type::pointer(Type::INT)).to_string(),
            "map[string]*int"
        );
        let f = Type::func(
            vec![
                FieldType::new("a", Type::INT),
                FieldType::new("rest", Type::variadic(Type::STRING)),
            ],
            vec![FieldType::new("", Type::BOOL)],
            true,
        );
        assert_eq!(f.to_string(), "func(int,...string)(bool)");
    }

    #[test]
    fn exported_structs_share_ids_across_packages() {
        let a = point("gno.land/p/a").type_id().unwrap();
        let b = point("gno.land/p/b").type_id().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unexported_fields_fold_package_path() {
        let mk = |pkg: &str| Type::strukt(pkg, vec![FieldType::new("x", Type::INT)]);
        assert_ne!(
            mk("gno.land/p/a").type_id().unwrap(),
            mk("gno.land/p/b").type_id().unwrap()
        );
    }

    #[test]
    fn declared_id_depends_on_name_and_base() {
        let a = Type::declared("pkg", "A", Type::INT);
        let b = Type::declared("pkg", "B", Type::INT);
        let a2 = Type::declared("pkg", "A", Type::STRING);
        let a3 = Type::declared("pkg", "A", Type::INT);
        assert_ne!(a.type_id().unwrap(), b.type_id().unwrap());
        assert_ne!(a.type_id().unwrap(), a2.type_id().unwrap());
        assert_eq!(a.type_id().unwrap(), a3.type_id().unwrap());
        assert_ne!(a.type_id().unwrap(), Type::INT.type_id().unwrap());
    }

    #[test]
    fn untyped_has_no_type_id() {
        assert!(matches!(
            Type::UNTYPED_BIGINT.type_id(),
            Err(MachineError::UntypedTypeId(_))
        ));
        assert!(Type::slice(Type::UNTYPED_RUNE).type_id().is_err());
        assert_eq!(Type::UNTYPED_BIGINT.default_type(), Type::INT);
        assert_eq!(Type::UNTYPED_RUNE.default_type(), Type::INT32);
    }

    #[test]
    fn promoted_field_paths() {
        let inner = Type::declared("pkg", "Inner", point("pkg"));
        let outer = Type::strukt(
            "pkg",
            vec![FieldType::new("Name", Type::STRING), FieldType::embedded(inner)],
        );
        let st = outer.as_struct().unwrap();
        assert_eq!(st.field_path("Name"), Some(&[0u16][..]));
        assert_eq!(st.field_path("Inner"), Some(&[1u16][..]));
        assert_eq!(st.field_path("Y"), Some(&[1u16, 1][..]));
        assert_eq!(st.field_path("Z"), None);
    }

    #[test]
    fn recursive_declared_type() {
        let node = Type::declared_forward("pkg", "Node");
        let base = Type::strukt(
            "pkg",
            vec![
                FieldType::new("Value", Type::INT),
                FieldType::new("Next", Type::pointer(node.clone())),
            ],
        );
        node.as_declared().unwrap().set_base(base).unwrap();
        assert_eq!(node.kind(), Kind::Struct);
        assert_eq!(
            node.base().to_string(),
            "struct{Value int;Next *pkg.Node}"
        );
        assert!(node.type_id().is_ok());
        assert!(node.as_declared().unwrap().set_base(Type::INT).is_err());
    }

    #[test]
    fn type_id_stable_across_reserialization() {
        let node = Type::declared_forward("pkg", "Node");
        let base = Type::strukt(
            "pkg",
            vec![
                FieldType::new("val", Type::BIGINT),
                FieldType::new("next", Type::pointer(node.clone())),
                FieldType::new("tags", Type::map(Type::STRING, Type::slice(Type::UINT8))),
            ],
        );
        node.as_declared().unwrap().set_base(base).unwrap();
        let wrapper = Type::map(Type::STRING, Type::pointer(node.clone()));

        let mut known: HashMap<TypeId, Type> = HashMap::new();
        known.insert(node.type_id().unwrap(), node.clone());

        for t in [node.clone(), wrapper] {
            let image = t.image();
            let decoded = Type::decode_image(&mut image.as_slice(), &mut known).unwrap();
            assert_eq!(decoded.type_id().unwrap(), t.type_id().unwrap());
            assert_eq!(decoded.image(), image);
        }
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut known: HashMap<TypeId, Type> = HashMap::new();
        assert_eq!(
            Type::decode_image(&mut &[99u8][..], &mut known).unwrap_err(),
            DecodeError::InvalidTag(99)
        );
    }

    #[test]
    fn interface_satisfaction_respects_receivers() {
        use crate::virtual_machine::values::FuncValue;

        let sig = Type::func(vec![], vec![FieldType::new("", Type::STRING)], false);
        let stringer = Type::interface("", vec![FieldType::new("String", sig.clone())]);
        let t = Type::declared("pkg", "T", Type::INT);
        let dt = t.as_declared().unwrap();
        dt.add_method(Method {
            name: Rc::from("String"),
            ptr_recv: true,
            typ: sig.clone(),
            func: Rc::new(FuncValue::stub("String", sig.clone(), "pkg")),
        });
        assert!(!stringer.is_implemented_by(&t));
        assert!(stringer.is_implemented_by(&Type::pointer(t.clone())));
        assert!(!stringer.is_implemented_by(&Type::INT));

        let wrong = Type::func(vec![], vec![FieldType::new("", Type::INT)], false);
        let other = Type::interface("", vec![FieldType::new("String", wrong)]);
        assert!(!other.is_implemented_by(&Type::pointer(t)));
    }
}
