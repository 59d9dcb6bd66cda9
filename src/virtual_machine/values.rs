//! Tagged runtime values and the object bodies that live in the heap arena.

use crate::types::encoding::Encode;
use crate::virtual_machine::ast::{Body, ExprRef, FuncSource, Location, StmtRef};
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::heap::Heap;
use crate::virtual_machine::machine::Machine;
use crate::virtual_machine::native::HostValue;
use crate::virtual_machine::realm::Realm;
use crate::virtual_machine::type_system::{Kind, Name, Type};
use gnovm_derive::BinaryCodec;
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Index of an object in the heap arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub u32);

/// A value paired with its type. Scalars live in `n` as little-endian bits.
///
/// `t == None` is undefined (untyped nil). An interface-typed value with
/// `Value::None` is a nil interface.
#[derive(Clone, Debug)]
pub struct TypedValue {
    pub t: Option<Type>,
    pub v: Value,
    pub n: [u8; 8],
}

#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    None,
    String(Rc<str>),
    Bigint(Rc<BigInt>),
    Pointer(PointerValue),
    Array(ObjRef),
    Slice(SliceValue),
    Struct(ObjRef),
    Map(ObjRef),
    Func(Rc<FuncValue>),
    BoundMethod(Rc<BoundMethodValue>),
    Type(Type),
    Package(Rc<PackageValue>),
    Native(Rc<RefCell<HostValue>>),
    Block(ObjRef),
}

/// Address of one slot inside an object: a block slot, array element,
/// struct field or heap item (index 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PointerValue {
    pub base: ObjRef,
    pub index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceValue {
    pub base: ObjRef,
    pub offset: usize,
    pub length: usize,
    pub maxcap: usize,
}

pub type NativeFn = Rc<dyn Fn(&mut Machine<'_>) -> Result<(), MachineError>>;

#[derive(Clone)]
pub enum FuncBody {
    Source(Rc<FuncSource>),
    /// Reads its arguments from the top block and pushes its results.
    Native(NativeFn),
}

pub struct FuncValue {
    pub typ: Type,
    pub name: Name,
    pub pkg_path: Name,
    pub body: FuncBody,
    /// Parent block of the function block.
    pub closure: Option<ObjRef>,
}

impl FuncValue {
    pub fn from_source(source: Rc<FuncSource>, closure: Option<ObjRef>) -> Self {
        FuncValue {
            typ: source.typ.clone(),
            name: source.name.clone(),
            pkg_path: source.loc.pkg_path.clone(),
            body: FuncBody::Source(source),
            closure,
        }
    }

    pub fn native(name: &str, typ: Type, pkg_path: &str, f: NativeFn) -> Self {
        FuncValue {
            typ,
            name: Rc::from(name),
            pkg_path: Rc::from(pkg_path),
            body: FuncBody::Native(f),
            closure: None,
        }
    }

    /// A native function that does nothing.
    pub fn stub(name: &str, typ: Type, pkg_path: &str) -> Self {
        Self::native(name, typ, pkg_path, Rc::new(|_| Ok(())))
    }

    pub fn source(&self) -> Option<&Rc<FuncSource>> {
        match &self.body {
            FuncBody::Source(s) => Some(s),
            FuncBody::Native(_) => None,
        }
    }

    pub fn location(&self) -> Option<&Location> {
        self.source().map(|s| &s.loc)
    }
}

impl fmt::Debug for FuncValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FuncValue({}.{})", self.pkg_path, self.name)
    }
}

#[derive(Debug)]
pub struct BoundMethodValue {
    pub func: Rc<FuncValue>,
    pub receiver: TypedValue,
}

pub struct PackageValue {
    pub name: Name,
    pub path: Name,
    pub block: ObjRef,
    pub realm: Option<Rc<RefCell<Realm>>>,
}

impl fmt::Debug for PackageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackageValue({})", self.path)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ArrayValue {
    pub list: Vec<TypedValue>,
}

#[derive(Clone, Debug, Default)]
pub struct StructValue {
    pub fields: Vec<TypedValue>,
}

/// Canonical bytes of a comparable key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MapKey(pub Vec<u8>);

#[derive(Clone, Debug)]
pub struct MapItem {
    pub key: TypedValue,
    pub value: TypedValue,
    prev: Option<usize>,
    next: Option<usize>,
    live: bool,
}

/// Insertion-ordered map: a hash index over a doubly linked list.
///
/// Deleted items stay in place as tombstones that keep their `next` link,
/// so an iterator parked on a deleted item can still advance.
#[derive(Clone, Debug, Default)]
pub struct MapValue {
    items: Vec<MapItem>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<MapKey, usize>,
    len: usize,
}

impl MapValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lookup(&self, key: &MapKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn get(&self, key: &MapKey) -> Option<&TypedValue> {
        self.lookup(key).map(|i| &self.items[i].value)
    }

    pub fn item(&self, i: usize) -> &MapItem {
        &self.items[i]
    }

    pub fn value_mut(&mut self, i: usize) -> &mut TypedValue {
        &mut self.items[i].value
    }

    /// Inserts or overwrites. Returns the previous value.
    pub fn set(&mut self, mk: MapKey, key: TypedValue, value: TypedValue) -> Option<TypedValue> {
        if let Some(&i) = self.index.get(&mk) {
            return Some(std::mem::replace(&mut self.items[i].value, value));
        }
        let i = self.items.len();
        self.items.push(MapItem {
            key,
            value,
            prev: self.tail,
            next: None,
            live: true,
        });
        match self.tail {
            Some(t) => self.items[t].next = Some(i),
            None => self.head = Some(i),
        }
        self.tail = Some(i);
        self.index.insert(mk, i);
        self.len += 1;
        None
    }

    /// Unlinks `mk`, returning its key and value.
    pub fn delete(&mut self, mk: &MapKey) -> Option<(TypedValue, TypedValue)> {
        let i = self.index.remove(mk)?;
        let (prev, next) = (self.items[i].prev, self.items[i].next);
        match prev {
            Some(p) => self.items[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.items[n].prev = prev,
            None => self.tail = prev,
        }
        self.items[i].live = false;
        self.len -= 1;
        let item = &mut self.items[i];
        Some((
            std::mem::replace(&mut item.key, TypedValue::undefined()),
            std::mem::replace(&mut item.value, TypedValue::undefined()),
        ))
    }

    pub fn first(&self) -> Option<usize> {
        self.head
    }

    /// Next live item after `i`, which may itself be a tombstone.
    pub fn next_of(&self, i: usize) -> Option<usize> {
        let mut cursor = self.items[i].next;
        while let Some(j) = cursor {
            if self.items[j].live {
                return Some(j);
            }
            cursor = self.items[j].next;
        }
        None
    }

    pub fn is_live(&self, i: usize) -> bool {
        self.items[i].live
    }

    /// Live items in insertion order.
    pub fn iter(&self) -> MapIter<'_> {
        MapIter {
            map: self,
            cursor: self.head,
        }
    }
}

pub struct MapIter<'a> {
    map: &'a MapValue,
    cursor: Option<usize>,
}

impl<'a> Iterator for MapIter<'a> {
    type Item = (&'a TypedValue, &'a TypedValue);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.cursor?;
        let item = &self.map.items[i];
        self.cursor = item.next;
        Some((&item.key, &item.value))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub enum BlockSource {
    Universe,
    Package(Name),
    Func(Location),
    Local,
}

/// Loop and body bookkeeping that must survive between operations.
#[derive(Clone, Debug)]
pub struct BodyState {
    pub body: Option<Body>,
    /// Statement to run next. -2 before initialization, -1 while the loop
    /// condition is pending.
    pub next_index: isize,
    pub num_ops: usize,
    pub num_values: usize,
    pub cond: Option<ExprRef>,
    pub post: Option<StmtRef>,
    pub key: Option<ExprRef>,
    pub value: Option<ExprRef>,
    pub define: bool,
    pub list_len: usize,
    pub list_index: usize,
    pub next_item: Option<usize>,
    pub str_index: usize,
}

impl Default for BodyState {
    fn default() -> Self {
        BodyState {
            body: None,
            next_index: -2,
            num_ops: 0,
            num_values: 0,
            cond: None,
            post: None,
            key: None,
            value: None,
            define: false,
            list_len: 0,
            list_index: 0,
            next_item: None,
            str_index: 0,
        }
    }
}

impl BodyState {
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, |b| b.len())
    }
}

/// A lexical scope. Persistable when captured by a closure.
#[derive(Clone, Debug)]
pub struct Block {
    pub source: BlockSource,
    pub values: Vec<TypedValue>,
    /// Declared interface types by slot. Other slots take the type of the
    /// value they hold.
    pub statics: Vec<Option<Type>>,
    pub parent: Option<ObjRef>,
    pub body: BodyState,
}

impl Block {
    pub fn new(source: BlockSource, num_names: usize, parent: Option<ObjRef>) -> Self {
        Block {
            source,
            values: vec![TypedValue::undefined(); num_names],
            statics: Vec::new(),
            parent,
            body: BodyState::default(),
        }
    }

    pub fn static_type(&self, index: usize) -> Option<&Type> {
        self.statics.get(index)?.as_ref()
    }

    /// Remembers that slot `index` was declared with type `t`. Only
    /// interface types are kept; a concrete slot's value carries its type.
    pub fn declare_static(&mut self, index: usize, t: &Type) {
        if !t.is_interface() {
            return;
        }
        if self.statics.len() <= index {
            self.statics.resize(index + 1, None);
        }
        self.statics[index] = Some(t.clone());
    }

    pub fn is_package(&self) -> bool {
        matches!(self.source, BlockSource::Package(_) | BlockSource::Universe)
    }
}

#[derive(Clone, Debug)]
pub enum Object {
    Array(ArrayValue),
    Struct(StructValue),
    Map(MapValue),
    Block(Block),
    /// Target of `new(T)` and `&T{}`.
    HeapItem(TypedValue),
}

impl Object {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::Array(_) => "array",
            Object::Struct(_) => "struct",
            Object::Map(_) => "map",
            Object::Block(_) => "block",
            Object::HeapItem(_) => "heap item",
        }
    }

    /// Slot addressed by a pointer into this object.
    pub fn slot(&self, index: usize) -> Option<&TypedValue> {
        match self {
            Object::Array(a) => a.list.get(index),
            Object::Struct(s) => s.fields.get(index),
            Object::Block(b) => b.values.get(index),
            Object::HeapItem(tv) if index == 0 => Some(tv),
            _ => None,
        }
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut TypedValue> {
        match self {
            Object::Array(a) => a.list.get_mut(index),
            Object::Struct(s) => s.fields.get_mut(index),
            Object::Block(b) => b.values.get_mut(index),
            Object::HeapItem(tv) if index == 0 => Some(tv),
            _ => None,
        }
    }
}

fn truncate(raw: u64, bits: u32) -> u64 {
    if bits >= 64 {
        raw
    } else {
        raw & ((1u64 << bits) - 1)
    }
}

impl TypedValue {
    pub fn undefined() -> Self {
        TypedValue {
            t: None,
            v: Value::None,
            n: [0; 8],
        }
    }

    /// Typed nil of a nilable type.
    pub fn nil(t: Type) -> Self {
        TypedValue {
            t: Some(t),
            v: Value::None,
            n: [0; 8],
        }
    }

    pub fn with_value(t: Type, v: Value) -> Self {
        TypedValue {
            t: Some(t),
            v,
            n: [0; 8],
        }
    }

    pub fn from_bool(t: Type, b: bool) -> Self {
        let mut tv = TypedValue::nil(t);
        tv.n[0] = b as u8;
        tv
    }

    pub fn from_int(t: Type, v: i64) -> Self {
        let mut tv = TypedValue::nil(t);
        tv.set_int(v);
        tv
    }

    pub fn from_uint(t: Type, v: u64) -> Self {
        let mut tv = TypedValue::nil(t);
        tv.set_uint(v);
        tv
    }

    pub fn from_string(t: Type, s: &str) -> Self {
        TypedValue::with_value(t, Value::String(Rc::from(s)))
    }

    pub fn from_bigint(t: Type, v: BigInt) -> Self {
        TypedValue::with_value(t, Value::Bigint(Rc::new(v)))
    }

    pub fn untyped_bigint(v: BigInt) -> Self {
        TypedValue::from_bigint(Type::UNTYPED_BIGINT, v)
    }

    pub fn untyped_string(s: &str) -> Self {
        TypedValue::from_string(Type::UNTYPED_STRING, s)
    }

    pub fn int(v: i64) -> Self {
        TypedValue::from_int(Type::INT, v)
    }

    pub fn string(s: &str) -> Self {
        TypedValue::from_string(Type::STRING, s)
    }

    pub fn boolean(b: bool) -> Self {
        TypedValue::from_bool(Type::BOOL, b)
    }

    pub fn type_value(t: Type) -> Self {
        TypedValue::with_value(Type::TypeType, Value::Type(t))
    }

    pub fn is_undefined(&self) -> bool {
        self.t.is_none()
    }

    /// Undefined, or a nilable type holding nothing.
    pub fn is_nil(&self) -> bool {
        match &self.t {
            None => true,
            Some(t) => {
                matches!(self.v, Value::None)
                    && matches!(
                        t.kind(),
                        Kind::Pointer
                            | Kind::Slice
                            | Kind::Map
                            | Kind::Func
                            | Kind::Interface
                            | Kind::Chan
                    )
            }
        }
    }

    pub fn kind(&self) -> Kind {
        self.t.as_ref().map_or(Kind::Invalid, |t| t.kind())
    }

    pub fn typ(&self) -> Result<&Type, MachineError> {
        self.t
            .as_ref()
            .ok_or_else(|| MachineError::unexpected("typed value", "undefined"))
    }

    pub fn as_type(&self) -> Option<&Type> {
        match &self.v {
            Value::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_untyped(&self) -> bool {
        self.t.as_ref().is_some_and(|t| t.is_untyped())
    }

    fn raw(&self) -> u64 {
        u64::from_le_bytes(self.n)
    }

    pub fn get_bool(&self) -> bool {
        self.n[0] != 0
    }

    pub fn set_bool(&mut self, b: bool) {
        self.n = [0; 8];
        self.n[0] = b as u8;
    }

    /// Sign-extended value for signed kinds, zero-extended otherwise.
    pub fn get_int(&self) -> i64 {
        let raw = self.raw();
        match self.kind() {
            Kind::Int8 => raw as u8 as i8 as i64,
            Kind::Int16 => raw as u16 as i16 as i64,
            Kind::Int32 => raw as u32 as i32 as i64,
            _ => raw as i64,
        }
    }

    pub fn get_uint(&self) -> u64 {
        let kind = self.kind();
        if kind.is_signed_int() {
            self.get_int() as u64
        } else {
            truncate(self.raw(), kind.bits())
        }
    }

    /// Stores `v` wrapped to the width of the value's kind.
    pub fn set_int(&mut self, v: i64) {
        self.set_uint(v as u64);
    }

    pub fn set_uint(&mut self, v: u64) {
        let bits = self.kind().bits();
        self.n = truncate(v, bits).to_le_bytes();
    }

    pub fn get_string(&self) -> &str {
        match &self.v {
            Value::String(s) => s,
            _ => "",
        }
    }

    pub fn get_bigint(&self) -> BigInt {
        match &self.v {
            Value::Bigint(b) => (**b).clone(),
            _ => BigInt::zero(),
        }
    }

    /// Integer value as a bignum regardless of representation.
    pub fn to_bigint(&self) -> BigInt {
        let kind = self.kind();
        if kind == Kind::Bigint {
            self.get_bigint()
        } else if kind.is_signed_int() {
            BigInt::from(self.get_int())
        } else {
            BigInt::from(self.get_uint())
        }
    }

    /// Index or length operand as `usize`; negative values are rejected.
    pub fn to_index(&self) -> Option<usize> {
        let kind = self.kind();
        if kind == Kind::Bigint {
            self.get_bigint().to_usize()
        } else if kind.is_signed_int() {
            usize::try_from(self.get_int()).ok()
        } else if kind.is_unsigned_int() {
            usize::try_from(self.get_uint()).ok()
        } else {
            None
        }
    }

    pub fn get_pointer(&self) -> Option<PointerValue> {
        match &self.v {
            Value::Pointer(p) => Some(*p),
            _ => None,
        }
    }

    pub fn get_func(&self) -> Option<&Rc<FuncValue>> {
        match &self.v {
            Value::Func(f) => Some(f),
            _ => None,
        }
    }

    /// Object referenced by this value that ownership tracking follows.
    /// Closures over a package block do not reference it as a child.
    pub fn first_object(&self, heap: &Heap) -> Option<ObjRef> {
        match &self.v {
            Value::Array(r) | Value::Struct(r) | Value::Map(r) => Some(*r),
            Value::Slice(s) => Some(s.base),
            Value::Pointer(p) => Some(p.base),
            Value::Func(f) => f.closure.filter(|b| !heap.is_package_block(*b)),
            Value::BoundMethod(bm) => bm.receiver.first_object(heap),
            Value::Block(r) => Some(*r),
            _ => None,
        }
    }

    /// Canonical key bytes: type id followed by a payload that is equal
    /// exactly when the two values compare equal.
    pub fn map_key(&self, heap: &Heap) -> Result<MapKey, MachineError> {
        let mut out = Vec::new();
        self.write_key(&mut out, heap)?;
        Ok(MapKey(out))
    }

    fn write_key(&self, out: &mut Vec<u8>, heap: &Heap) -> Result<(), MachineError> {
        let Some(t) = &self.t else {
            out.push(0);
            return Ok(());
        };
        out.push(1);
        out.extend_from_slice(t.type_id()?.0.as_slice());
        match t.kind() {
            Kind::Bool => out.push(self.get_bool() as u8),
            k if k.is_integer() => out.extend_from_slice(&self.get_uint().to_le_bytes()),
            Kind::String => self.get_string().encode(out),
            Kind::Bigint => self.get_bigint().encode(out),
            Kind::Array => {
                if let Value::Array(r) = &self.v {
                    for elem in heap.array_list(*r) {
                        elem.write_key(out, heap)?;
                    }
                }
            }
            Kind::Struct => {
                if let Value::Struct(r) = &self.v {
                    for field in heap.struct_fields(*r) {
                        field.write_key(out, heap)?;
                    }
                }
            }
            Kind::Pointer => match &self.v {
                Value::Pointer(p) => {
                    out.push(1);
                    out.extend_from_slice(&p.base.0.to_le_bytes());
                    out.extend_from_slice(&(p.index as u64).to_le_bytes());
                }
                _ => out.push(0),
            },
            // only a nil interface reaches here; dynamic values carry their
            // concrete type
            Kind::Interface => out.push(0),
            Kind::Type => match self.as_type() {
                Some(inner) => out.extend_from_slice(inner.type_id()?.0.as_slice()),
                None => out.push(0),
            },
            kind => return Err(MachineError::UncomparableKind(kind)),
        }
        Ok(())
    }

    /// Human-readable rendering used by `print` and panic messages.
    pub fn sprint(&self, heap: &Heap) -> String {
        let mut out = String::new();
        self.write_to(&mut out, heap, 0);
        out
    }

    fn write_to(&self, out: &mut String, heap: &Heap, depth: usize) {
        use std::fmt::Write;
        if depth > 8 {
            out.push_str("...");
            return;
        }
        let Some(t) = &self.t else {
            out.push_str("nil");
            return;
        };
        let kind = t.kind();
        match (&self.v, kind) {
            (_, Kind::Bool) => out.push_str(if self.get_bool() { "true" } else { "false" }),
            (_, k) if k.is_signed_int() => {
                let _ = write!(out, "{}", self.get_int());
            }
            (_, k) if k.is_unsigned_int() => {
                let _ = write!(out, "{}", self.get_uint());
            }
            (Value::String(s), _) => out.push_str(s),
            (Value::Bigint(b), _) => {
                let _ = write!(out, "{}", b);
            }
            (Value::None, _) => out.push_str("nil"),
            (Value::Array(r), _) => write_list(out, heap, heap.array_list(*r), depth),
            (Value::Slice(s), _) => {
                let list = heap.array_list(s.base);
                let end = (s.offset + s.length).min(list.len());
                write_list(out, heap, &list[s.offset.min(end)..end], depth)
            }
            (Value::Struct(r), _) => {
                out.push('{');
                for (i, f) in heap.struct_fields(*r).iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    f.write_to(out, heap, depth + 1);
                }
                out.push('}');
            }
            (Value::Map(r), _) => {
                out.push_str("map[");
                if let Some(m) = heap.map(*r) {
                    for (i, (k, v)) in m.iter().enumerate() {
                        if i > 0 {
                            out.push(' ');
                        }
                        k.write_to(out, heap, depth + 1);
                        out.push(':');
                        v.write_to(out, heap, depth + 1);
                    }
                }
                out.push(']');
            }
            (Value::Pointer(p), _) => {
                out.push('&');
                match heap.get(p.base).slot(p.index) {
                    Some(target) => target.write_to(out, heap, depth + 1),
                    None => out.push('?'),
                }
            }
            (Value::Func(f), _) => {
                let _ = write!(out, "{}", f.name);
            }
            (Value::BoundMethod(bm), _) => {
                let _ = write!(out, "{}", bm.func.name);
            }
            (Value::Type(t), _) => {
                let _ = write!(out, "{}", t);
            }
            (Value::Package(p), _) => {
                let _ = write!(out, "package({})", p.path);
            }
            (Value::Native(h), _) => {
                let _ = write!(out, "{:?}", h.borrow());
            }
            (Value::Block(_), _) => out.push_str("block"),
        }
    }
}

fn write_list(out: &mut String, heap: &Heap, list: &[TypedValue], depth: usize) {
    out.push('[');
    for (i, tv) in list.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        tv.write_to(out, heap, depth + 1);
    }
    out.push(']');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> (MapKey, TypedValue) {
        (MapKey(s.as_bytes().to_vec()), TypedValue::string(s))
    }

    #[test]
    fn int_kinds_wrap_to_width() {
        let tv = TypedValue::from_int(Type::Primitive(crate::virtual_machine::type_system::PrimitiveType::Int8), 200);
        assert_eq!(tv.get_int(), -56);
        let mut u = TypedValue::from_uint(Type::UINT8, 255);
        assert_eq!(u.get_uint(), 255);
        u.set_uint(256);
        assert_eq!(u.get_uint(), 0);
        let neg = TypedValue::int(-1);
        assert_eq!(neg.get_int(), -1);
        assert_eq!(neg.to_index(), None);
        assert_eq!(TypedValue::int(7).to_index(), Some(7));
    }

    #[test]
    fn blocks_keep_only_interface_declarations() {
        let mut b = Block::new(BlockSource::Local, 3, None);
        b.declare_static(0, &Type::INT);
        b.declare_static(2, &Type::interface("", vec![]));
        assert!(b.static_type(0).is_none());
        assert!(b.static_type(1).is_none());
        assert_eq!(b.static_type(2).map(|t| t.kind()), Some(Kind::Interface));
        assert_eq!(b.statics.len(), 3);
    }

    #[test]
    fn nil_and_undefined_are_distinct() {
        let undefined = TypedValue::undefined();
        assert!(undefined.is_undefined());
        assert!(undefined.is_nil());
        let iface = Type::interface("", vec![]);
        let nil_iface = TypedValue::nil(iface);
        assert!(!nil_iface.is_undefined());
        assert!(nil_iface.is_nil());
        assert_eq!(nil_iface.kind(), Kind::Interface);
        assert!(!TypedValue::int(0).is_nil());
    }

    #[test]
    fn map_iterates_in_insertion_order() {
        let mut m = MapValue::new();
        for s in ["b", "a", "c"] {
            let (mk, k) = key(s);
            m.set(mk, k, TypedValue::int(1));
        }
        let order: Vec<_> = m.iter().map(|(k, _)| k.get_string().to_string()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);

        // overwriting keeps position
        let (mk, k) = key("b");
        assert!(m.set(mk, k, TypedValue::int(2)).is_some());
        assert_eq!(m.iter().next().unwrap().1.get_int(), 2);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn map_delete_keeps_cursor_valid() {
        let mut m = MapValue::new();
        for s in ["x", "y", "z"] {
            let (mk, k) = key(s);
            m.set(mk, k, TypedValue::int(0));
        }
        let first = m.first().unwrap();
        let (mk, _) = key("x");
        assert!(m.delete(&mk).is_some());
        assert!(!m.is_live(first));
        let next = m.next_of(first).unwrap();
        assert_eq!(m.item(next).key.get_string(), "y");
        let (mk, _) = key("y");
        m.delete(&mk);
        assert_eq!(m.item(m.next_of(first).unwrap()).key.get_string(), "z");
        assert_eq!(m.len(), 1);
        assert!(m.delete(&MapKey(b"missing".to_vec())).is_none());
        let (mk, k) = key("x");
        m.set(mk, k, TypedValue::int(5));
        let order: Vec<_> = m.iter().map(|(k, _)| k.get_string().to_string()).collect();
        assert_eq!(order, vec!["z", "x"]);
    }

    #[test]
    fn object_slots() {
        let mut obj = Object::Struct(StructValue {
            fields: vec![TypedValue::int(1), TypedValue::int(2)],
        });
        *obj.slot_mut(1).unwrap() = TypedValue::int(9);
        assert_eq!(obj.slot(1).unwrap().get_int(), 9);
        assert!(obj.slot(2).is_none());
        let item = Object::HeapItem(TypedValue::int(3));
        assert!(item.slot(0).is_some());
        assert!(item.slot(1).is_none());
    }
}
