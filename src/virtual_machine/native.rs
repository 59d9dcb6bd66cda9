//! Bridge between interpreted values and host functions.
//!
//! Host functions see arguments as [`HostValue`]s, a tree-shaped copy of the
//! interpreted value. Mutations made by the host through pointers, slices and
//! maps are written back into the heap after the call, and every slot that
//! changed is reported so the Machine can keep ownership in sync.

use crate::virtual_machine::alloc::Allocator;
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::heap::Heap;
use crate::virtual_machine::machine::{Fault, Machine};
use crate::virtual_machine::type_system::{Kind, Name, Type};
use crate::virtual_machine::values::{
    ArrayValue, FuncValue, MapKey, MapValue, ObjRef, Object, PointerValue, SliceValue,
    StructValue, TypedValue, Value,
};
use num_bigint::BigInt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Host-side view of an interpreted value.
#[derive(Clone, Debug)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Bigint(BigInt),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<HostValue>),
    /// Entries in iteration order.
    Map(Vec<(HostValue, HostValue)>),
    /// Fields in declaration order.
    Struct(Vec<(Name, HostValue)>),
    /// Shared so the host can mutate the pointee in place.
    Pointer(Rc<RefCell<HostValue>>),
    /// Opaque handle to an interpreted function; only passed back.
    Func(TypedValue),
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Nil, HostValue::Nil) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Int(a), HostValue::Int(b)) => a == b,
            (HostValue::Uint(a), HostValue::Uint(b)) => a == b,
            (HostValue::Bigint(a), HostValue::Bigint(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Bytes(a), HostValue::Bytes(b)) => a == b,
            (HostValue::List(a), HostValue::List(b)) => a == b,
            (HostValue::Map(a), HostValue::Map(b)) => a == b,
            (HostValue::Struct(a), HostValue::Struct(b)) => a == b,
            (HostValue::Pointer(a), HostValue::Pointer(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (HostValue::Func(a), HostValue::Func(b)) => match (a.get_func(), b.get_func()) {
                (Some(fa), Some(fb)) => Rc::ptr_eq(fa, fb),
                _ => false,
            },
            _ => false,
        }
    }
}

/// Raised by a host function; becomes a language-level panic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPanic(pub String);

impl fmt::Display for HostPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A slot overwritten by [`write_back`]: `owner` now references `new`
/// where it used to reference `old`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotWrite {
    pub owner: ObjRef,
    pub old: Option<ObjRef>,
    pub new: Option<ObjRef>,
}

pub type HostFn = Rc<dyn Fn(&mut [HostValue]) -> Result<Vec<HostValue>, HostPanic>>;

fn unsupported(t: &Type) -> MachineError {
    MachineError::UnsupportedKind(format!("{} cannot cross the native boundary", t))
}

fn is_bytes(t: &Type) -> bool {
    t.elem().is_some_and(|e| e.kind() == Kind::Uint8) && matches!(t.kind(), Kind::Slice | Kind::Array)
}

/// Copies an interpreted value out to the host. Values that reach
/// themselves through pointers, slices or maps have no tree form and are
/// rejected.
pub fn to_host(heap: &Heap, tv: &TypedValue) -> Result<HostValue, MachineError> {
    to_host_path(heap, tv, &mut Vec::new())
}

/// Pushes `r` onto the path of objects being copied.
fn enter(path: &mut Vec<ObjRef>, r: ObjRef, t: &Type) -> Result<(), MachineError> {
    if path.contains(&r) {
        return Err(MachineError::UnsupportedKind(format!(
            "cyclic {} cannot cross the native boundary",
            t
        )));
    }
    path.push(r);
    Ok(())
}

fn to_host_path(
    heap: &Heap,
    tv: &TypedValue,
    path: &mut Vec<ObjRef>,
) -> Result<HostValue, MachineError> {
    let Some(t) = &tv.t else {
        return Ok(HostValue::Nil);
    };
    let kind = t.kind();
    let depth = path.len();
    let host = match (&tv.v, kind) {
        (Value::Native(h), _) => h.borrow().clone(),
        (_, Kind::Bool) => HostValue::Bool(tv.get_bool()),
        (_, k) if k.is_signed_int() => HostValue::Int(tv.get_int()),
        (_, k) if k.is_unsigned_int() => HostValue::Uint(tv.get_uint()),
        (_, Kind::Bigint) => HostValue::Bigint(tv.get_bigint()),
        (_, Kind::String) => HostValue::String(tv.get_string().to_string()),
        (Value::None, Kind::Pointer | Kind::Slice | Kind::Map | Kind::Func | Kind::Interface) => {
            HostValue::Nil
        }
        (Value::Array(r), _) => {
            enter(path, *r, t)?;
            list_to_host(heap, t, heap.array_list(*r), path)?
        }
        (Value::Slice(s), _) => {
            enter(path, s.base, t)?;
            let list = heap.array_list(s.base);
            let end = (s.offset + s.length).min(list.len());
            list_to_host(heap, t, &list[s.offset.min(end)..end], path)?
        }
        (Value::Struct(r), _) => {
            let st = t.as_struct().ok_or_else(|| unsupported(t))?;
            enter(path, *r, t)?;
            let mut fields = Vec::with_capacity(st.fields.len());
            for (ft, fv) in st.fields.iter().zip(heap.struct_fields(*r)) {
                fields.push((ft.name.clone(), to_host_path(heap, fv, path)?));
            }
            HostValue::Struct(fields)
        }
        (Value::Map(r), _) => {
            enter(path, *r, t)?;
            let mut items = Vec::new();
            if let Some(m) = heap.map(*r) {
                for (k, v) in m.iter() {
                    items.push((to_host_path(heap, k, path)?, to_host_path(heap, v, path)?));
                }
            }
            HostValue::Map(items)
        }
        (Value::Pointer(p), _) => {
            let target = heap
                .get(p.base)
                .slot(p.index)
                .ok_or_else(|| MachineError::malformed("dangling pointer"))?;
            enter(path, p.base, t)?;
            HostValue::Pointer(Rc::new(RefCell::new(to_host_path(heap, target, path)?)))
        }
        (Value::Func(_) | Value::BoundMethod(_), _) => return Ok(HostValue::Func(tv.clone())),
        _ => return Err(unsupported(t)),
    };
    path.truncate(depth);
    Ok(host)
}

fn list_to_host(
    heap: &Heap,
    t: &Type,
    list: &[TypedValue],
    path: &mut Vec<ObjRef>,
) -> Result<HostValue, MachineError> {
    if is_bytes(t) {
        return Ok(HostValue::Bytes(list.iter().map(|b| b.get_uint() as u8).collect()));
    }
    Ok(HostValue::List(
        list.iter()
            .map(|tv| to_host_path(heap, tv, path))
            .collect::<Result<_, _>>()?,
    ))
}

/// Builds an interpreted value of type `t` from a host value.
pub fn from_host(
    heap: &mut Heap,
    alloc: &mut Allocator,
    host: &HostValue,
    t: &Type,
) -> Result<TypedValue, MachineError> {
    let kind = t.kind();
    let mismatch = || MachineError::TypeMismatch(format!("host value {:?} as {}", host, t));
    Ok(match (host, kind) {
        (_, Kind::Native) => {
            alloc.allocate_native(1)?;
            TypedValue::with_value(t.clone(), Value::Native(Rc::new(RefCell::new(host.clone()))))
        }
        (HostValue::Nil, Kind::Pointer | Kind::Slice | Kind::Map | Kind::Func | Kind::Interface) => {
            TypedValue::nil(t.clone())
        }
        (HostValue::Bool(b), Kind::Bool) => TypedValue::from_bool(t.clone(), *b),
        (HostValue::Int(i), k) if k.is_integer() => TypedValue::from_int(t.clone(), *i),
        (HostValue::Uint(u), k) if k.is_integer() => TypedValue::from_uint(t.clone(), *u),
        (HostValue::Int(i), Kind::Bigint) => TypedValue::from_bigint(t.clone(), BigInt::from(*i)),
        (HostValue::Uint(u), Kind::Bigint) => TypedValue::from_bigint(t.clone(), BigInt::from(*u)),
        (HostValue::Bigint(b), Kind::Bigint) => {
            alloc.allocate_bigint(b.bits())?;
            TypedValue::from_bigint(t.clone(), b.clone())
        }
        (HostValue::String(s), Kind::String) => {
            alloc.allocate_string(s.len())?;
            TypedValue::from_string(t.clone(), s)
        }
        (HostValue::Bytes(bytes), Kind::Slice | Kind::Array) => {
            let items: Vec<HostValue> = bytes.iter().map(|b| HostValue::Uint(*b as u64)).collect();
            list_from_host(heap, alloc, &items, t)?
        }
        (HostValue::List(items), Kind::Slice | Kind::Array) => list_from_host(heap, alloc, items, t)?,
        (HostValue::Map(items), Kind::Map) => {
            let Type::Map(mt) = t.base() else {
                return Err(mismatch());
            };
            alloc.allocate_map(items.len())?;
            let mut map = MapValue::new();
            for (k, v) in items {
                let key = from_host(heap, alloc, k, &mt.key)?;
                let value = from_host(heap, alloc, v, &mt.value)?;
                let mk = key.map_key(heap)?;
                map.set(mk, key, value);
            }
            let r = heap.alloc(Object::Map(map));
            TypedValue::with_value(t.clone(), Value::Map(r))
        }
        (HostValue::Struct(fields), Kind::Struct) => {
            let st = t.as_struct().ok_or_else(mismatch)?;
            if fields.len() != st.fields.len() {
                return Err(mismatch());
            }
            alloc.allocate_struct(fields.len())?;
            let mut values = Vec::with_capacity(fields.len());
            for ((_, fv), ft) in fields.iter().zip(st.fields.iter()) {
                values.push(from_host(heap, alloc, fv, &ft.typ)?);
            }
            let r = heap.alloc(Object::Struct(StructValue { fields: values }));
            TypedValue::with_value(t.clone(), Value::Struct(r))
        }
        (HostValue::Pointer(cell), Kind::Pointer) => {
            let elem = t.elem().ok_or_else(mismatch)?;
            let inner = from_host(heap, alloc, &cell.borrow(), &elem)?;
            alloc.allocate_heap_item()?;
            let item = heap.alloc(Object::HeapItem(inner));
            TypedValue::with_value(t.clone(), Value::Pointer(PointerValue { base: item, index: 0 }))
        }
        (HostValue::Func(tv), Kind::Func) => tv.clone(),
        (_, Kind::Interface) => {
            let dynamic = match host {
                HostValue::Bool(_) => Type::BOOL,
                HostValue::Int(_) => Type::INT,
                HostValue::Uint(_) => Type::UINT64,
                HostValue::Bigint(_) => Type::BIGINT,
                HostValue::String(_) => Type::STRING,
                HostValue::Bytes(_) => Type::slice(Type::UINT8),
                HostValue::Func(tv) => return Ok(tv.clone()),
                _ => return Err(mismatch()),
            };
            from_host(heap, alloc, host, &dynamic)?
        }
        (_, Kind::Type | Kind::Package | Kind::Chan | Kind::Tuple | Kind::Block) => {
            return Err(unsupported(t));
        }
        _ => return Err(mismatch()),
    })
}

fn list_from_host(
    heap: &mut Heap,
    alloc: &mut Allocator,
    items: &[HostValue],
    t: &Type,
) -> Result<TypedValue, MachineError> {
    let elem = t
        .elem()
        .ok_or_else(|| MachineError::TypeMismatch(format!("list as {}", t)))?;
    let len = match t.base() {
        Type::Array(at) => at.len,
        _ => items.len(),
    };
    alloc.allocate_array(len)?;
    let mut list = Vec::with_capacity(len);
    for i in 0..len {
        list.push(match items.get(i) {
            Some(item) => from_host(heap, alloc, item, &elem)?,
            None => heap.zero_value(alloc, &elem)?,
        });
    }
    let r = heap.alloc(Object::Array(ArrayValue { list }));
    if t.kind() == Kind::Array {
        return Ok(TypedValue::with_value(t.clone(), Value::Array(r)));
    }
    alloc.allocate_slice()?;
    let sv = SliceValue {
        base: r,
        offset: 0,
        length: len,
        maxcap: len,
    };
    Ok(TypedValue::with_value(t.clone(), Value::Slice(sv)))
}

/// One pending heap mutation computed from a host value.
#[derive(Clone, Debug)]
enum Edit {
    Slot {
        base: ObjRef,
        index: usize,
        value: TypedValue,
    },
    MapSet {
        map: ObjRef,
        mk: MapKey,
        key: TypedValue,
        value: TypedValue,
    },
    MapDelete {
        map: ObjRef,
        mk: MapKey,
    },
}

impl Edit {
    fn owner(&self) -> ObjRef {
        match self {
            Edit::Slot { base, .. } => *base,
            Edit::MapSet { map, .. } | Edit::MapDelete { map, .. } => *map,
        }
    }
}

/// Heap mutations planned from host values but not yet applied, so every
/// owner can be vetted before any object changes.
#[derive(Debug, Default)]
pub struct WriteBack {
    edits: Vec<Edit>,
}

impl WriteBack {
    /// Objects the edits would modify, in edit order.
    pub fn owners(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.edits.iter().map(Edit::owner)
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn extend(&mut self, other: WriteBack) {
        self.edits.extend(other.edits);
    }

    /// Applies the edits and reports every reference that changed.
    pub fn apply(self, heap: &mut Heap) -> Vec<SlotWrite> {
        let mut writes = Vec::with_capacity(self.edits.len());
        for edit in self.edits {
            match edit {
                Edit::Slot { base, index, value } => {
                    let new = value.first_object(heap);
                    let Some(slot) = heap.get_mut(base).slot_mut(index) else {
                        continue;
                    };
                    let previous = std::mem::replace(slot, value);
                    let old = previous.first_object(heap);
                    writes.push(SlotWrite { owner: base, old, new });
                }
                Edit::MapSet { map, mk, key, value } => {
                    let new_key = key.first_object(heap);
                    let new = value.first_object(heap);
                    let Some(m) = heap.map_mut(map) else {
                        continue;
                    };
                    let inserted = m.lookup(&mk).is_none();
                    let previous = m.set(mk, key, value);
                    let old = previous.and_then(|o| o.first_object(heap));
                    writes.push(SlotWrite { owner: map, old, new });
                    if inserted && new_key.is_some() {
                        writes.push(SlotWrite {
                            owner: map,
                            old: None,
                            new: new_key,
                        });
                    }
                }
                Edit::MapDelete { map, mk } => {
                    let removed = heap.map_mut(map).and_then(|m| m.delete(&mk));
                    if let Some((k, v)) = removed {
                        for old in [k.first_object(heap), v.first_object(heap)] {
                            if old.is_some() {
                                writes.push(SlotWrite { owner: map, old, new: None });
                            }
                        }
                    }
                }
            }
        }
        writes
    }
}

/// Plans the write-back of host mutations of `host` into the heap value
/// `tv` it was copied from. Values passed by value (arrays, structs,
/// scalars) are left alone; pointees, slice elements and map entries are
/// updated in place once the plan is applied.
pub fn plan_write_back(
    heap: &mut Heap,
    alloc: &mut Allocator,
    host: &HostValue,
    tv: &TypedValue,
) -> Result<WriteBack, MachineError> {
    let mut plan = WriteBack::default();
    let Some(t) = &tv.t else {
        return Ok(plan);
    };
    match (&tv.v, host) {
        (Value::Pointer(p), HostValue::Pointer(cell)) => {
            let elem = t.elem().ok_or_else(|| unsupported(t))?;
            plan_slot(heap, alloc, p.base, p.index, &cell.borrow(), &elem, &mut plan)?;
        }
        (Value::Slice(s), HostValue::List(_) | HostValue::Bytes(_)) => {
            let elem = t.elem().ok_or_else(|| unsupported(t))?;
            for (i, item) in host_items(host).iter().take(s.length).enumerate() {
                plan_slot(heap, alloc, s.base, s.offset + i, item, &elem, &mut plan)?;
            }
        }
        (Value::Map(r), HostValue::Map(items)) => {
            let Type::Map(mt) = t.base() else {
                return Err(unsupported(t));
            };
            let r = *r;
            let mut keep = Vec::with_capacity(items.len());
            for (k, v) in items {
                let key = from_host(heap, alloc, k, &mt.key)?;
                let value = from_host(heap, alloc, v, &mt.value)?;
                let mk = key.map_key(heap)?;
                keep.push(mk.clone());
                plan.edits.push(Edit::MapSet {
                    map: r,
                    mk,
                    key,
                    value,
                });
            }
            if let Some(map) = heap.map(r) {
                for (k, _) in map.iter() {
                    let mk = k.map_key(heap)?;
                    if !keep.contains(&mk) {
                        plan.edits.push(Edit::MapDelete { map: r, mk });
                    }
                }
            }
        }
        _ => {}
    }
    Ok(plan)
}

/// [`plan_write_back`] applied right away, for callers that need no vetting.
pub fn write_back(
    heap: &mut Heap,
    alloc: &mut Allocator,
    host: &HostValue,
    tv: &TypedValue,
) -> Result<Vec<SlotWrite>, MachineError> {
    Ok(plan_write_back(heap, alloc, host, tv)?.apply(heap))
}

fn host_items(host: &HostValue) -> Vec<HostValue> {
    match host {
        HostValue::Bytes(bytes) => bytes.iter().map(|b| HostValue::Uint(*b as u64)).collect(),
        HostValue::List(items) => items.clone(),
        _ => Vec::new(),
    }
}

/// Plans one slot. Composite pointees are updated field by field so their
/// object identity survives the round trip.
fn plan_slot(
    heap: &mut Heap,
    alloc: &mut Allocator,
    base: ObjRef,
    index: usize,
    host: &HostValue,
    t: &Type,
    plan: &mut WriteBack,
) -> Result<(), MachineError> {
    let current = heap
        .get(base)
        .slot(index)
        .cloned()
        .ok_or_else(|| MachineError::malformed("write-back into a missing slot"))?;
    match (&current.v, host) {
        (Value::Struct(r), HostValue::Struct(fields)) => {
            let st = t.as_struct().ok_or_else(|| unsupported(t))?;
            for (i, ((_, fv), ft)) in fields.iter().zip(st.fields.iter()).enumerate() {
                plan_slot(heap, alloc, *r, i, fv, &ft.typ, plan)?;
            }
            return Ok(());
        }
        (Value::Array(r), HostValue::List(_) | HostValue::Bytes(_)) => {
            let elem = t.elem().ok_or_else(|| unsupported(t))?;
            let len = heap.array_list(*r).len();
            for (i, item) in host_items(host).iter().take(len).enumerate() {
                plan_slot(heap, alloc, *r, i, item, &elem, plan)?;
            }
            return Ok(());
        }
        _ => {}
    }
    if to_host(heap, &current)? == *host {
        return Ok(());
    }
    let slot_type = current.t.clone().unwrap_or_else(|| t.clone());
    let slot_type = if slot_type.is_interface() { t.clone() } else { slot_type };
    let value = from_host(heap, alloc, host, &slot_type)?;
    plan.edits.push(Edit::Slot { base, index, value });
    Ok(())
}

struct NativeEntry {
    typ: Type,
    f: HostFn,
}

/// Host functions keyed by package path and name.
#[derive(Default)]
pub struct NativeRegistry {
    funcs: HashMap<(Name, Name), NativeEntry>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under `pkg_path.name` with signature `typ`.
    pub fn register<F>(&mut self, pkg_path: &str, name: &str, typ: Type, f: F)
    where
        F: Fn(&mut [HostValue]) -> Result<Vec<HostValue>, HostPanic> + 'static,
    {
        self.funcs.insert(
            (Rc::from(pkg_path), Rc::from(name)),
            NativeEntry {
                typ,
                f: Rc::new(f),
            },
        );
    }

    pub fn contains(&self, pkg_path: &str, name: &str) -> bool {
        self.funcs.contains_key(&(Rc::from(pkg_path), Rc::from(name)))
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Function value that marshals its arguments, calls the host and
    /// writes mutations back.
    pub fn func_value(&self, pkg_path: &str, name: &str) -> Option<Rc<FuncValue>> {
        let entry = self.funcs.get(&(Rc::from(pkg_path), Rc::from(name)))?;
        let typ = entry.typ.clone();
        let f = entry.f.clone();
        let sig = typ.clone();
        Some(Rc::new(FuncValue::native(
            name,
            typ,
            pkg_path,
            Rc::new(move |m: &mut Machine<'_>| {
                let res = call_host(m, &sig, &f);
                m.trap(res).map(|_| ())
            }),
        )))
    }
}

fn call_host(m: &mut Machine<'_>, sig: &Type, f: &HostFn) -> Result<(), Fault> {
    let ft = sig
        .as_func()
        .ok_or_else(|| MachineError::unexpected("function type", sig))?;
    let args = m.native_args()?;
    let mut hosts = args
        .iter()
        .map(|tv| to_host(&m.heap, tv))
        .collect::<Result<Vec<_>, _>>()?;
    let results = f(&mut hosts).map_err(|p| Fault::Panic(p.0))?;
    if results.len() != ft.results.len() {
        return Err(Fault::Fatal(MachineError::TypeMismatch(format!(
            "host function returned {} results, expected {}",
            results.len(),
            ft.results.len()
        ))));
    }
    let mut plan = WriteBack::default();
    for (host, arg) in hosts.iter().zip(args.iter()) {
        plan.extend(plan_write_back(&mut m.heap, &mut m.alloc, host, arg)?);
    }
    // Nothing is written unless every target may be.
    for owner in plan.owners() {
        m.check_writable(owner)?;
    }
    for w in plan.apply(&mut m.heap) {
        m.did_update(w.owner, w.old, w.new)?;
    }
    for (host, rt) in results.iter().zip(ft.results.iter()) {
        let tv = from_host(&mut m.heap, &mut m.alloc, host, &rt.typ)?;
        m.push_value(tv);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::type_system::FieldType;

    fn point() -> Type {
        Type::strukt(
            "main",
            vec![FieldType::new("X", Type::INT), FieldType::new("Y", Type::INT)],
        )
    }

    #[test]
    fn scalars_cross_both_ways() {
        let mut heap = Heap::new();
        let mut alloc = Allocator::default();
        let tv = TypedValue::from_int(Type::INT64, -4);
        assert_eq!(to_host(&heap, &tv).unwrap(), HostValue::Int(-4));
        let back = from_host(&mut heap, &mut alloc, &HostValue::Int(300), &Type::UINT8).unwrap();
        assert_eq!(back.get_uint(), 44);
        let s = from_host(&mut heap, &mut alloc, &HostValue::String("hi".into()), &Type::STRING).unwrap();
        assert_eq!(s.get_string(), "hi");
        assert_eq!(to_host(&heap, &TypedValue::undefined()).unwrap(), HostValue::Nil);
    }

    #[test]
    fn byte_slices_become_bytes() {
        let mut heap = Heap::new();
        let mut alloc = Allocator::default();
        let t = Type::slice(Type::UINT8);
        let tv = from_host(&mut heap, &mut alloc, &HostValue::Bytes(b"abc".to_vec()), &t).unwrap();
        assert_eq!(to_host(&heap, &tv).unwrap(), HostValue::Bytes(b"abc".to_vec()));
    }

    #[test]
    fn structs_keep_field_names() {
        let mut heap = Heap::new();
        let mut alloc = Allocator::default();
        let host = HostValue::Struct(vec![
            (Rc::from("X"), HostValue::Int(1)),
            (Rc::from("Y"), HostValue::Int(2)),
        ]);
        let tv = from_host(&mut heap, &mut alloc, &host, &point()).unwrap();
        assert_eq!(to_host(&heap, &tv).unwrap(), host);
    }

    #[test]
    fn pointer_mutations_are_written_back() {
        let mut heap = Heap::new();
        let mut alloc = Allocator::default();
        let t = Type::pointer(point());
        let host = HostValue::Pointer(Rc::new(RefCell::new(HostValue::Struct(vec![
            (Rc::from("X"), HostValue::Int(1)),
            (Rc::from("Y"), HostValue::Int(2)),
        ]))));
        let ptr = from_host(&mut heap, &mut alloc, &host, &t).unwrap();
        let before = to_host(&heap, &ptr).unwrap();
        let HostValue::Pointer(cell) = &before else {
            panic!("expected pointer");
        };
        if let HostValue::Struct(fields) = &mut *cell.borrow_mut() {
            fields[1].1 = HostValue::Int(20);
        }
        let writes = write_back(&mut heap, &mut alloc, &before, &ptr).unwrap();
        assert_eq!(writes.len(), 1);
        let after = to_host(&heap, &ptr).unwrap();
        assert_eq!(after, before);
        // struct identity is preserved
        let p = ptr.get_pointer().unwrap();
        let Some(TypedValue { v: Value::Struct(s), .. }) = heap.get(p.base).slot(0) else {
            panic!("expected struct");
        };
        assert_eq!(writes[0].owner, *s);
    }

    #[test]
    fn map_write_back_adds_and_removes() {
        let mut heap = Heap::new();
        let mut alloc = Allocator::default();
        let t = Type::map(Type::STRING, Type::INT);
        let host = HostValue::Map(vec![
            (HostValue::String("a".into()), HostValue::Int(1)),
            (HostValue::String("b".into()), HostValue::Int(2)),
        ]);
        let tv = from_host(&mut heap, &mut alloc, &host, &t).unwrap();
        let edited = HostValue::Map(vec![
            (HostValue::String("b".into()), HostValue::Int(5)),
            (HostValue::String("c".into()), HostValue::Int(3)),
        ]);
        write_back(&mut heap, &mut alloc, &edited, &tv).unwrap();
        let HostValue::Map(items) = to_host(&heap, &tv).unwrap() else {
            panic!("expected map");
        };
        let keys: Vec<_> = items.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![HostValue::String("b".into()), HostValue::String("c".into())]
        );
        assert_eq!(items[0].1, HostValue::Int(5));
    }

    #[test]
    fn self_referential_values_are_rejected() {
        let mut heap = Heap::new();
        let st = Type::strukt("main", vec![FieldType::new("P", Type::interface("", vec![]))]);
        let r = heap.alloc(Object::Struct(StructValue {
            fields: vec![TypedValue::undefined()],
        }));
        let item = heap.alloc(Object::HeapItem(TypedValue::with_value(st.clone(), Value::Struct(r))));
        let ptr = TypedValue::with_value(
            Type::pointer(st),
            Value::Pointer(PointerValue { base: item, index: 0 }),
        );
        *heap.get_mut(r).slot_mut(0).unwrap() = ptr.clone();
        let err = to_host(&heap, &ptr).unwrap_err();
        assert!(matches!(err, MachineError::UnsupportedKind(ref msg) if msg.contains("cyclic")));
    }

    #[test]
    fn shared_objects_are_not_cycles() {
        let mut heap = Heap::new();
        let mut alloc = Allocator::default();
        let inner = from_host(
            &mut heap,
            &mut alloc,
            &HostValue::Struct(vec![
                (Rc::from("X"), HostValue::Int(1)),
                (Rc::from("Y"), HostValue::Int(2)),
            ]),
            &point(),
        )
        .unwrap();
        let pair = Type::array(2, point());
        let r = heap.alloc(Object::Array(ArrayValue {
            list: vec![inner.clone(), inner],
        }));
        let tv = TypedValue::with_value(pair, Value::Array(r));
        let HostValue::List(items) = to_host(&heap, &tv).unwrap() else {
            panic!("expected list");
        };
        assert_eq!(items[0], items[1]);
    }

    #[test]
    fn planned_writes_leave_the_heap_alone_until_applied() {
        let mut heap = Heap::new();
        let mut alloc = Allocator::default();
        let t = Type::slice(Type::INT);
        let tv = from_host(
            &mut heap,
            &mut alloc,
            &HostValue::List(vec![HostValue::Int(1), HostValue::Int(2)]),
            &t,
        )
        .unwrap();
        let edited = HostValue::List(vec![HostValue::Int(1), HostValue::Int(7)]);
        let plan = plan_write_back(&mut heap, &mut alloc, &edited, &tv).unwrap();
        let Value::Slice(sv) = &tv.v else {
            panic!("expected slice");
        };
        let base = sv.base;
        assert_eq!(plan.owners().collect::<Vec<_>>(), vec![base]);
        assert_eq!(heap.array_list(base)[1].get_int(), 2);
        let writes = plan.apply(&mut heap);
        assert_eq!(writes.len(), 1);
        assert_eq!(heap.array_list(base)[1].get_int(), 7);
    }

    #[test]
    fn unsupported_kinds_are_rejected() {
        let mut heap = Heap::new();
        let mut alloc = Allocator::default();
        let err = from_host(&mut heap, &mut alloc, &HostValue::Int(1), &Type::chan(Type::INT)).unwrap_err();
        assert!(matches!(err, MachineError::UnsupportedKind(_)));
        let tv = TypedValue::type_value(Type::INT);
        assert!(matches!(to_host(&heap, &tv), Err(MachineError::UnsupportedKind(_))));
    }

    #[test]
    fn registry_builds_function_values() {
        let mut reg = NativeRegistry::new();
        reg.register(
            "std",
            "Double",
            Type::func(
                vec![FieldType::new("", Type::INT)],
                vec![FieldType::new("", Type::INT)],
                false,
            ),
            |args| match args {
                [HostValue::Int(x)] => Ok(vec![HostValue::Int(*x * 2)]),
                _ => Err(HostPanic("bad args".into())),
            },
        );
        assert!(reg.contains("std", "Double"));
        assert_eq!(reg.len(), 1);
        let f = reg.func_value("std", "Double").unwrap();
        assert_eq!(&*f.name, "Double");
        assert!(reg.func_value("std", "Missing").is_none());
    }
}
