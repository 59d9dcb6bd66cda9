//! Object arena. Objects are addressed by [`ObjRef`] index, never by host
//! pointer, so the ownership graph can hold cycles without shared mutable
//! smart pointers.

use crate::virtual_machine::alloc::Allocator;
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::ownership::{ObjectId, ObjectInfo, PkgId};
use crate::virtual_machine::type_system::{Kind, Type};
use crate::virtual_machine::values::{
    ArrayValue, Block, BlockSource, MapValue, ObjRef, Object, StructValue, TypedValue, Value,
};
use num_bigint::BigInt;
use std::collections::HashMap;

pub struct HeapSlot {
    pub info: ObjectInfo,
    pub object: Object,
}

#[derive(Default)]
pub struct Heap {
    slots: Vec<HeapSlot>,
    /// Real objects already materialized from the store.
    loaded: HashMap<ObjectId, ObjRef>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Places an object in the arena. Accounting is the caller's job.
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        let r = ObjRef(self.slots.len() as u32);
        self.slots.push(HeapSlot {
            info: ObjectInfo::default(),
            object,
        });
        r
    }

    pub fn get(&self, r: ObjRef) -> &Object {
        &self.slots[r.0 as usize].object
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        &mut self.slots[r.0 as usize].object
    }

    pub fn replace(&mut self, r: ObjRef, object: Object) {
        self.slots[r.0 as usize].object = object;
    }

    pub fn info(&self, r: ObjRef) -> &ObjectInfo {
        &self.slots[r.0 as usize].info
    }

    pub fn info_mut(&mut self, r: ObjRef) -> &mut ObjectInfo {
        &mut self.slots[r.0 as usize].info
    }

    pub fn register(&mut self, id: ObjectId, r: ObjRef) {
        self.loaded.insert(id, r);
    }

    pub fn lookup(&self, id: &ObjectId) -> Option<ObjRef> {
        self.loaded.get(id).copied()
    }

    pub fn forget(&mut self, id: &ObjectId) -> Option<ObjRef> {
        self.loaded.remove(id)
    }

    /// Materialized objects of realm `pkg`, in id order.
    pub fn loaded_in(&self, pkg: PkgId) -> Vec<(ObjectId, ObjRef)> {
        let mut found: Vec<_> = self
            .loaded
            .iter()
            .filter(|(id, _)| id.pkg == pkg)
            .map(|(id, r)| (*id, *r))
            .collect();
        found.sort_unstable_by_key(|(id, _)| *id);
        found
    }

    pub fn block(&self, r: ObjRef) -> Option<&Block> {
        match self.get(r) {
            Object::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn block_mut(&mut self, r: ObjRef) -> Option<&mut Block> {
        match self.get_mut(r) {
            Object::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_package_block(&self, r: ObjRef) -> bool {
        self.block(r).is_some_and(|b| b.is_package())
    }

    pub fn is_universe_block(&self, r: ObjRef) -> bool {
        self.block(r)
            .is_some_and(|b| matches!(b.source, BlockSource::Universe))
    }

    pub fn array(&self, r: ObjRef) -> Option<&ArrayValue> {
        match self.get(r) {
            Object::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn array_list(&self, r: ObjRef) -> &[TypedValue] {
        match self.get(r) {
            Object::Array(a) => &a.list,
            _ => &[],
        }
    }

    pub fn array_mut(&mut self, r: ObjRef) -> Option<&mut ArrayValue> {
        match self.get_mut(r) {
            Object::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn struct_fields(&self, r: ObjRef) -> &[TypedValue] {
        match self.get(r) {
            Object::Struct(s) => &s.fields,
            _ => &[],
        }
    }

    pub fn struct_mut(&mut self, r: ObjRef) -> Option<&mut StructValue> {
        match self.get_mut(r) {
            Object::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn map(&self, r: ObjRef) -> Option<&MapValue> {
        match self.get(r) {
            Object::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn map_mut(&mut self, r: ObjRef) -> Option<&mut MapValue> {
        match self.get_mut(r) {
            Object::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Zero value of `t`. Arrays and structs are allocated eagerly.
    pub fn zero_value(&mut self, alloc: &mut Allocator, t: &Type) -> Result<TypedValue, MachineError> {
        let base = t.base();
        Ok(match &base {
            Type::Array(at) => {
                alloc.allocate_array(at.len)?;
                let mut list = Vec::with_capacity(at.len);
                for _ in 0..at.len {
                    list.push(self.zero_value(alloc, &at.elem)?);
                }
                let r = self.alloc(Object::Array(ArrayValue { list }));
                TypedValue::with_value(t.clone(), Value::Array(r))
            }
            Type::Struct(st) => {
                alloc.allocate_struct(st.fields.len())?;
                let mut fields = Vec::with_capacity(st.fields.len());
                for f in &st.fields {
                    fields.push(self.zero_value(alloc, &f.typ)?);
                }
                let r = self.alloc(Object::Struct(StructValue { fields }));
                TypedValue::with_value(t.clone(), Value::Struct(r))
            }
            Type::Primitive(p) => {
                let t = if p.is_untyped() { t.default_type() } else { t.clone() };
                match t.kind() {
                    Kind::String => {
                        TypedValue::from_string(t, "")
                    }
                    Kind::Bigint => {
                        TypedValue::from_bigint(t, BigInt::from(0))
                    }
                    _ => TypedValue::nil(t),
                }
            }
            _ => TypedValue::nil(t.clone()),
        })
    }

    /// Copy with value semantics: arrays and structs are duplicated
    /// recursively, everything else shares its referent.
    pub fn copy_value(&mut self, alloc: &mut Allocator, tv: TypedValue) -> Result<TypedValue, MachineError> {
        match tv.v {
            Value::Array(r) => {
                let list = self.array_list(r).to_vec();
                alloc.allocate_array(list.len())?;
                let mut copied = Vec::with_capacity(list.len());
                for elem in list {
                    copied.push(self.copy_value(alloc, elem)?);
                }
                let nr = self.alloc(Object::Array(ArrayValue { list: copied }));
                Ok(TypedValue { v: Value::Array(nr), ..tv })
            }
            Value::Struct(r) => {
                let fields = self.struct_fields(r).to_vec();
                alloc.allocate_struct(fields.len())?;
                let mut copied = Vec::with_capacity(fields.len());
                for field in fields {
                    copied.push(self.copy_value(alloc, field)?);
                }
                let nr = self.alloc(Object::Struct(StructValue { fields: copied }));
                Ok(TypedValue { v: Value::Struct(nr), ..tv })
            }
            _ => Ok(tv),
        }
    }

    /// Objects strongly referenced by `r`, in image order.
    ///
    /// A block's parent is a child unless it is a package block, which is
    /// always persisted on its own.
    pub fn children(&self, r: ObjRef) -> Vec<ObjRef> {
        let mut out = Vec::new();
        let mut push = |tv: &TypedValue| {
            if let Some(c) = tv.first_object(self) {
                out.push(c);
            }
        };
        match self.get(r) {
            Object::Array(a) => a.list.iter().for_each(&mut push),
            Object::Struct(s) => s.fields.iter().for_each(&mut push),
            Object::Map(m) => m.iter().for_each(|(k, v)| {
                push(k);
                push(v);
            }),
            Object::HeapItem(tv) => push(tv),
            Object::Block(b) => {
                b.values.iter().for_each(&mut push);
                if let Some(p) = b.parent.filter(|p| !self.is_package_block(*p)) {
                    out.push(p);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::type_system::FieldType;

    #[test]
    fn alloc_and_access() {
        let mut heap = Heap::new();
        let arr = heap.alloc(Object::Array(ArrayValue {
            list: vec![TypedValue::int(1), TypedValue::int(2)],
        }));
        assert_eq!(heap.array_list(arr).len(), 2);
        heap.array_mut(arr).unwrap().list[0] = TypedValue::int(5);
        assert_eq!(heap.array_list(arr)[0].get_int(), 5);
        assert!(heap.map(arr).is_none());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn children_follow_values_and_closure_parents() {
        let mut heap = Heap::new();
        let pkg = heap.alloc(Object::Block(Block::new(
            BlockSource::Package("p".into()),
            1,
            None,
        )));
        let inner = heap.alloc(Object::Struct(StructValue::default()));
        let outer = heap.alloc(Object::Block(Block::new(BlockSource::Local, 1, Some(pkg))));
        let leaf = heap.alloc(Object::Block(Block::new(BlockSource::Local, 2, Some(outer))));
        heap.block_mut(leaf).unwrap().values[1] =
            TypedValue::with_value(Type::strukt("p", vec![]), Value::Struct(inner));

        assert_eq!(heap.children(leaf), vec![inner, outer]);
        // package parents are not children
        assert!(heap.children(outer).is_empty());
        assert!(heap.is_package_block(pkg));
    }

    #[test]
    fn loaded_registry() {
        let mut heap = Heap::new();
        let r = heap.alloc(Object::HeapItem(TypedValue::int(1)));
        let id = ObjectId::default();
        assert!(heap.lookup(&id).is_none());
        heap.register(id, r);
        assert_eq!(heap.lookup(&id), Some(r));
    }

    #[test]
    fn loaded_objects_by_realm() {
        let mut heap = Heap::new();
        let a = PkgId::from_path("gno.land/r/a");
        let b = PkgId::from_path("gno.land/r/b");
        let mut refs = Vec::new();
        for (pkg, time) in [(a, 2), (b, 1), (a, 1)] {
            let r = heap.alloc(Object::HeapItem(TypedValue::int(time as i64)));
            heap.register(ObjectId { pkg, time }, r);
            refs.push(r);
        }
        let found = heap.loaded_in(a);
        assert_eq!(
            found,
            vec![
                (ObjectId { pkg: a, time: 1 }, refs[2]),
                (ObjectId { pkg: a, time: 2 }, refs[0]),
            ]
        );
        assert_eq!(heap.forget(&ObjectId { pkg: a, time: 1 }), Some(refs[2]));
        assert_eq!(heap.loaded_in(a).len(), 1);
        assert_eq!(heap.loaded_in(b).len(), 1);
    }

    #[test]
    fn zero_values_allocate_composites() {
        let mut heap = Heap::new();
        let mut alloc = Allocator::default();
        let point = Type::strukt("p", vec![FieldType::new("X", Type::INT), FieldType::new("S", Type::STRING)]);
        let zero = heap.zero_value(&mut alloc, &Type::array(2, point)).unwrap();
        let Value::Array(arr) = zero.v else { panic!("expected array") };
        let list = heap.array_list(arr).to_vec();
        assert_eq!(list.len(), 2);
        let Value::Struct(s) = list[1].v else { panic!("expected struct") };
        assert_eq!(heap.struct_fields(s)[0].get_int(), 0);
        assert_eq!(heap.struct_fields(s)[1].get_string(), "");
        assert!(heap.zero_value(&mut alloc, &Type::slice(Type::INT)).unwrap().is_nil());
        assert!(alloc.used() > 0);
    }

    #[test]
    fn copies_are_deep_for_value_types() {
        let mut heap = Heap::new();
        let mut alloc = Allocator::default();
        let inner = heap.alloc(Object::Array(ArrayValue { list: vec![TypedValue::int(1)] }));
        let t = Type::array(1, Type::INT);
        let original = TypedValue::with_value(t, Value::Array(inner));
        let copy = heap.copy_value(&mut alloc, original).unwrap();
        let Value::Array(copied) = copy.v else { panic!("expected array") };
        assert_ne!(copied, inner);
        heap.array_mut(copied).unwrap().list[0] = TypedValue::int(9);
        assert_eq!(heap.array_list(inner)[0].get_int(), 1);
    }
}
