use super::{Fault, Machine, Op};
use crate::virtual_machine::ast::{BinaryOp, Expr, ExprRef, Selector, ValuePath};
use crate::virtual_machine::convert::convert_untyped;
use crate::virtual_machine::errors::{ConvertError, MachineError};
use crate::virtual_machine::type_system::{Kind, Type};
use crate::virtual_machine::values::{ObjRef, Object, PointerValue, TypedValue, Value};
use num_bigint::BigInt;

/// A resolved assignment destination.
#[derive(Clone, Debug)]
pub enum Target {
    /// Block slot, array element, struct field or heap item. `typ` is the
    /// declared type when it is known; otherwise the slot keeps the type of
    /// its current value.
    Slot {
        base: ObjRef,
        index: usize,
        typ: Option<Type>,
    },
    MapEntry {
        map: ObjRef,
        key: TypedValue,
        value_type: Type,
    },
    /// `_`
    Blank,
}

impl Machine<'_> {
    /// Schedules the evaluation of `x` as an assignment destination.
    pub(super) fn push_target(&mut self, x: &ExprRef) -> Result<(), MachineError> {
        match &**x {
            Expr::Name { name, path } => {
                if &**name == "_" {
                    self.push_op(Op::TargetBlank);
                } else {
                    self.push_op(Op::TargetName(*path));
                }
            }
            Expr::Index { x: base, index, .. } => {
                self.push_op(Op::TargetIndex);
                self.push_op(Op::Eval(index.clone()));
                self.push_op(Op::Eval(base.clone()));
            }
            Expr::Selector { x: base, .. } => {
                self.push_op(Op::TargetSelector(x.clone()));
                self.push_op(Op::Eval(base.clone()));
            }
            Expr::Star { x: base } => {
                self.push_op(Op::TargetStar);
                self.push_op(Op::Eval(base.clone()));
            }
            other => {
                return Err(MachineError::malformed(format!("cannot assign to {:?}", other)));
            }
        }
        Ok(())
    }

    pub(super) fn op_target_name(&mut self, path: ValuePath) -> Result<(), MachineError> {
        let base = self.block_at(path.depth)?;
        let index = path.index as usize;
        let typ = self.block_static(base, index);
        self.targets.push(Target::Slot { base, index, typ });
        Ok(())
    }

    pub(super) fn op_target_blank(&mut self) -> Result<(), MachineError> {
        self.targets.push(Target::Blank);
        Ok(())
    }

    pub(super) fn op_target_index(&mut self) -> Result<(), MachineError> {
        let index = self.pop_value()?;
        let x = self.pop_value()?;
        let res = self.index_target(x, index);
        let target = try_panic!(self, res);
        self.targets.push(target);
        Ok(())
    }

    fn index_target(&mut self, x: TypedValue, index: TypedValue) -> Result<Target, Fault> {
        match &x.v {
            Value::Map(r) => {
                let (key_type, value_type) = map_types(&x)?;
                let key = self.assignable(index, &key_type)?;
                Ok(Target::MapEntry {
                    map: *r,
                    key,
                    value_type,
                })
            }
            Value::None if x.kind() == Kind::Map => {
                Err(Fault::Panic("assignment to entry in nil map".into()))
            }
            _ => {
                let (base, offset, len) = self.list_of(&x)?;
                let i = check_index(&index, len)?;
                Ok(Target::Slot {
                    base,
                    index: offset + i,
                    typ: list_elem_type(&x),
                })
            }
        }
    }

    /// Backing array, offset and length of an array, slice or pointer to
    /// array.
    pub(super) fn list_of(&self, x: &TypedValue) -> Result<(ObjRef, usize, usize), Fault> {
        match &x.v {
            Value::Array(r) => Ok((*r, 0, self.heap.array_list(*r).len())),
            Value::Slice(s) => Ok((s.base, s.offset, s.length)),
            Value::Pointer(p) => match self.heap.get(p.base).slot(p.index).map(|tv| &tv.v) {
                Some(Value::Array(r)) => Ok((*r, 0, self.heap.array_list(*r).len())),
                _ => Err(MachineError::unexpected("pointer to array", x.kind()).into()),
            },
            Value::None if x.kind() == Kind::Pointer => Err(nil_deref()),
            Value::None if x.kind() == Kind::Slice => Ok((ObjRef(0), 0, 0)),
            _ => Err(MachineError::unexpected("indexable value", x.kind()).into()),
        }
    }

    pub(super) fn op_target_selector(&mut self, expr: ExprRef) -> Result<(), MachineError> {
        let Expr::Selector { sel, .. } = &*expr else {
            return Err(MachineError::unexpected("selector", &*expr));
        };
        let x = self.pop_value()?;
        let target = match sel {
            Selector::Field(i) => {
                let res = self.struct_ref(&x);
                let r = try_panic!(self, res);
                Target::Slot {
                    base: r,
                    index: *i as usize,
                    typ: field_path_type(x.t.as_ref(), &[*i]),
                }
            }
            Selector::Promoted(path) => {
                let typ = field_path_type(x.t.as_ref(), path);
                let res = self.promoted_slot(x, path);
                let (r, i) = try_panic!(self, res);
                Target::Slot {
                    base: r,
                    index: i,
                    typ,
                }
            }
            Selector::Package(i) => match &x.v {
                Value::Package(pv) => Target::Slot {
                    base: pv.block,
                    index: *i as usize,
                    typ: self.block_static(pv.block, *i as usize),
                },
                _ => return Err(MachineError::unexpected("package", x.kind())),
            },
            Selector::Method(_) | Selector::Interface(_) => {
                return Err(MachineError::malformed("cannot assign to a method"));
            }
        };
        self.targets.push(target);
        Ok(())
    }

    /// Declared interface type of a block slot, if any.
    pub(super) fn block_static(&self, base: ObjRef, index: usize) -> Option<Type> {
        self.heap.block(base)?.static_type(index).cloned()
    }

    /// Struct object behind a struct value or a pointer to one.
    pub(super) fn struct_ref(&self, x: &TypedValue) -> Result<ObjRef, Fault> {
        match &x.v {
            Value::Struct(r) => Ok(*r),
            Value::Pointer(p) => match self.heap.get(p.base).slot(p.index).map(|tv| &tv.v) {
                Some(Value::Struct(r)) => Ok(*r),
                _ => Err(MachineError::unexpected("pointer to struct", x.kind()).into()),
            },
            Value::None if x.kind() == Kind::Pointer => Err(nil_deref()),
            _ => Err(MachineError::unexpected("struct", x.kind()).into()),
        }
    }

    /// Struct object and field index at the end of an embedding path.
    pub(super) fn promoted_slot(&self, x: TypedValue, path: &[u16]) -> Result<(ObjRef, usize), Fault> {
        let Some((last, walk)) = path.split_last() else {
            return Err(MachineError::malformed("empty field path").into());
        };
        let mut cur = x;
        for i in walk {
            let r = self.struct_ref(&cur)?;
            cur = self
                .heap
                .struct_fields(r)
                .get(*i as usize)
                .cloned()
                .ok_or_else(|| MachineError::malformed("field index out of range"))?;
        }
        Ok((self.struct_ref(&cur)?, *last as usize))
    }

    pub(super) fn op_target_star(&mut self) -> Result<(), MachineError> {
        let x = self.pop_value()?;
        match &x.v {
            Value::Pointer(p) => {
                self.targets.push(Target::Slot {
                    base: p.base,
                    index: p.index,
                    typ: x.t.as_ref().and_then(|t| t.elem()),
                });
                Ok(())
            }
            Value::None => {
                self.trap::<()>(Err(nil_deref()))?;
                Ok(())
            }
            _ => Err(MachineError::unexpected("pointer", x.kind())),
        }
    }

    /// Pops `n` targets and `n` values and assigns them pairwise.
    pub(super) fn op_assign(&mut self, n: usize) -> Result<(), MachineError> {
        let at = self
            .targets
            .len()
            .checked_sub(n)
            .ok_or(MachineError::StackUnderflow("target"))?;
        let targets = self.targets.split_off(at);
        let values = self.pop_values(n)?;
        for (target, v) in targets.into_iter().zip(values) {
            let res = self.assign_target(target, v);
            try_panic!(self, res);
        }
        Ok(())
    }

    pub(super) fn op_op_assign(&mut self, bop: BinaryOp) -> Result<(), MachineError> {
        let target = self
            .targets
            .pop()
            .ok_or(MachineError::StackUnderflow("target"))?;
        let rhs = self.pop_value()?;
        let res = self.read_target(&target);
        let cur = try_panic!(self, res);
        let res = self.binary_op(bop, cur, rhs);
        let v = try_panic!(self, res);
        let res = self.assign_target(target, v);
        try_panic!(self, res);
        Ok(())
    }

    pub(super) fn op_inc_dec(&mut self, inc: bool) -> Result<(), MachineError> {
        let target = self
            .targets
            .pop()
            .ok_or(MachineError::StackUnderflow("target"))?;
        let res = self.read_target(&target);
        let cur = try_panic!(self, res);
        let t = cur.typ()?.clone();
        let one = if t.kind() == Kind::Bigint {
            TypedValue::from_bigint(t, BigInt::from(1))
        } else if t.kind().is_integer() {
            TypedValue::from_int(t, 1)
        } else {
            return Err(MachineError::TypeMismatch(format!("cannot increment {}", t)));
        };
        let bop = if inc { BinaryOp::Add } else { BinaryOp::Sub };
        let res = self.binary_op(bop, cur, one);
        let v = try_panic!(self, res);
        let res = self.assign_target(target, v);
        try_panic!(self, res);
        Ok(())
    }

    fn read_target(&mut self, target: &Target) -> Result<TypedValue, Fault> {
        match target {
            Target::Slot { base, index, .. } => Ok(self
                .heap
                .get(*base)
                .slot(*index)
                .cloned()
                .ok_or_else(|| MachineError::malformed("slot out of range"))?),
            Target::MapEntry {
                map,
                key,
                value_type,
            } => {
                let mk = key.map_key(&self.heap)?;
                match self.heap.map(*map).and_then(|m| m.get(&mk)).cloned() {
                    Some(v) => Ok(v),
                    None => Ok(self.heap.zero_value(&mut self.alloc, value_type)?),
                }
            }
            Target::Blank => Err(MachineError::malformed("cannot read _").into()),
        }
    }

    /// Converts `v` to the destination's type and stores it.
    pub(super) fn assign_target(&mut self, target: Target, v: TypedValue) -> Result<(), Fault> {
        match target {
            Target::Slot { base, index, typ } => {
                let slot_type =
                    typ.or_else(|| self.heap.get(base).slot(index).and_then(|tv| tv.t.clone()));
                let v = match slot_type {
                    Some(t) => self.assignable(v, &t)?,
                    None => self.default_value(v)?,
                };
                self.set_slot(base, index, v)?;
            }
            Target::MapEntry {
                map,
                key,
                value_type,
            } => {
                let v = self.assignable(v, &value_type)?;
                self.set_map_entry(map, key, v)?;
            }
            Target::Blank => {}
        }
        Ok(())
    }

    /// Gives `value` a form storable in a location of type `t`. Untyped
    /// constants are converted; typed values pass through.
    pub fn assignable(&mut self, value: TypedValue, t: &Type) -> Result<TypedValue, Fault> {
        if value.is_undefined() {
            return Ok(TypedValue::nil(t.clone()));
        }
        if !value.is_untyped() {
            return Ok(value);
        }
        match convert_untyped(&mut self.heap, &mut self.alloc, value.clone(), Some(t)) {
            Ok(v) => Ok(v),
            Err(ConvertError::Invalid { .. }) => self.default_value(value),
            Err(err) => Err(err.into()),
        }
    }

    /// Stores `value` into a slot of `base`, keeping ownership in sync.
    pub fn set_slot(&mut self, base: ObjRef, index: usize, value: TypedValue) -> Result<(), MachineError> {
        self.check_writable(base)?;
        let value = self.heap.copy_value(&mut self.alloc, value)?;
        let co = value.first_object(&self.heap);
        let slot = self
            .heap
            .get_mut(base)
            .slot_mut(index)
            .ok_or_else(|| MachineError::malformed(format!("slot {} out of range", index)))?;
        let old = std::mem::replace(slot, value);
        let xo = old.first_object(&self.heap);
        self.did_update(base, xo, co)
    }

    pub fn set_map_entry(&mut self, map: ObjRef, key: TypedValue, value: TypedValue) -> Result<(), MachineError> {
        self.check_writable(map)?;
        let value = self.heap.copy_value(&mut self.alloc, value)?;
        let key = self.heap.copy_value(&mut self.alloc, key)?;
        let mk = key.map_key(&self.heap)?;
        let ko = key.first_object(&self.heap);
        let co = value.first_object(&self.heap);
        let m = self
            .heap
            .map_mut(map)
            .ok_or_else(|| MachineError::unexpected("map", map))?;
        let inserted = m.lookup(&mk).is_none();
        let old = m.set(mk, key, value);
        if inserted {
            self.alloc.allocate_map_items(1)?;
            self.did_update(map, None, ko)?;
        }
        let xo = old.and_then(|o| o.first_object(&self.heap));
        self.did_update(map, xo, co)
    }

    pub fn delete_map_entry(&mut self, map: ObjRef, key: &TypedValue) -> Result<(), MachineError> {
        let mk = key.map_key(&self.heap)?;
        if self.heap.map(map).and_then(|m| m.lookup(&mk)).is_none() {
            return Ok(());
        }
        self.check_writable(map)?;
        let removed = self
            .heap
            .map_mut(map)
            .ok_or_else(|| MachineError::unexpected("map", map))?
            .delete(&mk);
        if let Some((k, v)) = removed {
            let ko = k.first_object(&self.heap);
            let vo = v.first_object(&self.heap);
            self.did_update(map, ko, None)?;
            self.did_update(map, vo, None)?;
        }
        Ok(())
    }

    /// Reports a change of `po`'s slot from `xo` to `co` to the active realm.
    /// Persisted objects can only be changed from within their realm.
    pub fn did_update(
        &mut self,
        po: ObjRef,
        xo: Option<ObjRef>,
        co: Option<ObjRef>,
    ) -> Result<(), MachineError> {
        match &self.realm {
            Some(realm) => realm
                .borrow_mut()
                .did_update(&mut self.heap, Some(po), xo, co),
            None => match self.heap.info(po).id {
                Some(id) => Err(MachineError::CrossRealmWrite(id)),
                None => Ok(()),
            },
        }
    }

    pub(crate) fn check_writable(&self, base: ObjRef) -> Result<(), MachineError> {
        let Some(id) = self.heap.info(base).id else {
            return Ok(());
        };
        match &self.realm {
            Some(realm) if realm.borrow().id == id.pkg => Ok(()),
            _ => Err(MachineError::CrossRealmWrite(id)),
        }
    }

    /// `&x` for an addressable `x`.
    pub(super) fn op_ref(&mut self) -> Result<(), MachineError> {
        let target = self
            .targets
            .pop()
            .ok_or(MachineError::StackUnderflow("target"))?;
        match target {
            Target::Slot { base, index, typ } => {
                let t = typ
                    .or_else(|| self.heap.get(base).slot(index).and_then(|tv| tv.t.clone()))
                    .ok_or_else(|| MachineError::malformed("address of an undefined slot"))?;
                self.push_value(TypedValue::with_value(
                    Type::pointer(t),
                    Value::Pointer(PointerValue { base, index }),
                ));
                Ok(())
            }
            Target::MapEntry { .. } => Err(MachineError::malformed("cannot take the address of a map entry")),
            Target::Blank => Err(MachineError::malformed("cannot take the address of _")),
        }
    }

    /// `&T{...}`: moves the composite value into a fresh heap item.
    pub(super) fn op_ref_value(&mut self) -> Result<(), MachineError> {
        let x = self.pop_value()?;
        let t = x.typ()?.clone();
        self.alloc.allocate_heap_item()?;
        let base = self.heap.alloc(Object::HeapItem(x));
        self.push_value(TypedValue::with_value(
            Type::pointer(t),
            Value::Pointer(PointerValue { base, index: 0 }),
        ));
        Ok(())
    }
}

pub(super) fn nil_deref() -> Fault {
    Fault::Panic("invalid memory address or nil pointer dereference".into())
}

pub(super) fn check_index(index: &TypedValue, len: usize) -> Result<usize, Fault> {
    match index.to_index() {
        Some(i) if i < len => Ok(i),
        _ => Err(Fault::Panic(format!(
            "index out of range [{}] with length {}",
            index.to_bigint(),
            len
        ))),
    }
}

pub(super) fn map_types(x: &TypedValue) -> Result<(Type, Type), MachineError> {
    match x.typ()?.base() {
        Type::Map(mt) => Ok((mt.key.clone(), mt.value.clone())),
        other => Err(MachineError::unexpected("map type", &other)),
    }
}

/// Element type of an array, slice or pointer to array.
fn list_elem_type(x: &TypedValue) -> Option<Type> {
    let t = x.t.as_ref()?;
    match t.kind() {
        Kind::Pointer => t.elem()?.elem(),
        _ => t.elem(),
    }
}

/// Type of the field reached by `path` from a struct or pointer to struct,
/// stepping through embedded pointers.
fn field_path_type(t: Option<&Type>, path: &[u16]) -> Option<Type> {
    let mut cur = t?.clone();
    for i in path {
        if cur.kind() == Kind::Pointer {
            cur = cur.elem()?;
        }
        cur = cur.as_struct()?.fields.get(*i as usize)?.typ.clone();
    }
    Some(cur)
}
