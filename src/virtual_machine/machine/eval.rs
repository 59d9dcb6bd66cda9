use super::assign::{check_index, map_types, nil_deref};
use super::{Fault, Machine, Op};
use crate::virtual_machine::ast::{Expr, ExprRef, Selector, ValuePath};
use crate::virtual_machine::convert::convert_to;
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::type_system::{Kind, Method, Type};
use crate::virtual_machine::values::{
    ArrayValue, BoundMethodValue, FuncValue, MapValue, Object, SliceValue, StructValue,
    TypedValue, Value,
};
use std::rc::Rc;

impl Machine<'_> {
    pub(super) fn op_eval(&mut self, expr: ExprRef) -> Result<(), MachineError> {
        match &*expr {
            Expr::Name { path, .. } => {
                let v = self.read_path(*path)?;
                self.push_value(v);
            }
            Expr::Const(tv) => self.push_value(tv.clone()),
            Expr::Binary { op, left, right } => {
                use crate::virtual_machine::ast::BinaryOp;
                match op {
                    BinaryOp::Land => self.push_op(Op::Land(right.clone())),
                    BinaryOp::Lor => self.push_op(Op::Lor(right.clone())),
                    _ => {
                        self.push_op(Op::Binary(*op));
                        self.push_op(Op::Eval(right.clone()));
                    }
                }
                self.push_op(Op::Eval(left.clone()));
            }
            Expr::Unary { op, x } => {
                self.push_op(Op::Unary(*op));
                self.push_op(Op::Eval(x.clone()));
            }
            Expr::Call { func, args, .. } => match func.as_type() {
                Some(t) => {
                    let [arg] = args.as_slice() else {
                        return Err(MachineError::malformed(format!(
                            "conversion to {} needs one value",
                            t
                        )));
                    };
                    self.push_op(Op::Convert(t.clone()));
                    self.push_op(Op::Eval(arg.clone()));
                }
                None => {
                    self.push_op(Op::CallArgs(expr.clone(), false));
                    self.push_op(Op::Eval(func.clone()));
                }
            },
            Expr::Index { x, index, has_ok } => {
                self.push_op(Op::Index(*has_ok));
                self.push_op(Op::Eval(index.clone()));
                self.push_op(Op::Eval(x.clone()));
            }
            Expr::Selector { x, .. } => {
                self.push_op(Op::Selector(expr.clone()));
                self.push_op(Op::Eval(x.clone()));
            }
            Expr::Slice { x, low, high, max } => {
                self.push_op(Op::Slice(expr.clone()));
                for bound in [max, high, low].into_iter().flatten() {
                    self.push_op(Op::Eval(bound.clone()));
                }
                self.push_op(Op::Eval(x.clone()));
            }
            Expr::Star { x } => {
                self.push_op(Op::Star);
                self.push_op(Op::Eval(x.clone()));
            }
            Expr::Ref { x } => {
                if matches!(&**x, Expr::CompositeLit { .. }) {
                    self.push_op(Op::RefValue);
                    self.push_op(Op::Eval(x.clone()));
                } else {
                    self.push_op(Op::Ref);
                    self.push_target(x)?;
                }
            }
            Expr::TypeAssert { x, .. } => {
                self.push_op(Op::TypeAssert(expr.clone()));
                self.push_op(Op::Eval(x.clone()));
            }
            Expr::CompositeLit { elts, .. } => {
                self.push_op(Op::CompositeLit(expr.clone()));
                for kv in elts.iter().rev() {
                    self.push_op(Op::Eval(kv.value.clone()));
                    if let Some(k) = &kv.key {
                        self.push_op(Op::Eval(k.clone()));
                    }
                }
            }
            Expr::FuncLit { source } => {
                self.alloc.allocate_func()?;
                let closure = self.last_block()?;
                let func = FuncValue::from_source(source.clone(), Some(closure));
                self.push_value(TypedValue::with_value(
                    source.typ.clone(),
                    Value::Func(Rc::new(func)),
                ));
            }
        }
        Ok(())
    }

    pub(super) fn read_path(&self, path: ValuePath) -> Result<TypedValue, MachineError> {
        let b = self.block_at(path.depth)?;
        self.heap
            .get(b)
            .slot(path.index as usize)
            .cloned()
            .ok_or_else(|| MachineError::malformed(format!("no slot {}:{}", path.depth, path.index)))
    }

    /// Left operand on the stack. Short-circuits on false.
    pub(super) fn op_land(&mut self, right: ExprRef) -> Result<(), MachineError> {
        if self.peek_value()?.get_bool() {
            self.pop_value()?;
            self.push_op(Op::Eval(right));
        }
        Ok(())
    }

    /// Left operand on the stack. Short-circuits on true.
    pub(super) fn op_lor(&mut self, right: ExprRef) -> Result<(), MachineError> {
        if !self.peek_value()?.get_bool() {
            self.pop_value()?;
            self.push_op(Op::Eval(right));
        }
        Ok(())
    }

    pub(super) fn op_convert(&mut self, t: Type) -> Result<(), MachineError> {
        let x = self.pop_value()?;
        let res = self.convert_value(x, &t);
        let v = try_panic!(self, res);
        self.push_value(v);
        Ok(())
    }

    pub(super) fn convert_value(&mut self, x: TypedValue, t: &Type) -> Result<TypedValue, Fault> {
        Ok(convert_to(&mut self.heap, &mut self.alloc, x, t)?)
    }

    pub(super) fn op_index(&mut self, has_ok: bool) -> Result<(), MachineError> {
        let index = self.pop_value()?;
        let x = self.pop_value()?;
        if x.kind() == Kind::Map {
            let res = self.map_index(&x, index);
            let (v, found) = try_panic!(self, res);
            self.push_value(v);
            if has_ok {
                self.push_value(TypedValue::boolean(found));
            }
            return Ok(());
        }
        let res = self.index_value(&x, &index);
        let v = try_panic!(self, res);
        self.push_value(v);
        Ok(())
    }

    fn map_index(&mut self, x: &TypedValue, index: TypedValue) -> Result<(TypedValue, bool), Fault> {
        let (key_type, value_type) = map_types(x)?;
        let found = match &x.v {
            Value::Map(r) => {
                let key = self.assignable(index, &key_type)?;
                let mk = key.map_key(&self.heap)?;
                self.heap.map(*r).and_then(|m| m.get(&mk)).cloned()
            }
            _ => None,
        };
        match found {
            Some(v) => Ok((v, true)),
            None => Ok((self.heap.zero_value(&mut self.alloc, &value_type)?, false)),
        }
    }

    fn index_value(&mut self, x: &TypedValue, index: &TypedValue) -> Result<TypedValue, Fault> {
        if x.kind() == Kind::String {
            let s = x.get_string();
            let i = check_index(index, s.len())?;
            return Ok(TypedValue::from_uint(Type::UINT8, s.as_bytes()[i] as u64));
        }
        let (base, offset, len) = self.list_of(x)?;
        let i = check_index(index, len)?;
        Ok(self
            .heap
            .array_list(base)
            .get(offset + i)
            .cloned()
            .ok_or_else(|| MachineError::malformed("index past backing array"))?)
    }

    pub(super) fn op_selector(&mut self, expr: ExprRef) -> Result<(), MachineError> {
        let Expr::Selector { sel, .. } = &*expr else {
            return Err(MachineError::unexpected("selector", &*expr));
        };
        let x = self.pop_value()?;
        let res = self.select(x, sel);
        let v = try_panic!(self, res);
        self.push_value(v);
        Ok(())
    }

    fn select(&mut self, x: TypedValue, sel: &Selector) -> Result<TypedValue, Fault> {
        match sel {
            Selector::Field(i) => {
                let r = self.struct_ref(&x)?;
                Ok(self
                    .heap
                    .struct_fields(r)
                    .get(*i as usize)
                    .cloned()
                    .ok_or_else(|| MachineError::malformed("field index out of range"))?)
            }
            Selector::Promoted(path) => {
                let (r, i) = self.promoted_slot(x, path)?;
                Ok(self
                    .heap
                    .struct_fields(r)
                    .get(i)
                    .cloned()
                    .ok_or_else(|| MachineError::malformed("field index out of range"))?)
            }
            Selector::Method(name) => self.bind_method(x, name),
            Selector::Interface(name) => {
                if x.is_nil() && (x.is_undefined() || x.kind() == Kind::Interface) {
                    return Err(nil_deref());
                }
                self.bind_method(x, name)
            }
            Selector::Package(i) => match &x.v {
                Value::Package(pv) => Ok(self
                    .heap
                    .get(pv.block)
                    .slot(*i as usize)
                    .cloned()
                    .ok_or_else(|| MachineError::malformed("package slot out of range"))?),
                _ => Err(MachineError::unexpected("package", x.kind()).into()),
            },
        }
    }

    /// Method value with its receiver bound. Value methods reached through
    /// a pointer receive a copy of the pointee.
    fn bind_method(&mut self, x: TypedValue, name: &str) -> Result<TypedValue, Fault> {
        let t = x.typ()?.clone();
        let method: Method = t.find_method(name).ok_or_else(|| {
            MachineError::malformed(format!("type {} has no method {}", t, name))
        })?;
        let receiver = match (&t, method.ptr_recv) {
            (Type::Pointer(_), false) => match &x.v {
                Value::Pointer(p) => self
                    .heap
                    .get(p.base)
                    .slot(p.index)
                    .cloned()
                    .ok_or_else(|| MachineError::malformed("dangling pointer"))?,
                _ => return Err(nil_deref()),
            },
            _ => x,
        };
        let receiver = self.heap.copy_value(&mut self.alloc, receiver)?;
        self.alloc.allocate_bound_method()?;
        Ok(TypedValue::with_value(
            method.typ.clone(),
            Value::BoundMethod(Rc::new(BoundMethodValue {
                func: method.func.clone(),
                receiver,
            })),
        ))
    }

    /// Operands above `x`: low, high, max, for the bounds present.
    pub(super) fn op_slice(&mut self, expr: ExprRef) -> Result<(), MachineError> {
        let Expr::Slice { low, high, max, .. } = &*expr else {
            return Err(MachineError::unexpected("slice expression", &*expr));
        };
        let max = if max.is_some() { Some(self.pop_value()?) } else { None };
        let high = if high.is_some() { Some(self.pop_value()?) } else { None };
        let low = if low.is_some() { Some(self.pop_value()?) } else { None };
        let x = self.pop_value()?;
        let res = self.slice_value(x, low, high, max);
        let v = try_panic!(self, res);
        self.push_value(v);
        Ok(())
    }

    fn slice_value(
        &mut self,
        x: TypedValue,
        low: Option<TypedValue>,
        high: Option<TypedValue>,
        max: Option<TypedValue>,
    ) -> Result<TypedValue, Fault> {
        let bound = |v: Option<TypedValue>, default: usize| -> Result<usize, Fault> {
            match v {
                None => Ok(default),
                Some(v) => v
                    .to_index()
                    .ok_or_else(|| Fault::Panic(format!("slice bounds out of range [{}]", v.to_bigint()))),
            }
        };
        let out_of_range = |l: usize, h: usize, cap: usize| {
            Fault::Panic(format!("slice bounds out of range [{}:{}] with capacity {}", l, h, cap))
        };

        if x.kind() == Kind::String {
            if max.is_some() {
                return Err(MachineError::malformed("3-index slice of a string").into());
            }
            let s = x.get_string();
            let l = bound(low, 0)?;
            let h = bound(high, s.len())?;
            if l > h || h > s.len() {
                return Err(out_of_range(l, h, s.len()));
            }
            let sub = String::from_utf8_lossy(&s.as_bytes()[l..h]).into_owned();
            self.alloc.allocate_string(sub.len())?;
            return Ok(TypedValue::from_string(x.typ()?.clone(), &sub));
        }

        let t = x.typ()?.clone();
        let (base, offset, len, cap, result_type) = match &x.v {
            Value::Slice(s) => (s.base, s.offset, s.length, s.maxcap, t),
            Value::None if t.kind() == Kind::Slice => {
                let l = bound(low, 0)?;
                let h = bound(high, 0)?;
                if l != 0 || h != 0 {
                    return Err(out_of_range(l, h, 0));
                }
                return Ok(x);
            }
            Value::Array(_) | Value::Pointer(_) => {
                let (base, _, len) = self.list_of(&x)?;
                let elem = match (&x.v, t.elem()) {
                    (Value::Pointer(_), Some(arr)) => arr.elem(),
                    (_, elem) => elem,
                }
                .ok_or_else(|| MachineError::unexpected("array type", &t))?;
                (base, 0, len, len, Type::slice(elem))
            }
            _ => return Err(MachineError::unexpected("sliceable value", x.kind()).into()),
        };
        let l = bound(low, 0)?;
        let h = bound(high, len)?;
        let m = bound(max, cap)?;
        if l > h || h > m || m > cap {
            return Err(out_of_range(l, h, cap));
        }
        self.alloc.allocate_slice()?;
        Ok(TypedValue::with_value(
            result_type,
            Value::Slice(SliceValue {
                base,
                offset: offset + l,
                length: h - l,
                maxcap: m - l,
            }),
        ))
    }

    /// `*x`: dereference, or a pointer type when `x` is a type.
    pub(super) fn op_star(&mut self) -> Result<(), MachineError> {
        let x = self.pop_value()?;
        match &x.v {
            Value::Type(t) => {
                self.push_value(TypedValue::type_value(Type::pointer(t.clone())));
            }
            Value::Pointer(p) => {
                let v = self
                    .heap
                    .get(p.base)
                    .slot(p.index)
                    .cloned()
                    .ok_or_else(|| MachineError::malformed("dangling pointer"))?;
                self.push_value(v);
            }
            Value::None => {
                self.trap::<()>(Err(nil_deref()))?;
            }
            _ => return Err(MachineError::unexpected("pointer", x.kind())),
        }
        Ok(())
    }

    pub(super) fn op_type_assert(&mut self, expr: ExprRef) -> Result<(), MachineError> {
        let Expr::TypeAssert { typ, has_ok, .. } = &*expr else {
            return Err(MachineError::unexpected("type assertion", &*expr));
        };
        let x = self.pop_value()?;
        let nil_subject = x.is_undefined() || (x.kind() == Kind::Interface && x.is_nil());
        let ok = !nil_subject
            && match &x.t {
                Some(xt) if typ.is_interface() => typ.is_implemented_by(xt),
                Some(xt) => xt == typ,
                None => false,
            };
        if ok {
            self.push_value(x);
        } else if *has_ok {
            let zero = self.heap.zero_value(&mut self.alloc, typ)?;
            self.push_value(zero);
        } else {
            let dynamic = match &x.t {
                Some(t) if !nil_subject => t.to_string(),
                _ => "nil".to_string(),
            };
            self.trap::<()>(Err(Fault::Panic(format!(
                "interface conversion: interface is {}, not {}",
                dynamic, typ
            ))))?;
            return Ok(());
        }
        if *has_ok {
            self.push_value(TypedValue::boolean(ok));
        }
        Ok(())
    }

    /// Keys (when present) and values of the elements are on the stack in
    /// source order.
    pub(super) fn op_composite_lit(&mut self, expr: ExprRef) -> Result<(), MachineError> {
        let Expr::CompositeLit { typ, elts } = &*expr else {
            return Err(MachineError::unexpected("composite literal", &*expr));
        };
        let n = elts.len() + elts.iter().filter(|kv| kv.key.is_some()).count();
        let mut popped = self.pop_values(n)?.into_iter();
        let mut pairs = Vec::with_capacity(elts.len());
        for kv in elts {
            let key = if kv.key.is_some() { popped.next() } else { None };
            let value = popped
                .next()
                .ok_or(MachineError::StackUnderflow("value"))?;
            pairs.push((key, value));
        }
        let res = self.build_composite(typ, pairs);
        let v = try_panic!(self, res);
        self.push_value(v);
        Ok(())
    }

    fn build_composite(
        &mut self,
        typ: &Type,
        pairs: Vec<(Option<TypedValue>, TypedValue)>,
    ) -> Result<TypedValue, Fault> {
        match typ.base() {
            Type::Array(at) => {
                // Charged up front so an oversized length is refused before the host allocates.
                self.alloc.allocate_array(at.len)?;
                let mut list = Vec::with_capacity(at.len);
                for _ in 0..at.len {
                    list.push(self.heap.zero_value(&mut self.alloc, &at.elem)?);
                }
                self.fill_list(&mut list, &at.elem, pairs)?;
                let r = self.heap.alloc(Object::Array(ArrayValue { list }));
                Ok(TypedValue::with_value(typ.clone(), Value::Array(r)))
            }
            Type::Slice(st) => {
                let mut len = 0;
                let mut next = 0;
                for (k, _) in &pairs {
                    if let Some(k) = k {
                        next = k
                            .to_index()
                            .ok_or_else(|| MachineError::malformed("slice literal index"))?;
                    }
                    next = next
                        .checked_add(1)
                        .ok_or_else(|| MachineError::malformed("slice literal index"))?;
                    len = len.max(next);
                }
                self.alloc.allocate_array(len)?;
                self.alloc.allocate_slice()?;
                let mut list = Vec::with_capacity(len);
                for _ in 0..len {
                    list.push(self.heap.zero_value(&mut self.alloc, &st.elem)?);
                }
                self.fill_list(&mut list, &st.elem, pairs)?;
                let base = self.heap.alloc(Object::Array(ArrayValue { list }));
                Ok(TypedValue::with_value(
                    typ.clone(),
                    Value::Slice(SliceValue {
                        base,
                        offset: 0,
                        length: len,
                        maxcap: len,
                    }),
                ))
            }
            Type::Map(mt) => {
                self.alloc.allocate_map(pairs.len())?;
                let mut map = MapValue::new();
                for (k, v) in pairs {
                    let k = k.ok_or_else(|| MachineError::malformed("map literal without key"))?;
                    let k = self.assignable(k, &mt.key)?;
                    let k = self.heap.copy_value(&mut self.alloc, k)?;
                    let v = self.assignable(v, &mt.value)?;
                    let v = self.heap.copy_value(&mut self.alloc, v)?;
                    let mk = k.map_key(&self.heap)?;
                    map.set(mk, k, v);
                }
                let r = self.heap.alloc(Object::Map(map));
                Ok(TypedValue::with_value(typ.clone(), Value::Map(r)))
            }
            Type::Struct(st) => {
                let mut fields = Vec::with_capacity(st.fields.len());
                for f in &st.fields {
                    fields.push(self.heap.zero_value(&mut self.alloc, &f.typ)?);
                }
                for (pos, (k, v)) in pairs.into_iter().enumerate() {
                    let i = match k {
                        Some(k) => k
                            .to_index()
                            .ok_or_else(|| MachineError::malformed("struct literal field key"))?,
                        None => pos,
                    };
                    let ft = st
                        .fields
                        .get(i)
                        .map(|f| f.typ.clone())
                        .ok_or_else(|| MachineError::malformed("struct literal field index"))?;
                    let v = self.assignable(v, &ft)?;
                    fields[i] = self.heap.copy_value(&mut self.alloc, v)?;
                }
                self.alloc.allocate_struct(fields.len())?;
                let r = self.heap.alloc(Object::Struct(StructValue { fields }));
                Ok(TypedValue::with_value(typ.clone(), Value::Struct(r)))
            }
            other => Err(MachineError::unexpected("composite type", &other).into()),
        }
    }

    fn fill_list(
        &mut self,
        list: &mut [TypedValue],
        elem: &Type,
        pairs: Vec<(Option<TypedValue>, TypedValue)>,
    ) -> Result<(), Fault> {
        let mut next = 0;
        for (k, v) in pairs {
            if let Some(k) = k {
                next = k
                    .to_index()
                    .ok_or_else(|| MachineError::malformed("literal index"))?;
            }
            let v = self.assignable(v, elem)?;
            let v = self.heap.copy_value(&mut self.alloc, v)?;
            let slot = list
                .get_mut(next)
                .ok_or_else(|| MachineError::malformed(format!("literal index {} out of bounds", next)))?;
            *slot = v;
            next += 1;
        }
        Ok(())
    }
}
