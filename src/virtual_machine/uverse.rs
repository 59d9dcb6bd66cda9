//! Predeclared identifiers: the universe block every package block hangs off.
//!
//! The universe is built once per thread and copied into each Machine's heap
//! as the root block. Front-ends resolve predeclared names through
//! [`Universe::index_of`].

use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::heap::Heap;
use crate::virtual_machine::machine::{Fault, Machine};
use crate::virtual_machine::type_system::{FieldType, Kind, Name, PrimitiveType, Type};
use crate::virtual_machine::values::{
    ArrayValue, FuncValue, MapValue, Object, PointerValue, SliceValue, TypedValue, Value,
};
use std::rc::Rc;

/// Package path carried by builtin function values.
pub const UVERSE_PATH: &str = ".uverse";

type Builtin = fn(&mut Machine<'_>) -> Result<(), Fault>;

pub struct Universe {
    names: Vec<Name>,
    values: Vec<TypedValue>,
    error_type: Type,
}

thread_local! {
    static UNIVERSE: Rc<Universe> = Rc::new(Universe::build());
}

/// Shared universe of the current thread.
pub fn universe() -> Rc<Universe> {
    UNIVERSE.with(Rc::clone)
}

impl Universe {
    fn build() -> Self {
        let any = Type::interface("", vec![]);
        let error_type = Type::declared(
            "",
            "error",
            Type::interface(
                "",
                vec![FieldType::new(
                    "Error",
                    Type::func(vec![], vec![FieldType::new("", Type::STRING)], false),
                )],
            ),
        );
        let mut u = Universe {
            names: Vec::new(),
            values: Vec::new(),
            error_type: error_type.clone(),
        };

        for p in [
            PrimitiveType::Bool,
            PrimitiveType::String,
            PrimitiveType::Int,
            PrimitiveType::Int8,
            PrimitiveType::Int16,
            PrimitiveType::Int32,
            PrimitiveType::Int64,
            PrimitiveType::Uint,
            PrimitiveType::Uint8,
            PrimitiveType::Uint16,
            PrimitiveType::Uint32,
            PrimitiveType::Uint64,
            PrimitiveType::Bigint,
        ] {
            u.define(p.name(), TypedValue::type_value(Type::Primitive(p)));
        }
        u.define("rune", TypedValue::type_value(Type::INT32));
        u.define("byte", TypedValue::type_value(Type::UINT8));
        u.define("error", TypedValue::type_value(error_type));
        u.define("true", TypedValue::from_bool(Type::UNTYPED_BOOL, true));
        u.define("false", TypedValue::from_bool(Type::UNTYPED_BOOL, false));
        u.define("nil", TypedValue::undefined());

        let int = || FieldType::new("", Type::INT);
        let p = |t: &Type| FieldType::new("", t.clone());
        let rest = FieldType::new("", Type::variadic(any.clone()));
        let table: [(&str, Vec<FieldType>, Vec<FieldType>, bool, Builtin); 11] = [
            ("append", vec![p(&any), rest.clone()], vec![p(&any)], true, builtin_append),
            ("cap", vec![p(&any)], vec![int()], false, builtin_cap),
            ("copy", vec![p(&any), p(&any)], vec![int()], false, builtin_copy),
            ("delete", vec![p(&any), p(&any)], vec![], false, builtin_delete),
            ("len", vec![p(&any)], vec![int()], false, builtin_len),
            ("make", vec![p(&any), rest.clone()], vec![p(&any)], true, builtin_make),
            ("new", vec![p(&any)], vec![p(&any)], false, builtin_new),
            ("panic", vec![p(&any)], vec![], false, builtin_panic),
            ("print", vec![rest.clone()], vec![], true, builtin_print),
            ("println", vec![rest], vec![], true, builtin_println),
            ("recover", vec![], vec![p(&any)], false, builtin_recover),
        ];
        for (name, params, results, variadic, f) in table {
            let typ = Type::func(params, results, variadic);
            let func = FuncValue::native(
                name,
                typ.clone(),
                UVERSE_PATH,
                Rc::new(move |m: &mut Machine<'_>| {
                    let res = f(m);
                    m.trap(res).map(|_| ())
                }),
            );
            u.define(name, TypedValue::with_value(typ, Value::Func(Rc::new(func))));
        }
        u
    }

    fn define(&mut self, name: &str, tv: TypedValue) {
        self.names.push(Rc::from(name));
        self.values.push(tv);
    }

    /// Slot of a predeclared name in the universe block.
    pub fn index_of(&self, name: &str) -> Option<u16> {
        self.names
            .iter()
            .position(|n| &**n == name)
            .map(|i| i as u16)
    }

    pub fn names(&self) -> &[Name] {
        &self.names
    }

    pub fn values(&self) -> &[TypedValue] {
        &self.values
    }

    pub fn error_type(&self) -> &Type {
        &self.error_type
    }

    /// Types named by the universe, for seeding a type cache.
    pub fn types(&self) -> impl Iterator<Item = &Type> {
        self.values.iter().filter_map(|tv| tv.as_type())
    }

    pub fn builtin(&self, name: &str) -> Option<Rc<FuncValue>> {
        let i = self.index_of(name)?;
        self.values[i as usize].get_func().cloned()
    }
}

/// Elements of a slice, array or pointer to array, in order.
fn elements(heap: &Heap, tv: &TypedValue) -> Vec<TypedValue> {
    match &tv.v {
        Value::Slice(s) => {
            let list = heap.array_list(s.base);
            let end = (s.offset + s.length).min(list.len());
            list[s.offset.min(end)..end].to_vec()
        }
        Value::Array(r) => heap.array_list(*r).to_vec(),
        _ => Vec::new(),
    }
}

fn length_of(heap: &Heap, tv: &TypedValue, with_cap: bool) -> Result<usize, Fault> {
    Ok(match (&tv.v, tv.kind()) {
        (Value::String(s), _) if !with_cap => s.len(),
        (Value::None, Kind::String) if !with_cap => 0,
        (Value::Array(r), _) => heap.array_list(*r).len(),
        (Value::Slice(s), _) => {
            if with_cap {
                s.maxcap
            } else {
                s.length
            }
        }
        (Value::Map(r), _) if !with_cap => heap.map(*r).map_or(0, |m| m.len()),
        (Value::Pointer(p), Kind::Pointer) => match heap.get(p.base).slot(p.index) {
            Some(TypedValue {
                v: Value::Array(r), ..
            }) => heap.array_list(*r).len(),
            _ => return Err(Fault::Panic("invalid memory address or nil pointer dereference".into())),
        },
        (Value::None, Kind::Slice | Kind::Map) => 0,
        (_, kind) => {
            return Err(Fault::Fatal(MachineError::UnsupportedKind(format!(
                "{} of {:?}",
                if with_cap { "cap" } else { "len" },
                kind
            ))));
        }
    })
}

fn builtin_len(m: &mut Machine<'_>) -> Result<(), Fault> {
    let args = m.native_args()?;
    let [x] = args.as_slice() else {
        return Err(Fault::arity("len"));
    };
    let n = length_of(&m.heap, x, false)?;
    m.push_value(TypedValue::int(n as i64));
    Ok(())
}

fn builtin_cap(m: &mut Machine<'_>) -> Result<(), Fault> {
    let args = m.native_args()?;
    let [x] = args.as_slice() else {
        return Err(Fault::arity("cap"));
    };
    let n = length_of(&m.heap, x, true)?;
    m.push_value(TypedValue::int(n as i64));
    Ok(())
}

fn builtin_append(m: &mut Machine<'_>) -> Result<(), Fault> {
    let args = m.native_args()?;
    let [s, xs] = args.as_slice() else {
        return Err(Fault::arity("append"));
    };
    let st = s.typ()?.clone();
    let elem = match (st.kind(), st.elem()) {
        (Kind::Slice, Some(elem)) => elem,
        _ => return Err(Fault::Fatal(MachineError::unexpected("slice", &st))),
    };
    let items = match &xs.v {
        Value::String(bytes) => bytes
            .bytes()
            .map(|b| TypedValue::from_uint(Type::UINT8, b as u64))
            .collect(),
        _ => elements(&m.heap, xs),
    };
    if items.is_empty() {
        m.push_value(s.clone());
        return Ok(());
    }
    let mut converted = Vec::with_capacity(items.len());
    for item in items {
        converted.push(m.assignable(item, &elem)?);
    }

    let (base, offset, length, maxcap) = match &s.v {
        Value::Slice(sv) => (Some(sv.base), sv.offset, sv.length, sv.maxcap),
        _ => (None, 0, 0, 0),
    };
    let new_len = length + converted.len();
    m.alloc.allocate_slice()?;
    if let Some(base) = base.filter(|_| new_len <= maxcap) {
        for (i, item) in converted.into_iter().enumerate() {
            m.set_slot(base, offset + length + i, item)?;
        }
        let sv = SliceValue {
            base,
            offset,
            length: new_len,
            maxcap,
        };
        m.push_value(TypedValue::with_value(st, Value::Slice(sv)));
        return Ok(());
    }

    let new_cap = new_len.max(maxcap * 2);
    m.alloc.allocate_array(new_cap)?;
    let mut list = Vec::with_capacity(new_cap);
    let old = match base {
        Some(base) => m
            .heap
            .array_list(base)
            .get(offset..offset + length)
            .map(<[TypedValue]>::to_vec)
            .unwrap_or_default(),
        None => Vec::new(),
    };
    for tv in old.into_iter().chain(converted) {
        list.push(m.heap.copy_value(&mut m.alloc, tv)?);
    }
    while list.len() < new_cap {
        list.push(m.heap.zero_value(&mut m.alloc, &elem)?);
    }
    let r = m.heap.alloc(Object::Array(ArrayValue { list }));
    let sv = SliceValue {
        base: r,
        offset: 0,
        length: new_len,
        maxcap: new_cap,
    };
    m.push_value(TypedValue::with_value(st, Value::Slice(sv)));
    Ok(())
}

fn builtin_copy(m: &mut Machine<'_>) -> Result<(), Fault> {
    let args = m.native_args()?;
    let [dst, src] = args.as_slice() else {
        return Err(Fault::arity("copy"));
    };
    let items: Vec<TypedValue> = match &src.v {
        Value::String(bytes) => bytes
            .bytes()
            .map(|b| TypedValue::from_uint(Type::UINT8, b as u64))
            .collect(),
        _ => elements(&m.heap, src),
    };
    let n = match &dst.v {
        Value::Slice(sv) => {
            let n = sv.length.min(items.len());
            for (i, item) in items.into_iter().take(n).enumerate() {
                m.set_slot(sv.base, sv.offset + i, item)?;
            }
            n
        }
        _ => 0,
    };
    m.push_value(TypedValue::int(n as i64));
    Ok(())
}

fn builtin_delete(m: &mut Machine<'_>) -> Result<(), Fault> {
    let args = m.native_args()?;
    let [map, key] = args.as_slice() else {
        return Err(Fault::arity("delete"));
    };
    let Value::Map(r) = map.v else {
        return Ok(());
    };
    let key_type = match map.typ()?.base() {
        Type::Map(mt) => mt.key.clone(),
        other => return Err(Fault::Fatal(MachineError::unexpected("map", &other))),
    };
    let key = m.assignable(key.clone(), &key_type)?;
    m.delete_map_entry(r, &key)?;
    Ok(())
}

fn builtin_make(m: &mut Machine<'_>) -> Result<(), Fault> {
    let args = m.native_args()?;
    let [t, rest] = args.as_slice() else {
        return Err(Fault::arity("make"));
    };
    let t = t
        .as_type()
        .cloned()
        .ok_or_else(|| MachineError::unexpected("type", &t.t))?;
    let sizes = elements(&m.heap, rest);
    let size = |i: usize| -> Result<Option<usize>, Fault> {
        match sizes.get(i) {
            None => Ok(None),
            Some(tv) => tv
                .to_index()
                .map(Some)
                .ok_or_else(|| Fault::Panic(format!("makeslice: size {} out of range", tv.sprint(&m.heap)))),
        }
    };
    let value = match t.base() {
        Type::Slice(st) => {
            let len = size(0)?.unwrap_or(0);
            let cap = size(1)?.unwrap_or(len);
            if cap < len {
                return Err(Fault::Panic("makeslice: cap out of range".into()));
            }
            m.alloc.allocate_array(cap)?;
            m.alloc.allocate_slice()?;
            let mut list = Vec::with_capacity(cap);
            for _ in 0..cap {
                list.push(m.heap.zero_value(&mut m.alloc, &st.elem)?);
            }
            let r = m.heap.alloc(Object::Array(ArrayValue { list }));
            let sv = SliceValue {
                base: r,
                offset: 0,
                length: len,
                maxcap: cap,
            };
            TypedValue::with_value(t, Value::Slice(sv))
        }
        Type::Map(_) => {
            let hint = size(0)?.unwrap_or(0);
            m.alloc.allocate_map(hint)?;
            let r = m.heap.alloc(Object::Map(MapValue::new()));
            TypedValue::with_value(t, Value::Map(r))
        }
        other => {
            return Err(Fault::Fatal(MachineError::UnsupportedKind(format!(
                "make of {}",
                other
            ))));
        }
    };
    m.push_value(value);
    Ok(())
}

fn builtin_new(m: &mut Machine<'_>) -> Result<(), Fault> {
    let args = m.native_args()?;
    let [t] = args.as_slice() else {
        return Err(Fault::arity("new"));
    };
    let t = t
        .as_type()
        .cloned()
        .ok_or_else(|| MachineError::unexpected("type", &t.t))?;
    let zero = m.heap.zero_value(&mut m.alloc, &t)?;
    m.alloc.allocate_heap_item()?;
    let item = m.heap.alloc(Object::HeapItem(zero));
    let ptr = PointerValue {
        base: item,
        index: 0,
    };
    m.push_value(TypedValue::with_value(Type::pointer(t), Value::Pointer(ptr)));
    Ok(())
}

fn builtin_panic(m: &mut Machine<'_>) -> Result<(), Fault> {
    let args = m.native_args()?;
    let [x] = args.as_slice() else {
        return Err(Fault::arity("panic"));
    };
    m.panic_value(x.clone())?;
    Ok(())
}

fn print_args(m: &mut Machine<'_>, sep: &str, end: &str) -> Result<(), Fault> {
    let args = m.native_args()?;
    let [xs] = args.as_slice() else {
        return Err(Fault::arity("print"));
    };
    let parts: Vec<String> = elements(&m.heap, xs)
        .iter()
        .map(|tv| tv.sprint(&m.heap))
        .collect();
    let mut line = parts.join(sep);
    line.push_str(end);
    m.write_output(&line);
    Ok(())
}

fn builtin_print(m: &mut Machine<'_>) -> Result<(), Fault> {
    print_args(m, "", "")
}

fn builtin_println(m: &mut Machine<'_>) -> Result<(), Fault> {
    print_args(m, " ", "\n")
}

fn builtin_recover(m: &mut Machine<'_>) -> Result<(), Fault> {
    let recovered = m.recover();
    m.push_value(recovered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predeclared_names_resolve() {
        let u = universe();
        assert_eq!(u.index_of("bool"), Some(0));
        assert!(u.index_of("len").is_some());
        assert!(u.index_of("float64").is_none());
        let i = u.index_of("byte").unwrap() as usize;
        assert_eq!(u.values()[i].as_type(), Some(&Type::UINT8));
        let nil = u.index_of("nil").unwrap() as usize;
        assert!(u.values()[nil].is_undefined());
    }

    #[test]
    fn builtins_are_native_functions() {
        let u = universe();
        for name in ["append", "cap", "copy", "delete", "len", "make", "new", "panic", "print", "println", "recover"] {
            let f = u.builtin(name).unwrap();
            assert_eq!(&*f.pkg_path, UVERSE_PATH);
            assert!(f.source().is_none());
        }
        assert!(u.builtin("true").is_none());
    }

    #[test]
    fn error_is_an_interface_with_one_method() {
        let u = universe();
        let err = u.error_type();
        assert!(err.is_interface());
        assert!(err.is_declared());
        assert!(u.types().any(|t| t == err));
        // one universe per thread
        assert!(Rc::ptr_eq(&u, &universe()));
    }
}
