//! Deterministic object images.
//!
//! An image replaces every child object by a `{id, hash}` reference so a
//! parent's hash commits to its children's hashes. Escaped children and
//! package blocks are referenced with a zero hash; they are persisted on
//! their own and reached by id.

use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use crate::virtual_machine::ast::{FuncSource, Location};
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::heap::Heap;
use crate::virtual_machine::ownership::{InfoImage, ObjectId};
use crate::virtual_machine::type_system::{Kind, Name, Type, TypeId};
use crate::virtual_machine::values::{
    ArrayValue, Block, BlockSource, BoundMethodValue, FuncBody, FuncValue, MapValue, ObjRef,
    Object, PackageValue, PointerValue, SliceValue, StructValue, TypedValue, Value,
};
use gnovm_derive::BinaryCodec;
use num_bigint::BigInt;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct RefImage {
    pub id: ObjectId,
    pub hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub enum FuncImage {
    Source {
        loc: Location,
        closure: Option<RefImage>,
    },
    Native {
        pkg_path: Name,
        name: Name,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub enum PayloadImage {
    None,
    Scalar([u8; 8]),
    String(Name),
    Bigint(BigInt),
    Ref(RefImage),
    Pointer {
        base: RefImage,
        index: u64,
    },
    Slice {
        base: RefImage,
        offset: u64,
        length: u64,
        maxcap: u64,
    },
    Func(FuncImage),
    BoundMethod {
        func: FuncImage,
        receiver: Box<ValueImage>,
    },
    Type(TypeId),
    Package(Name),
}

#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub enum ValueImage {
    Undefined,
    Typed { t: TypeId, v: PayloadImage },
}

#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct MapItemImage {
    pub key: ValueImage,
    pub value: ValueImage,
}

#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub enum ObjectImage {
    Array {
        list: Vec<ValueImage>,
    },
    Struct {
        fields: Vec<ValueImage>,
    },
    Map {
        items: Vec<MapItemImage>,
    },
    Block {
        source: BlockSource,
        values: Vec<ValueImage>,
        statics: Vec<Option<TypeId>>,
        parent: Option<RefImage>,
    },
    HeapItem {
        value: ValueImage,
    },
}

/// Content hash of one object: a merkle node over its info and value images.
pub fn object_hash(info: &InfoImage, image: &ObjectImage) -> Hash {
    Hash::inner(&Hash::leaf(&info.to_bytes()), &Hash::leaf(&image.to_bytes()))
}

/// Builds images from live heap objects and collects every type they name.
pub struct ImageWriter<'h> {
    heap: &'h Heap,
    types: BTreeMap<TypeId, Type>,
}

impl<'h> ImageWriter<'h> {
    pub fn new(heap: &'h Heap) -> Self {
        ImageWriter {
            heap,
            types: BTreeMap::new(),
        }
    }

    /// Types met so far, in id order.
    pub fn into_types(self) -> Vec<Type> {
        self.types.into_values().collect()
    }

    pub fn object(&mut self, r: ObjRef) -> Result<ObjectImage, MachineError> {
        let heap = self.heap;
        let image = match heap.get(r) {
            Object::Array(a) => ObjectImage::Array {
                list: self.values(&a.list)?,
            },
            Object::Struct(s) => ObjectImage::Struct {
                fields: self.values(&s.fields)?,
            },
            Object::Map(m) => {
                let mut items = Vec::with_capacity(m.len());
                for (k, v) in m.iter() {
                    items.push(MapItemImage {
                        key: self.value(k)?,
                        value: self.value(v)?,
                    });
                }
                ObjectImage::Map { items }
            }
            Object::Block(b) => ObjectImage::Block {
                source: b.source.clone(),
                values: self.values(&b.values)?,
                statics: b
                    .statics
                    .iter()
                    .map(|t| t.as_ref().map(|t| self.record_type(t)).transpose())
                    .collect::<Result<_, _>>()?,
                // the universe is rebuilt by every machine, never persisted
                parent: b
                    .parent
                    .filter(|p| !heap.is_universe_block(*p))
                    .map(|p| self.reference(p))
                    .transpose()?,
            },
            Object::HeapItem(tv) => ObjectImage::HeapItem {
                value: self.value(tv)?,
            },
        };
        Ok(image)
    }

    fn values(&mut self, list: &[TypedValue]) -> Result<Vec<ValueImage>, MachineError> {
        list.iter().map(|tv| self.value(tv)).collect()
    }

    pub fn value(&mut self, tv: &TypedValue) -> Result<ValueImage, MachineError> {
        let Some(t) = &tv.t else {
            return Ok(ValueImage::Undefined);
        };
        let tid = self.record_type(t)?;
        let kind = t.kind();
        let payload = match &tv.v {
            Value::None if kind == Kind::Bool || kind.is_integer() => PayloadImage::Scalar(tv.n),
            Value::None => PayloadImage::None,
            Value::String(s) => PayloadImage::String(s.clone()),
            Value::Bigint(b) => PayloadImage::Bigint(BigInt::clone(b)),
            Value::Array(r) | Value::Struct(r) | Value::Map(r) | Value::Block(r) => {
                PayloadImage::Ref(self.reference(*r)?)
            }
            Value::Pointer(p) => PayloadImage::Pointer {
                base: self.reference(p.base)?,
                index: p.index as u64,
            },
            Value::Slice(s) => PayloadImage::Slice {
                base: self.reference(s.base)?,
                offset: s.offset as u64,
                length: s.length as u64,
                maxcap: s.maxcap as u64,
            },
            Value::Func(f) => PayloadImage::Func(self.func(f)?),
            Value::BoundMethod(bm) => PayloadImage::BoundMethod {
                func: self.func(&bm.func)?,
                receiver: Box::new(self.value(&bm.receiver)?),
            },
            Value::Type(inner) => PayloadImage::Type(self.record_type(inner)?),
            Value::Package(pv) => PayloadImage::Package(pv.path.clone()),
            Value::Native(_) => {
                return Err(MachineError::UnsupportedKind(format!(
                    "cannot persist native value of type {}",
                    t
                )));
            }
        };
        Ok(ValueImage::Typed { t: tid, v: payload })
    }

    fn func(&mut self, f: &FuncValue) -> Result<FuncImage, MachineError> {
        Ok(match &f.body {
            FuncBody::Source(source) => FuncImage::Source {
                loc: source.loc.clone(),
                closure: f.closure.map(|c| self.reference(c)).transpose()?,
            },
            FuncBody::Native(_) => FuncImage::Native {
                pkg_path: f.pkg_path.clone(),
                name: f.name.clone(),
            },
        })
    }

    fn reference(&self, r: ObjRef) -> Result<RefImage, MachineError> {
        let info = self.heap.info(r);
        let id = info.id.ok_or_else(|| {
            MachineError::malformed(format!(
                "reference to unpersisted {}",
                self.heap.get(r).kind_name()
            ))
        })?;
        let hash = if info.is_escaped || info.is_new_escaped || self.heap.is_package_block(r) {
            Hash::zero()
        } else {
            info.hash
        };
        Ok(RefImage { id, hash })
    }

    /// Records `t` and every type its image refers to by id.
    fn record_type(&mut self, t: &Type) -> Result<TypeId, MachineError> {
        let id = t.type_id()?;
        if self.types.contains_key(&id) {
            return Ok(id);
        }
        self.types.insert(id, t.clone());
        match t {
            Type::Pointer(p) => {
                self.record_type(&p.elem)?;
            }
            Type::Array(a) => {
                self.record_type(&a.elem)?;
            }
            Type::Slice(s) => {
                self.record_type(&s.elem)?;
            }
            Type::Chan(c) => {
                self.record_type(&c.elem)?;
            }
            Type::Map(m) => {
                self.record_type(&m.key)?;
                self.record_type(&m.value)?;
            }
            Type::Struct(s) => {
                for f in &s.fields {
                    self.record_type(&f.typ)?;
                }
            }
            Type::Func(f) => {
                for p in f.params.iter().chain(f.results.iter()) {
                    self.record_type(&p.typ)?;
                }
            }
            Type::Interface(i) => {
                for m in &i.methods {
                    self.record_type(&m.typ)?;
                }
            }
            Type::Tuple(tt) => {
                for e in &tt.elems {
                    self.record_type(e)?;
                }
            }
            Type::Declared(dt) => {
                if let Some(base) = dt.base() {
                    self.record_type(base)?;
                }
            }
            Type::Primitive(_) | Type::Native(_) | Type::Package | Type::TypeType | Type::Block => {}
        }
        Ok(id)
    }
}

/// Everything image decoding needs from the loading side.
pub trait ImageResolver {
    fn heap(&self) -> &Heap;
    fn resolve_object(&mut self, id: ObjectId) -> Result<ObjRef, MachineError>;
    fn resolve_type(&mut self, id: TypeId) -> Result<Type, MachineError>;
    fn resolve_source(&mut self, loc: &Location) -> Result<Rc<FuncSource>, MachineError>;
    fn resolve_native(&mut self, pkg_path: &str, name: &str)
    -> Result<Rc<FuncValue>, MachineError>;
    fn resolve_package(&mut self, path: &str) -> Result<Rc<PackageValue>, MachineError>;
}

pub fn decode_object(
    image: ObjectImage,
    r: &mut dyn ImageResolver,
) -> Result<Object, MachineError> {
    Ok(match image {
        ObjectImage::Array { list } => Object::Array(ArrayValue {
            list: decode_values(list, r)?,
        }),
        ObjectImage::Struct { fields } => Object::Struct(StructValue {
            fields: decode_values(fields, r)?,
        }),
        ObjectImage::Map { items } => {
            let mut map = MapValue::new();
            for item in items {
                let key = decode_value(item.key, r)?;
                let value = decode_value(item.value, r)?;
                let mk = key.map_key(r.heap())?;
                map.set(mk, key, value);
            }
            Object::Map(map)
        }
        ObjectImage::Block {
            source,
            values,
            statics,
            parent,
        } => {
            let parent = parent.map(|p| r.resolve_object(p.id)).transpose()?;
            let values = decode_values(values, r)?;
            let mut block = Block::new(source, 0, parent);
            block.values = values;
            block.statics = statics
                .into_iter()
                .map(|id| id.map(|id| r.resolve_type(id)).transpose())
                .collect::<Result<_, _>>()?;
            Object::Block(block)
        }
        ObjectImage::HeapItem { value } => Object::HeapItem(decode_value(value, r)?),
    })
}

fn decode_values(
    list: Vec<ValueImage>,
    r: &mut dyn ImageResolver,
) -> Result<Vec<TypedValue>, MachineError> {
    list.into_iter().map(|v| decode_value(v, r)).collect()
}

pub fn decode_value(
    image: ValueImage,
    r: &mut dyn ImageResolver,
) -> Result<TypedValue, MachineError> {
    let (tid, payload) = match image {
        ValueImage::Undefined => return Ok(TypedValue::undefined()),
        ValueImage::Typed { t, v } => (t, v),
    };
    let t = r.resolve_type(tid)?;
    let mut tv = TypedValue::nil(t.clone());
    tv.v = match payload {
        PayloadImage::None => Value::None,
        PayloadImage::Scalar(n) => {
            tv.n = n;
            Value::None
        }
        PayloadImage::String(s) => Value::String(s),
        PayloadImage::Bigint(b) => Value::Bigint(Rc::new(b)),
        PayloadImage::Ref(ri) => {
            let obj = r.resolve_object(ri.id)?;
            match t.kind() {
                Kind::Array => Value::Array(obj),
                Kind::Struct => Value::Struct(obj),
                Kind::Map => Value::Map(obj),
                Kind::Block => Value::Block(obj),
                kind => {
                    return Err(MachineError::malformed(format!(
                        "object reference under kind {:?}",
                        kind
                    )));
                }
            }
        }
        PayloadImage::Pointer { base, index } => Value::Pointer(PointerValue {
            base: r.resolve_object(base.id)?,
            index: to_usize(index)?,
        }),
        PayloadImage::Slice {
            base,
            offset,
            length,
            maxcap,
        } => Value::Slice(SliceValue {
            base: r.resolve_object(base.id)?,
            offset: to_usize(offset)?,
            length: to_usize(length)?,
            maxcap: to_usize(maxcap)?,
        }),
        PayloadImage::Func(fi) => Value::Func(decode_func(fi, r)?),
        PayloadImage::BoundMethod { func, receiver } => {
            let func = decode_func(func, r)?;
            let receiver = decode_value(*receiver, r)?;
            Value::BoundMethod(Rc::new(BoundMethodValue { func, receiver }))
        }
        PayloadImage::Type(id) => Value::Type(r.resolve_type(id)?),
        PayloadImage::Package(path) => Value::Package(r.resolve_package(&path)?),
    };
    Ok(tv)
}

fn decode_func(image: FuncImage, r: &mut dyn ImageResolver) -> Result<Rc<FuncValue>, MachineError> {
    match image {
        FuncImage::Source { loc, closure } => {
            let source = r.resolve_source(&loc)?;
            let closure = closure.map(|c| r.resolve_object(c.id)).transpose()?;
            Ok(Rc::new(FuncValue::from_source(source, closure)))
        }
        FuncImage::Native { pkg_path, name } => r.resolve_native(&pkg_path, &name),
    }
}

fn to_usize(v: u64) -> Result<usize, MachineError> {
    usize::try_from(v).map_err(|_| MachineError::malformed("index overflows usize"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::Decode;
    use crate::virtual_machine::ownership::PkgId;

    fn real(heap: &mut Heap, r: ObjRef, time: u64) {
        let info = heap.info_mut(r);
        info.id = Some(ObjectId {
            pkg: PkgId::from_path("gno.land/r/test"),
            time,
        });
        info.hash = Hash::digest(&time.to_le_bytes());
    }

    #[test]
    fn child_references_carry_hashes() {
        let mut heap = Heap::new();
        let arr = heap.alloc(Object::Array(ArrayValue {
            list: vec![TypedValue::int(1), TypedValue::int(2)],
        }));
        real(&mut heap, arr, 2);
        let at = Type::array(2, Type::INT);
        let s = heap.alloc(Object::Struct(StructValue {
            fields: vec![TypedValue::with_value(at, Value::Array(arr))],
        }));
        real(&mut heap, s, 3);

        let mut w = ImageWriter::new(&heap);
        let image = w.object(s).unwrap();
        let ObjectImage::Struct { fields } = &image else {
            panic!("expected struct image");
        };
        let ValueImage::Typed {
            v: PayloadImage::Ref(ri),
            ..
        } = &fields[0]
        else {
            panic!("expected ref payload");
        };
        assert_eq!(ri.id.time, 2);
        assert_eq!(ri.hash, heap.info(arr).hash);
        let types = w.into_types();
        assert!(types.contains(&Type::INT));

        let bytes = image.to_bytes();
        assert_eq!(ObjectImage::from_bytes(&bytes).unwrap(), image);
    }

    #[test]
    fn escaped_children_are_referenced_without_hash() {
        let mut heap = Heap::new();
        let item = heap.alloc(Object::HeapItem(TypedValue::int(7)));
        real(&mut heap, item, 2);
        heap.info_mut(item).is_escaped = true;
        let holder = heap.alloc(Object::HeapItem(TypedValue::with_value(
            Type::pointer(Type::INT),
            Value::Pointer(PointerValue {
                base: item,
                index: 0,
            }),
        )));
        real(&mut heap, holder, 3);
        let image = ImageWriter::new(&heap).object(holder).unwrap();
        let ObjectImage::HeapItem {
            value:
                ValueImage::Typed {
                    v: PayloadImage::Pointer { base, .. },
                    ..
                },
        } = image
        else {
            panic!("expected pointer payload");
        };
        assert!(base.hash.is_zero());
    }

    #[test]
    fn unpersisted_children_are_rejected() {
        let mut heap = Heap::new();
        let arr = heap.alloc(Object::Array(ArrayValue::default()));
        let holder = heap.alloc(Object::HeapItem(TypedValue::with_value(
            Type::array(0, Type::INT),
            Value::Array(arr),
        )));
        assert!(matches!(
            ImageWriter::new(&heap).object(holder),
            Err(MachineError::MalformedNode(_))
        ));
    }

    #[test]
    fn hash_depends_on_info_and_content() {
        let info = InfoImage {
            id: ObjectId::default(),
            owner: None,
            ref_count: 1,
            mod_time: 0,
            is_escaped: false,
        };
        let a = ObjectImage::HeapItem {
            value: ValueImage::Undefined,
        };
        let b = ObjectImage::Array { list: vec![] };
        assert_ne!(object_hash(&info, &a), object_hash(&info, &b));
        let info2 = InfoImage {
            ref_count: 2,
            ..info.clone()
        };
        assert_ne!(object_hash(&info, &a), object_hash(&info2, &a));
    }
}
