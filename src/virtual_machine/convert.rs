//! Value conversions between types.
//!
//! [`convert_to`] implements explicit conversions `T(x)` between typed
//! values; integer narrowing wraps. [`convert_untyped`] gives an untyped
//! constant its final type and rejects values the target cannot hold.

use crate::virtual_machine::alloc::Allocator;
use crate::virtual_machine::errors::ConvertError;
use crate::virtual_machine::heap::Heap;
use crate::virtual_machine::type_system::{Kind, PrimitiveType, Type};
use crate::virtual_machine::values::{ArrayValue, Object, SliceValue, TypedValue, Value};
use num_bigint::BigInt;
use num_traits::ToPrimitive;

/// Host numeric types with no counterpart in the value model.
const UNSUPPORTED_NATIVE: [&str; 4] = ["float32", "float64", "complex64", "complex128"];

fn reject_unsupported(t: &Type) -> Result<(), ConvertError> {
    if let Type::Native(nt) = t.base() {
        if UNSUPPORTED_NATIVE.contains(&&*nt.name) {
            return Err(ConvertError::Unsupported(nt.name.to_string()));
        }
    }
    Ok(())
}

/// Converts a typed value to `t`.
pub fn convert_to(
    heap: &mut Heap,
    alloc: &mut Allocator,
    mut tv: TypedValue,
    t: &Type,
) -> Result<TypedValue, ConvertError> {
    reject_unsupported(t)?;
    if t.is_interface() {
        return Ok(tv);
    }
    let Some(src) = tv.t.clone() else {
        return Ok(TypedValue::nil(t.clone()));
    };
    if src.is_untyped() {
        return convert_untyped(heap, alloc, tv, Some(t));
    }
    let (from, to) = (src.kind(), t.kind());
    if from == to {
        tv.t = Some(t.clone());
        return Ok(tv);
    }
    match (from, to) {
        (f, k) if f.is_integer() && k.is_integer() => {
            let bits = if f.is_signed_int() {
                tv.get_int() as u64
            } else {
                tv.get_uint()
            };
            Ok(TypedValue::from_uint(t.clone(), bits))
        }
        (f, Kind::Bigint) if f.is_integer() => Ok(TypedValue::from_bigint(t.clone(), tv.to_bigint())),
        (Kind::Bigint, k) if k.is_integer() => {
            Ok(TypedValue::from_uint(t.clone(), wrap_bigint(&tv.get_bigint())))
        }
        (f, Kind::String) if f.is_integer() => {
            let c = if f.is_signed_int() {
                u32::try_from(tv.get_int()).ok()
            } else {
                u32::try_from(tv.get_uint()).ok()
            }
            .and_then(char::from_u32)
            .unwrap_or(char::REPLACEMENT_CHARACTER);
            alloc.allocate_string(c.len_utf8())?;
            Ok(TypedValue::from_string(t.clone(), c.encode_utf8(&mut [0; 4])))
        }
        (Kind::String, Kind::Slice) => string_to_slice(heap, alloc, tv.get_string(), t),
        (Kind::Slice, Kind::String) => slice_to_string(heap, alloc, &tv, &src, t),
        _ => Err(ConvertError::invalid(&src, t)),
    }
}

/// Low 64 bits in two's complement.
fn wrap_bigint(b: &BigInt) -> u64 {
    if let Some(v) = b.to_i64() {
        return v as u64;
    }
    let mask = BigInt::from(u64::MAX);
    (b & mask).to_u64().unwrap_or(0)
}

fn string_to_slice(
    heap: &mut Heap,
    alloc: &mut Allocator,
    s: &str,
    t: &Type,
) -> Result<TypedValue, ConvertError> {
    let elem = t
        .elem()
        .ok_or_else(|| ConvertError::invalid("string", t))?;
    let list: Vec<TypedValue> = match elem.kind() {
        Kind::Uint8 => s
            .bytes()
            .map(|b| TypedValue::from_uint(elem.clone(), b as u64))
            .collect(),
        Kind::Int32 => s
            .chars()
            .map(|c| TypedValue::from_int(elem.clone(), c as i64))
            .collect(),
        _ => return Err(ConvertError::invalid("string", t)),
    };
    alloc.allocate_array(list.len())?;
    alloc.allocate_slice()?;
    let len = list.len();
    let base = heap.alloc(Object::Array(ArrayValue { list }));
    Ok(TypedValue::with_value(
        t.clone(),
        Value::Slice(SliceValue {
            base,
            offset: 0,
            length: len,
            maxcap: len,
        }),
    ))
}

fn slice_to_string(
    heap: &Heap,
    alloc: &mut Allocator,
    tv: &TypedValue,
    src: &Type,
    t: &Type,
) -> Result<TypedValue, ConvertError> {
    let elem_kind = src.elem().map_or(Kind::Invalid, |e| e.kind());
    let elems: &[TypedValue] = match &tv.v {
        Value::Slice(sv) => {
            let list = heap.array_list(sv.base);
            let end = (sv.offset + sv.length).min(list.len());
            &list[sv.offset.min(end)..end]
        }
        _ => &[],
    };
    let s = match elem_kind {
        Kind::Uint8 => {
            let bytes: Vec<u8> = elems.iter().map(|e| e.get_uint() as u8).collect();
            // invalid sequences become U+FFFD
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Kind::Int32 => elems
            .iter()
            .map(|e| {
                u32::try_from(e.get_int())
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or(char::REPLACEMENT_CHARACTER)
            })
            .collect(),
        _ => return Err(ConvertError::invalid(src, t)),
    };
    alloc.allocate_string(s.len())?;
    Ok(TypedValue::from_string(t.clone(), &s))
}

/// Gives an untyped constant a type. `None` and interface targets take the
/// constant's default type.
pub fn convert_untyped(
    heap: &mut Heap,
    alloc: &mut Allocator,
    mut tv: TypedValue,
    t: Option<&Type>,
) -> Result<TypedValue, ConvertError> {
    let Some(Type::Primitive(p)) = tv.t.clone() else {
        return Ok(tv);
    };
    if !p.is_untyped() {
        return Ok(tv);
    }
    let target = match t {
        Some(t) if !t.is_interface() => t.clone(),
        _ => Type::Primitive(p.default_type()),
    };
    reject_unsupported(&target)?;
    let to = target.kind();
    match p {
        PrimitiveType::UntypedBigint => {
            let v = tv.get_bigint();
            if to == Kind::Bigint {
                return Ok(TypedValue::from_bigint(target, v));
            }
            if !to.is_integer() {
                return Err(ConvertError::invalid(p.name(), &target));
            }
            check_range(&v, to, &target)?;
            Ok(TypedValue::from_uint(target, wrap_bigint(&v)))
        }
        PrimitiveType::UntypedRune => {
            let v = tv.get_int();
            if to == Kind::String {
                let c = u32::try_from(v)
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or(char::REPLACEMENT_CHARACTER);
                return Ok(TypedValue::from_string(target, c.encode_utf8(&mut [0; 4])));
            }
            if to == Kind::Bigint {
                return Ok(TypedValue::from_bigint(target, BigInt::from(v)));
            }
            if !to.is_integer() {
                return Err(ConvertError::invalid(p.name(), &target));
            }
            check_range(&BigInt::from(v), to, &target)?;
            Ok(TypedValue::from_int(target, v))
        }
        PrimitiveType::UntypedBool => {
            if to != Kind::Bool {
                return Err(ConvertError::invalid(p.name(), &target));
            }
            tv.t = Some(target);
            Ok(tv)
        }
        PrimitiveType::UntypedString => {
            if to == Kind::String {
                tv.t = Some(target);
                return Ok(tv);
            }
            tv.t = Some(Type::STRING);
            convert_to(heap, alloc, tv, &target)
        }
        _ => Ok(tv),
    }
}

fn check_range(v: &BigInt, kind: Kind, target: &Type) -> Result<(), ConvertError> {
    let bits = kind.bits();
    let (lo, hi) = if kind.is_signed_int() {
        (-(BigInt::from(1) << (bits - 1)), (BigInt::from(1) << (bits - 1)) - 1)
    } else {
        (BigInt::from(0), (BigInt::from(1) << bits) - 1)
    };
    if *v < lo || *v > hi {
        return Err(ConvertError::Overflow {
            value: v.to_string(),
            target: target.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (Heap, Allocator) {
        (Heap::new(), Allocator::default())
    }

    fn int8() -> Type {
        Type::Primitive(PrimitiveType::Int8)
    }

    #[test]
    fn integer_conversions_wrap() {
        let (mut heap, mut alloc) = ctx();
        let v = convert_to(&mut heap, &mut alloc, TypedValue::int(300), &int8()).unwrap();
        assert_eq!(v.get_int(), 44);
        let v = convert_to(&mut heap, &mut alloc, TypedValue::int(-1), &Type::UINT8).unwrap();
        assert_eq!(v.get_uint(), 255);
        let v = convert_to(&mut heap, &mut alloc, TypedValue::int(-5), &Type::BIGINT).unwrap();
        assert_eq!(v.get_bigint(), BigInt::from(-5));
        let big = TypedValue::from_bigint(Type::BIGINT, BigInt::from(u64::MAX) + 2);
        let v = convert_to(&mut heap, &mut alloc, big, &Type::UINT64).unwrap();
        assert_eq!(v.get_uint(), 1);
    }

    #[test]
    fn untyped_constants_take_default_types() {
        let (mut heap, mut alloc) = ctx();
        let c = TypedValue::untyped_bigint(BigInt::from(2000));
        let v = convert_untyped(&mut heap, &mut alloc, c, None).unwrap();
        assert_eq!(v.t, Some(Type::INT));
        assert_eq!(v.get_int(), 2000);

        let s = TypedValue::untyped_string("hi");
        let v = convert_untyped(&mut heap, &mut alloc, s, None).unwrap();
        assert_eq!(v.t, Some(Type::STRING));

        let iface = Type::interface("", vec![]);
        let c = TypedValue::untyped_bigint(BigInt::from(1));
        let v = convert_untyped(&mut heap, &mut alloc, c, Some(&iface)).unwrap();
        assert_eq!(v.t, Some(Type::INT));
    }

    #[test]
    fn untyped_overflow_is_rejected() {
        let (mut heap, mut alloc) = ctx();
        let c = TypedValue::untyped_bigint(BigInt::from(128));
        assert!(matches!(
            convert_untyped(&mut heap, &mut alloc, c, Some(&int8())),
            Err(ConvertError::Overflow { .. })
        ));
        let c = TypedValue::untyped_bigint(BigInt::from(-1));
        assert!(convert_untyped(&mut heap, &mut alloc, c, Some(&Type::UINT8)).is_err());
        let c = TypedValue::untyped_bigint(BigInt::from(-128));
        assert_eq!(
            convert_untyped(&mut heap, &mut alloc, c, Some(&int8()))
                .unwrap()
                .get_int(),
            -128
        );
    }

    #[test]
    fn strings_and_byte_slices() {
        let (mut heap, mut alloc) = ctx();
        let bytes_t = Type::slice(Type::UINT8);
        let v = convert_to(&mut heap, &mut alloc, TypedValue::string("héllo"), &bytes_t).unwrap();
        let Value::Slice(sv) = &v.v else {
            panic!("expected slice")
        };
        assert_eq!(sv.length, 6);
        let back = convert_to(&mut heap, &mut alloc, v, &Type::STRING).unwrap();
        assert_eq!(back.get_string(), "héllo");

        let runes_t = Type::slice(Type::INT32);
        let r = convert_to(&mut heap, &mut alloc, TypedValue::string("héllo"), &runes_t).unwrap();
        let Value::Slice(rv) = r.v else {
            panic!("expected slice")
        };
        assert_eq!(rv.length, 5);

        let c = convert_to(&mut heap, &mut alloc, TypedValue::int(0x41), &Type::STRING).unwrap();
        assert_eq!(c.get_string(), "A");
    }

    #[test]
    fn declared_and_interface_targets() {
        let (mut heap, mut alloc) = ctx();
        let id = Type::declared("pkg", "ID", Type::INT);
        let v = convert_to(&mut heap, &mut alloc, TypedValue::int(3), &id).unwrap();
        assert_eq!(v.t, Some(id));
        let iface = Type::interface("", vec![]);
        let v = convert_to(&mut heap, &mut alloc, TypedValue::int(3), &iface).unwrap();
        assert_eq!(v.t, Some(Type::INT));
        assert!(matches!(
            convert_to(&mut heap, &mut alloc, TypedValue::boolean(true), &Type::INT),
            Err(ConvertError::Invalid { .. })
        ));
    }

    #[test]
    fn floats_are_unsupported() {
        let (mut heap, mut alloc) = ctx();
        let f = Type::native("float64");
        assert!(matches!(
            convert_to(&mut heap, &mut alloc, TypedValue::int(1), &f),
            Err(ConvertError::Unsupported(_))
        ));
    }
}
