use super::{Fault, Machine};
use crate::virtual_machine::ast::{BinaryOp, UnaryOp};
use crate::virtual_machine::convert::convert_untyped;
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::type_system::{Kind, Type};
use crate::virtual_machine::values::TypedValue;
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use std::cmp::Ordering;

fn divide_by_zero() -> Fault {
    Fault::Panic("runtime error: integer divide by zero".to_string())
}

impl Machine<'_> {
    pub(super) fn op_binary(&mut self, op: BinaryOp) -> Result<(), MachineError> {
        let r = self.pop_value()?;
        let l = self.pop_value()?;
        let res = self.binary_op(op, l, r);
        let v = try_panic!(self, res);
        self.push_value(v);
        Ok(())
    }

    pub(super) fn op_unary(&mut self, op: UnaryOp) -> Result<(), MachineError> {
        let x = self.pop_value()?;
        let res = self.unary_op(op, x);
        let v = try_panic!(self, res);
        self.push_value(v);
        Ok(())
    }

    pub(super) fn binary_op(
        &mut self,
        op: BinaryOp,
        l: TypedValue,
        r: TypedValue,
    ) -> Result<TypedValue, Fault> {
        match op {
            BinaryOp::Land | BinaryOp::Lor => {
                let b = match op {
                    BinaryOp::Land => l.get_bool() && r.get_bool(),
                    _ => l.get_bool() || r.get_bool(),
                };
                Ok(TypedValue::from_bool(l.typ()?.clone(), b))
            }
            BinaryOp::Shl | BinaryOp::Shr => self.shift(op, l, r),
            BinaryOp::Eql | BinaryOp::Neq => {
                let eq = if l.is_undefined() || r.is_undefined() {
                    l.is_nil() && r.is_nil()
                } else {
                    match self.unify(l, r) {
                        Ok((l, r)) => self.values_equal(&l, &r)?,
                        Err(Fault::Panic(_)) => false,
                        Err(e) => return Err(e),
                    }
                };
                Ok(TypedValue::from_bool(Type::UNTYPED_BOOL, eq == (op == BinaryOp::Eql)))
            }
            BinaryOp::Lss | BinaryOp::Leq | BinaryOp::Gtr | BinaryOp::Geq => {
                let (l, r) = self.unify(l, r)?;
                let ord = compare(&l, &r)?;
                let b = match op {
                    BinaryOp::Lss => ord == Ordering::Less,
                    BinaryOp::Leq => ord != Ordering::Greater,
                    BinaryOp::Gtr => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                };
                Ok(TypedValue::from_bool(Type::UNTYPED_BOOL, b))
            }
            _ => {
                let (l, r) = self.unify(l, r)?;
                self.arith(op, l, r)
            }
        }
    }

    /// Brings both operands to one type. Untyped operands take the type of
    /// the other side.
    fn unify(&mut self, l: TypedValue, r: TypedValue) -> Result<(TypedValue, TypedValue), Fault> {
        match (l.is_untyped(), r.is_untyped()) {
            (true, false) => {
                let t = r.typ()?.clone();
                let l = convert_untyped(&mut self.heap, &mut self.alloc, l, Some(&t))?;
                Ok((l, r))
            }
            (false, true) => {
                let t = l.typ()?.clone();
                let r = convert_untyped(&mut self.heap, &mut self.alloc, r, Some(&t))?;
                Ok((l, r))
            }
            (true, true) if l.typ()? != r.typ()? => {
                // rune wins over an integer constant
                match (l.kind(), r.kind()) {
                    (Kind::Int32, Kind::Bigint) => {
                        let r = rune_of(&r)?;
                        Ok((l, r))
                    }
                    (Kind::Bigint, Kind::Int32) => {
                        let l = rune_of(&l)?;
                        Ok((l, r))
                    }
                    _ => Err(mismatched(&l, &r)),
                }
            }
            _ => {
                if l.typ()? != r.typ()? {
                    return Err(mismatched(&l, &r));
                }
                Ok((l, r))
            }
        }
    }

    fn arith(&mut self, op: BinaryOp, l: TypedValue, r: TypedValue) -> Result<TypedValue, Fault> {
        let t = l.typ()?.clone();
        let kind = t.kind();
        if kind == Kind::String {
            if op != BinaryOp::Add {
                return Err(MachineError::malformed(format!("operator {:?} on strings", op)).into());
            }
            let s = format!("{}{}", l.get_string(), r.get_string());
            self.alloc.allocate_string(s.len())?;
            return Ok(TypedValue::from_string(t, &s));
        }
        if kind == Kind::Bigint {
            let (a, b) = (l.get_bigint(), r.get_bigint());
            let v = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Quo | BinaryOp::Rem if b.is_zero() => return Err(divide_by_zero()),
                BinaryOp::Quo => a / b,
                BinaryOp::Rem => a % b,
                BinaryOp::Band => a & b,
                BinaryOp::Bor => a | b,
                BinaryOp::Xor => a ^ b,
                BinaryOp::BandNot => a & !b,
                _ => return Err(MachineError::malformed(format!("operator {:?}", op)).into()),
            };
            self.alloc.allocate_bigint(v.bits())?;
            return Ok(TypedValue::from_bigint(t, v));
        }
        if kind.is_signed_int() {
            let (a, b) = (l.get_int(), r.get_int());
            let v = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Quo | BinaryOp::Rem if b == 0 => return Err(divide_by_zero()),
                BinaryOp::Quo => a.wrapping_div(b),
                BinaryOp::Rem => a.wrapping_rem(b),
                BinaryOp::Band => a & b,
                BinaryOp::Bor => a | b,
                BinaryOp::Xor => a ^ b,
                BinaryOp::BandNot => a & !b,
                _ => return Err(MachineError::malformed(format!("operator {:?}", op)).into()),
            };
            return Ok(TypedValue::from_int(t, v));
        }
        if kind.is_unsigned_int() {
            let (a, b) = (l.get_uint(), r.get_uint());
            let v = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Quo | BinaryOp::Rem if b == 0 => return Err(divide_by_zero()),
                BinaryOp::Quo => a / b,
                BinaryOp::Rem => a % b,
                BinaryOp::Band => a & b,
                BinaryOp::Bor => a | b,
                BinaryOp::Xor => a ^ b,
                BinaryOp::BandNot => a & !b,
                _ => return Err(MachineError::malformed(format!("operator {:?}", op)).into()),
            };
            return Ok(TypedValue::from_uint(t, v));
        }
        Err(MachineError::UnsupportedKind(format!("{:?} on {}", op, t)).into())
    }

    fn shift(&mut self, op: BinaryOp, l: TypedValue, r: TypedValue) -> Result<TypedValue, Fault> {
        let amount = r.to_bigint();
        if amount.is_negative() {
            return Err(Fault::Panic("runtime error: negative shift amount".to_string()));
        }
        let n = amount.to_u64().unwrap_or(u64::MAX);
        let t = l.typ()?.clone();
        let kind = t.kind();
        if kind == Kind::Bigint {
            let a = l.get_bigint();
            let v = match op {
                BinaryOp::Shl => {
                    let bits = a.bits().saturating_add(n);
                    self.alloc.allocate_bigint(bits)?;
                    a << (n as usize)
                }
                _ if n >= a.bits() + 1 => {
                    if a.is_negative() {
                        BigInt::from(-1)
                    } else {
                        BigInt::zero()
                    }
                }
                _ => a >> (n as usize),
            };
            return Ok(TypedValue::from_bigint(t, v));
        }
        if kind.is_signed_int() {
            let a = l.get_int();
            let v = match op {
                BinaryOp::Shl if n >= 64 => 0,
                BinaryOp::Shl => a.wrapping_shl(n as u32),
                _ if n >= 64 => {
                    if a < 0 {
                        -1
                    } else {
                        0
                    }
                }
                _ => a >> n,
            };
            return Ok(TypedValue::from_int(t, v));
        }
        if kind.is_unsigned_int() {
            let a = l.get_uint();
            let v = match op {
                _ if n >= 64 => 0,
                BinaryOp::Shl => a << n,
                _ => a >> n,
            };
            return Ok(TypedValue::from_uint(t, v));
        }
        Err(MachineError::UnsupportedKind(format!("shift of {}", t)).into())
    }

    fn unary_op(&mut self, op: UnaryOp, x: TypedValue) -> Result<TypedValue, Fault> {
        let t = x.typ()?.clone();
        let kind = t.kind();
        Ok(match op {
            UnaryOp::Pos => x,
            UnaryOp::Not if kind == Kind::Bool => TypedValue::from_bool(t, !x.get_bool()),
            UnaryOp::Neg if kind == Kind::Bigint => TypedValue::from_bigint(t, -x.get_bigint()),
            UnaryOp::Neg if kind.is_signed_int() => {
                TypedValue::from_int(t, x.get_int().wrapping_neg())
            }
            UnaryOp::Neg if kind.is_unsigned_int() => {
                TypedValue::from_uint(t, x.get_uint().wrapping_neg())
            }
            UnaryOp::Xor if kind == Kind::Bigint => TypedValue::from_bigint(t, !x.get_bigint()),
            UnaryOp::Xor if kind.is_signed_int() => TypedValue::from_int(t, !x.get_int()),
            UnaryOp::Xor if kind.is_unsigned_int() => TypedValue::from_uint(t, !x.get_uint()),
            _ => {
                return Err(MachineError::UnsupportedKind(format!("{:?} on {}", op, t)).into());
            }
        })
    }

    /// `==` on two defined operands of the same type. Slices, maps and
    /// functions compare only against nil.
    pub(super) fn values_equal(&self, l: &TypedValue, r: &TypedValue) -> Result<bool, Fault> {
        if l.is_undefined() || r.is_undefined() {
            return Ok(l.is_nil() && r.is_nil());
        }
        let kind = l.kind();
        if matches!(kind, Kind::Slice | Kind::Map | Kind::Func) {
            if l.is_nil() || r.is_nil() {
                return Ok(l.is_nil() && r.is_nil());
            }
            return Err(MachineError::UncomparableKind(kind).into());
        }
        if l.typ()? != r.typ()? {
            return Ok(false);
        }
        Ok(l.map_key(&self.heap)? == r.map_key(&self.heap)?)
    }
}

fn compare(l: &TypedValue, r: &TypedValue) -> Result<Ordering, Fault> {
    let kind = l.kind();
    Ok(match kind {
        Kind::String => l.get_string().cmp(r.get_string()),
        Kind::Bigint => l.get_bigint().cmp(&r.get_bigint()),
        k if k.is_signed_int() => l.get_int().cmp(&r.get_int()),
        k if k.is_unsigned_int() => l.get_uint().cmp(&r.get_uint()),
        k => return Err(MachineError::UncomparableKind(k).into()),
    })
}

fn rune_of(x: &TypedValue) -> Result<TypedValue, Fault> {
    let v = x
        .get_bigint()
        .to_i32()
        .ok_or_else(|| Fault::Panic(format!("constant {} overflows rune", x.get_bigint())))?;
    Ok(TypedValue::from_int(Type::UNTYPED_RUNE, v as i64))
}

fn mismatched(l: &TypedValue, r: &TypedValue) -> Fault {
    let name = |x: &TypedValue| x.t.as_ref().map_or("nil".to_string(), |t| t.to_string());
    Fault::Panic(format!(
        "invalid operation: mismatched types {} and {}",
        name(l),
        name(r)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::machine::MachineOptions;
    use crate::virtual_machine::store::MemStore;

    fn untyped(v: i64) -> TypedValue {
        TypedValue::untyped_bigint(BigInt::from(v))
    }

    #[test]
    fn untyped_constants_fold_as_bigint() {
        let mut store = MemStore::new();
        let mut m = Machine::new(&mut store, MachineOptions::default());
        let v = m.binary_op(BinaryOp::Mul, untyped(1000), untyped(2)).unwrap();
        assert!(v.is_untyped());
        assert_eq!(v.get_bigint(), BigInt::from(2000));
    }

    #[test]
    fn typed_arithmetic_wraps() {
        let mut store = MemStore::new();
        let mut m = Machine::new(&mut store, MachineOptions::default());
        let max = TypedValue::from_int(Type::INT64, i64::MAX);
        let v = m.binary_op(BinaryOp::Add, max, untyped(1)).unwrap();
        assert_eq!(v.typ().unwrap(), &Type::INT64);
        assert_eq!(v.get_int(), i64::MIN);
    }

    #[test]
    fn division_by_zero_panics() {
        let mut store = MemStore::new();
        let mut m = Machine::new(&mut store, MachineOptions::default());
        let err = m.binary_op(BinaryOp::Quo, TypedValue::int(1), TypedValue::int(0));
        assert!(matches!(err, Err(Fault::Panic(msg)) if msg.contains("divide by zero")));
    }

    #[test]
    fn mismatched_types_panic() {
        let mut store = MemStore::new();
        let mut m = Machine::new(&mut store, MachineOptions::default());
        let err = m.binary_op(BinaryOp::Add, TypedValue::int(1), TypedValue::string("a"));
        assert!(matches!(err, Err(Fault::Panic(msg)) if msg.contains("mismatched types")));
    }

    #[test]
    fn comparisons_yield_untyped_bool() {
        let mut store = MemStore::new();
        let mut m = Machine::new(&mut store, MachineOptions::default());
        let v = m.binary_op(BinaryOp::Lss, TypedValue::int(1), untyped(2)).unwrap();
        assert_eq!(v.typ().unwrap(), &Type::UNTYPED_BOOL);
        assert!(v.get_bool());
        let v = m
            .binary_op(BinaryOp::Eql, TypedValue::string("a"), TypedValue::string("a"))
            .unwrap();
        assert!(v.get_bool());
    }

    #[test]
    fn shifts() {
        let mut store = MemStore::new();
        let mut m = Machine::new(&mut store, MachineOptions::default());
        let v = m.binary_op(BinaryOp::Shl, TypedValue::int(1), untyped(10)).unwrap();
        assert_eq!(v.get_int(), 1024);
        let v = m.binary_op(BinaryOp::Shr, TypedValue::int(-8), untyped(100)).unwrap();
        assert_eq!(v.get_int(), -1);
        let err = m.binary_op(BinaryOp::Shl, TypedValue::int(1), TypedValue::int(-1));
        assert!(matches!(err, Err(Fault::Panic(_))));
    }

    #[test]
    fn nil_comparisons() {
        let mut store = MemStore::new();
        let m = Machine::new(&mut store, MachineOptions::default());
        let nil_slice = TypedValue::nil(Type::slice(Type::INT));
        assert!(m.values_equal(&nil_slice, &TypedValue::undefined()).unwrap());
        assert!(!m.values_equal(&TypedValue::int(0), &TypedValue::undefined()).unwrap());
    }
}
