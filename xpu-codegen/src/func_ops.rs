// Copyright 2021-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Semantics of device functions.
//!
//! The device interpreter and the host evaluator share these
//! implementations. They differ only in precision: the device represents
//! numerics with a 64-bit mantissa and cannot map the case of multibyte
//! characters. Where the device precision is insufficient, evaluation
//! fails with `EvalError::CpuReCheck` and the host re-evaluates the row.

use crate::catalog::FuncOp;
use crate::datum::{Datum, Numeric, Value, USECS_PER_DAY};
use crate::opcodes::TypeOpCode;
use num_traits::{CheckedNeg, CheckedRem, Float, PrimInt, Signed};
use std::convert::TryFrom;
use std::fmt;

/// Evaluation precision
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Precision {
    Device,
    Host,
}

/// A per-row evaluation failure
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EvalError {
    /// The device cannot evaluate the row; the host can.
    CpuReCheck(String),
    /// The row cannot be evaluated at all, e.g., division by zero.
    Fatal(String),
}

impl EvalError {
    pub fn is_recheck(&self) -> bool {
        match self {
            EvalError::CpuReCheck(_) => true,
            EvalError::Fatal(_) => false,
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EvalError::CpuReCheck(msg) => write!(f, "CPU re-check required: {}", msg),
            EvalError::Fatal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for EvalError {}

pub type EvalResult<T> = std::result::Result<T, EvalError>;

fn fatal<T>(msg: &str) -> EvalResult<T> {
    Err(EvalError::Fatal(msg.to_string()))
}

fn type_mismatch<T>(op: FuncOp, args: &[&Value]) -> EvalResult<T> {
    let types: Vec<TypeOpCode> = args.iter().map(|a| a.type_code()).collect();
    Err(EvalError::Fatal(format!(
        "function {:?} is not defined for {:?}",
        op, types
    )))
}

/// Fails with `CpuReCheck` if the device cannot represent `value`.
pub fn check_device_value(value: &Value) -> EvalResult<()> {
    match value {
        Value::Numeric(n) if !n.fits_i64() => Err(EvalError::CpuReCheck(format!(
            "numeric {} exceeds device precision",
            n
        ))),
        _ => Ok(()),
    }
}

/// Applies a device function to its arguments.
pub fn apply(op: FuncOp, ret: TypeOpCode, args: &[Datum], precision: Precision) -> EvalResult<Datum> {
    if op.is_strict() && args.iter().any(Option::is_none) {
        return Ok(None);
    }
    if precision == Precision::Device {
        args.iter().flatten().try_for_each(check_device_value)?;
    }
    let values: Vec<&Value> = args.iter().flatten().collect();

    let result = match op {
        FuncOp::Cast => match values.as_slice() {
            [v] => cast(v, ret)?,
            _ => return type_mismatch(op, &values),
        },
        FuncOp::Add | FuncOp::Sub | FuncOp::Mul | FuncOp::Div | FuncOp::Mod => {
            match values.as_slice() {
                [a, b] => binary(op, a, b, precision)?,
                _ => return type_mismatch(op, &values),
            }
        }
        FuncOp::Neg | FuncOp::Abs => match values.as_slice() {
            [v] => unary(op, v, precision)?,
            _ => return type_mismatch(op, &values),
        },
        FuncOp::Eq | FuncOp::Ne | FuncOp::Lt | FuncOp::Le | FuncOp::Gt | FuncOp::Ge => {
            match values.as_slice() {
                [a, b] => Value::Bool(compare(op, a, b)?),
                _ => return type_mismatch(op, &values),
            }
        }
        FuncOp::Length => match values.as_slice() {
            [Value::Text(s)] => Value::Int4(s.chars().count() as i32),
            [Value::Bpchar(s)] => Value::Int4(s.trim_end_matches(' ').chars().count() as i32),
            _ => return type_mismatch(op, &values),
        },
        FuncOp::TextCat => match values.as_slice() {
            [Value::Text(a), Value::Text(b)] => Value::Text(format!("{}{}", a, b)),
            _ => return type_mismatch(op, &values),
        },
        FuncOp::Concat => Value::Text(values.iter().map(|v| v.to_string()).collect()),
        FuncOp::Upper => match values.as_slice() {
            [Value::Text(s)] => {
                if precision == Precision::Device && !s.is_ascii() {
                    return Err(EvalError::CpuReCheck(
                        "case mapping of multibyte text".to_string(),
                    ));
                }
                Value::Text(s.to_ascii_uppercase())
            }
            _ => return type_mismatch(op, &values),
        },
    };

    if precision == Precision::Device {
        check_device_value(&result)?;
    }
    Ok(Some(result))
}

fn int_binary<T>(op: FuncOp, a: T, b: T) -> EvalResult<T>
where
    T: PrimInt + Signed + CheckedRem,
{
    let result = match op {
        FuncOp::Add => a.checked_add(&b),
        FuncOp::Sub => a.checked_sub(&b),
        FuncOp::Mul => a.checked_mul(&b),
        FuncOp::Div | FuncOp::Mod if b.is_zero() => return fatal("division by zero"),
        FuncOp::Div => a.checked_div(&b),
        FuncOp::Mod if b == -T::one() => Some(T::zero()),
        FuncOp::Mod => a.checked_rem(&b),
        _ => return fatal("not a binary operator"),
    };
    result.map_or_else(|| fatal("integer out of range"), Ok)
}

fn int_unary<T>(op: FuncOp, a: T) -> EvalResult<T>
where
    T: PrimInt + Signed + CheckedNeg,
{
    let result = match op {
        FuncOp::Neg => a.checked_neg(),
        FuncOp::Abs if a.is_negative() => a.checked_neg(),
        FuncOp::Abs => Some(a),
        _ => return fatal("not a unary operator"),
    };
    result.map_or_else(|| fatal("integer out of range"), Ok)
}

fn float_binary<T: Float>(op: FuncOp, a: T, b: T) -> EvalResult<T> {
    let result = match op {
        FuncOp::Add => a + b,
        FuncOp::Sub => a - b,
        FuncOp::Mul => a * b,
        FuncOp::Div if b.is_zero() => return fatal("division by zero"),
        FuncOp::Div => a / b,
        _ => return fatal("not a floating point operator"),
    };
    if result.is_infinite() && a.is_finite() && b.is_finite() {
        return fatal("value out of range: overflow");
    }
    Ok(result)
}

fn numeric_overflow<T>(precision: Precision) -> EvalResult<T> {
    match precision {
        Precision::Device => Err(EvalError::CpuReCheck(
            "numeric overflow on device".to_string(),
        )),
        Precision::Host => fatal("numeric value out of range"),
    }
}

fn binary(op: FuncOp, a: &Value, b: &Value, precision: Precision) -> EvalResult<Value> {
    let value = match (a, b) {
        (Value::Int1(x), Value::Int1(y)) => Value::Int1(int_binary(op, *x, *y)?),
        (Value::Int2(x), Value::Int2(y)) => Value::Int2(int_binary(op, *x, *y)?),
        (Value::Int4(x), Value::Int4(y)) => Value::Int4(int_binary(op, *x, *y)?),
        (Value::Int8(x), Value::Int8(y)) => Value::Int8(int_binary(op, *x, *y)?),
        (Value::Money(x), Value::Money(y)) => Value::Money(int_binary(op, *x, *y)?),
        (Value::Float4(x), Value::Float4(y)) => Value::Float4(float_binary(op, *x, *y)?),
        (Value::Float8(x), Value::Float8(y)) => Value::Float8(float_binary(op, *x, *y)?),
        (Value::Numeric(x), Value::Numeric(y)) => {
            let result = match op {
                FuncOp::Add => x.checked_add(y),
                FuncOp::Sub => x.checked_sub(y),
                FuncOp::Mul => x.checked_mul(y),
                _ => return type_mismatch(op, &[a, b]),
            };
            match result {
                Some(n) => Value::Numeric(n),
                None => return numeric_overflow(precision),
            }
        }
        _ => return type_mismatch(op, &[a, b]),
    };
    Ok(value)
}

fn unary(op: FuncOp, v: &Value, precision: Precision) -> EvalResult<Value> {
    let value = match v {
        Value::Int1(x) => Value::Int1(int_unary(op, *x)?),
        Value::Int2(x) => Value::Int2(int_unary(op, *x)?),
        Value::Int4(x) => Value::Int4(int_unary(op, *x)?),
        Value::Int8(x) => Value::Int8(int_unary(op, *x)?),
        Value::Float4(x) => Value::Float4(if op == FuncOp::Neg { -*x } else { x.abs() }),
        Value::Float8(x) => Value::Float8(if op == FuncOp::Neg { -*x } else { x.abs() }),
        Value::Numeric(n) => {
            let result = if op == FuncOp::Neg {
                n.checked_neg()
            } else {
                n.checked_abs()
            };
            match result {
                Some(n) => Value::Numeric(n),
                None => return numeric_overflow(precision),
            }
        }
        _ => return type_mismatch(op, &[v]),
    };
    Ok(value)
}

fn compare(op: FuncOp, a: &Value, b: &Value) -> EvalResult<bool> {
    let ord = match a.sql_cmp(b) {
        Some(ord) => ord,
        None => return type_mismatch(op, &[a, b]),
    };
    Ok(match op {
        FuncOp::Eq => ord.is_eq(),
        FuncOp::Ne => ord.is_ne(),
        FuncOp::Lt => ord.is_lt(),
        FuncOp::Le => ord.is_le(),
        FuncOp::Gt => ord.is_gt(),
        FuncOp::Ge => ord.is_ge(),
        _ => return type_mismatch(op, &[a, b]),
    })
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Int1(x) => Some(i64::from(*x)),
        Value::Int2(x) => Some(i64::from(*x)),
        Value::Int4(x) => Some(i64::from(*x)),
        Value::Int8(x) => Some(*x),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Float4(x) => Some(f64::from(*x)),
        Value::Float8(x) => Some(*x),
        _ => None,
    }
}

fn make_int(ret: TypeOpCode, v: i64) -> EvalResult<Value> {
    let out_of_range = || EvalError::Fatal(format!("{} out of range for {:?}", v, ret));
    Ok(match ret {
        TypeOpCode::Int1 => Value::Int1(i8::try_from(v).map_err(|_| out_of_range())?),
        TypeOpCode::Int2 => Value::Int2(i16::try_from(v).map_err(|_| out_of_range())?),
        TypeOpCode::Int4 => Value::Int4(i32::try_from(v).map_err(|_| out_of_range())?),
        TypeOpCode::Int8 => Value::Int8(v),
        _ => return Err(EvalError::Fatal(format!("{:?} is not an integer type", ret))),
    })
}

/// Rounds half to even.
fn rint(f: f64) -> f64 {
    let rounded = f.round();
    if (f - f.trunc()).abs() == 0.5 {
        2.0 * (f / 2.0).round()
    } else {
        rounded
    }
}

fn cast(v: &Value, ret: TypeOpCode) -> EvalResult<Value> {
    if v.type_code() == ret {
        return Ok(v.clone());
    }
    if let Some(i) = as_i64(v) {
        return match ret {
            _ if ret.is_integer() => make_int(ret, i),
            TypeOpCode::Float4 => Ok(Value::Float4(i as f32)),
            TypeOpCode::Float8 => Ok(Value::Float8(i as f64)),
            TypeOpCode::Numeric => Ok(Value::Numeric(Numeric::from_i64(i))),
            _ => type_mismatch(FuncOp::Cast, &[v]),
        };
    }
    if let Some(f) = as_f64(v) {
        return match ret {
            _ if ret.is_integer() => {
                if !f.is_finite() {
                    return fatal("cannot convert non-finite float to integer");
                }
                let r = rint(f);
                if r < i64::min_value() as f64 || r >= i64::max_value() as f64 {
                    return fatal("integer out of range");
                }
                make_int(ret, r as i64)
            }
            TypeOpCode::Float4 => Ok(Value::Float4(f as f32)),
            TypeOpCode::Float8 => Ok(Value::Float8(f)),
            TypeOpCode::Numeric => Numeric::from_f64(f)
                .map(Value::Numeric)
                .map_or_else(|| fatal("cannot convert NaN or Infinity to numeric"), Ok),
            _ => type_mismatch(FuncOp::Cast, &[v]),
        };
    }
    match (v, ret) {
        (Value::Numeric(n), _) if ret.is_integer() => match n.round_to_i64() {
            Some(i) => make_int(ret, i),
            None => fatal("integer out of range"),
        },
        (Value::Numeric(n), TypeOpCode::Float4) => Ok(Value::Float4(n.to_f64() as f32)),
        (Value::Numeric(n), TypeOpCode::Float8) => Ok(Value::Float8(n.to_f64())),
        (Value::Date(d), TypeOpCode::Timestamp) | (Value::Date(d), TypeOpCode::Timestamptz) => {
            let ts = i64::from(*d)
                .checked_mul(USECS_PER_DAY)
                .map_or_else(|| fatal("date out of range for timestamp"), Ok)?;
            Ok(if ret == TypeOpCode::Timestamp {
                Value::Timestamp(ts)
            } else {
                Value::Timestamptz(ts)
            })
        }
        (Value::Timestamp(ts), TypeOpCode::Date) | (Value::Timestamptz(ts), TypeOpCode::Date) => {
            let days = ts.div_euclid(USECS_PER_DAY);
            i32::try_from(days)
                .map(Value::Date)
                .map_err(|_| EvalError::Fatal("timestamp out of range for date".to_string()))
        }
        (Value::Timestamp(ts), TypeOpCode::Timestamptz) => Ok(Value::Timestamptz(*ts)),
        (Value::Timestamptz(ts), TypeOpCode::Timestamp) => Ok(Value::Timestamp(*ts)),
        _ => type_mismatch(FuncOp::Cast, &[v]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(s: &str) -> Datum {
        Some(Value::numeric(s).unwrap())
    }

    #[test]
    fn strict_functions_propagate_null() {
        let r = apply(
            FuncOp::Add,
            TypeOpCode::Int4,
            &[Some(Value::Int4(1)), None],
            Precision::Device,
        );
        assert_eq!(r, Ok(None));
    }

    #[test]
    fn integer_overflow_is_fatal() {
        let r = apply(
            FuncOp::Add,
            TypeOpCode::Int4,
            &[Some(Value::Int4(i32::max_value())), Some(Value::Int4(1))],
            Precision::Host,
        );
        assert!(matches!(r, Err(EvalError::Fatal(_))));
        let r = apply(
            FuncOp::Div,
            TypeOpCode::Int8,
            &[Some(Value::Int8(1)), Some(Value::Int8(0))],
            Precision::Device,
        );
        assert_eq!(r, Err(EvalError::Fatal("division by zero".to_string())));
    }

    #[test]
    fn wide_numerics_need_recheck() {
        let big = num("100000000000000000000");
        let r = apply(
            FuncOp::Add,
            TypeOpCode::Numeric,
            &[big.clone(), num("1")],
            Precision::Device,
        );
        assert!(r.unwrap_err().is_recheck());

        let r = apply(FuncOp::Add, TypeOpCode::Numeric, &[big, num("1")], Precision::Host);
        assert_eq!(r, Ok(num("100000000000000000001")));

        let r = apply(
            FuncOp::Mul,
            TypeOpCode::Numeric,
            &[num("4000000000"), num("4000000000")],
            Precision::Device,
        );
        assert!(r.unwrap_err().is_recheck());
    }

    #[test]
    fn upper_of_multibyte_text() {
        let text = Some(Value::Text("größe".to_string()));
        let r = apply(FuncOp::Upper, TypeOpCode::Text, &[text.clone()], Precision::Device);
        assert!(r.unwrap_err().is_recheck());
        let r = apply(FuncOp::Upper, TypeOpCode::Text, &[text], Precision::Host);
        assert_eq!(r, Ok(Some(Value::Text("GRößE".to_string()))));
    }

    #[test]
    fn casts() {
        let r = apply(
            FuncOp::Cast,
            TypeOpCode::Int2,
            &[Some(Value::Int8(70000))],
            Precision::Host,
        );
        assert!(matches!(r, Err(EvalError::Fatal(_))));
        let r = apply(
            FuncOp::Cast,
            TypeOpCode::Int4,
            &[Some(Value::Float8(2.5))],
            Precision::Host,
        );
        assert_eq!(r, Ok(Some(Value::Int4(2))));
        let r = apply(FuncOp::Cast, TypeOpCode::Int4, &[num("2.5")], Precision::Host);
        assert_eq!(r, Ok(Some(Value::Int4(3))));
        let r = apply(
            FuncOp::Cast,
            TypeOpCode::Timestamp,
            &[Some(Value::Date(1))],
            Precision::Host,
        );
        assert_eq!(r, Ok(Some(Value::Timestamp(USECS_PER_DAY))));
    }

    #[test]
    fn concat_skips_nulls() {
        let r = apply(
            FuncOp::Concat,
            TypeOpCode::Text,
            &[
                Some(Value::Text("a".to_string())),
                None,
                Some(Value::Text("b".to_string())),
            ],
            Precision::Device,
        );
        assert_eq!(r, Ok(Some(Value::Text("ab".to_string()))));
    }
}
