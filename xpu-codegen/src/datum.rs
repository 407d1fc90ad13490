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

//! Values as seen by the host evaluator and the device interpreter.
//!
//! The binary image of a value is little-endian with a fixed width per type.
//! Variable-length values (text, bpchar, bytea) are stored as a 4-byte length
//! followed by the raw bytes. A numeric is stored as a 16-byte mantissa
//! followed by a 2-byte scale.

use crate::error::{ErrorKind, Result};
use crate::opcodes::TypeOpCode;
use std::cmp::Ordering;
use std::convert::TryInto;
use std::fmt;

/// A nullable value
pub type Datum = Option<Value>;

/// A row of nullable values
pub type Row = Vec<Datum>;

/// Days between 1970-01-01 and the epoch used by dates and timestamps,
/// 2000-01-01.
const UNIX_EPOCH_OFFSET_DAYS: i64 = 10_957;

pub const USECS_PER_DAY: i64 = 86_400_000_000;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int1(i8),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Numeric),
    Text(String),
    Bpchar(String),
    Bytea(Vec<u8>),
    /// Days since 2000-01-01
    Date(i32),
    /// Microseconds since midnight
    Time(i64),
    /// Microseconds since 2000-01-01 00:00:00
    Timestamp(i64),
    /// Microseconds since 2000-01-01 00:00:00 UTC
    Timestamptz(i64),
    Interval(Interval),
    /// Amount in cents
    Money(i64),
    Uuid([u8; 16]),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

/// A fixed-point decimal
///
/// The value is `mantissa * 10^-scale`. Numerics are always normalized:
/// trailing zero digits are stripped from the mantissa and the scale is
/// reduced accordingly. Zero has scale 0. Normalization keeps the binary
/// image canonical, thus equal numerics have equal images and hash values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Numeric {
    mantissa: i128,
    scale: u16,
}

fn pow10(exp: u16) -> Option<i128> {
    10_i128.checked_pow(u32::from(exp))
}

impl Numeric {
    pub fn new(mantissa: i128, scale: u16) -> Self {
        let mut mantissa = mantissa;
        let mut scale = scale;
        while scale > 0 && mantissa % 10 == 0 {
            mantissa /= 10;
            scale -= 1;
        }
        if mantissa == 0 {
            scale = 0;
        }
        Self { mantissa, scale }
    }

    pub fn from_i64(value: i64) -> Self {
        Self::new(i128::from(value), 0)
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn scale(&self) -> u16 {
        self.scale
    }

    /// Returns `true` if the mantissa fits into a 64-bit integer.
    pub fn fits_i64(&self) -> bool {
        self.mantissa >= i128::from(i64::min_value()) && self.mantissa <= i128::from(i64::max_value())
    }

    /// Parses a decimal string such as `-12.3400`.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };
        let mut parts = digits.splitn(2, '.');
        let int_part = parts.next().unwrap_or("");
        let frac_part = parts.next().unwrap_or("");
        if int_part.is_empty() && frac_part.is_empty() {
            Err(ErrorKind::InvalidArgument(format!(
                "invalid input syntax for type numeric: \"{}\"",
                s
            )))?;
        }

        let mut mantissa: i128 = 0;
        for c in int_part.chars().chain(frac_part.chars()) {
            let digit = c.to_digit(10).ok_or_else(|| {
                ErrorKind::InvalidArgument(format!(
                    "invalid input syntax for type numeric: \"{}\"",
                    s
                ))
            })?;
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(digit)))
                .ok_or_else(|| {
                    ErrorKind::InvalidArgument(format!("numeric value out of range: \"{}\"", s))
                })?;
        }
        if negative {
            mantissa = -mantissa;
        }
        let scale: u16 = frac_part.len().try_into().map_err(|_| {
            ErrorKind::InvalidArgument(format!("numeric scale out of range: \"{}\"", s))
        })?;
        Ok(Self::new(mantissa, scale))
    }

    /// Mantissa expressed at a scale larger than or equal to the own scale.
    fn mantissa_at(&self, scale: u16) -> Option<i128> {
        debug_assert!(scale >= self.scale);
        pow10(scale - self.scale).and_then(|f| self.mantissa.checked_mul(f))
    }

    pub fn checked_add(&self, other: &Numeric) -> Option<Numeric> {
        let scale = self.scale.max(other.scale);
        let a = self.mantissa_at(scale)?;
        let b = other.mantissa_at(scale)?;
        a.checked_add(b).map(|m| Numeric::new(m, scale))
    }

    pub fn checked_sub(&self, other: &Numeric) -> Option<Numeric> {
        other.checked_neg().and_then(|neg| self.checked_add(&neg))
    }

    pub fn checked_mul(&self, other: &Numeric) -> Option<Numeric> {
        let scale = self.scale.checked_add(other.scale)?;
        self.mantissa
            .checked_mul(other.mantissa)
            .map(|m| Numeric::new(m, scale))
    }

    pub fn checked_neg(&self) -> Option<Numeric> {
        self.mantissa.checked_neg().map(|m| Numeric {
            mantissa: m,
            scale: self.scale,
        })
    }

    pub fn checked_abs(&self) -> Option<Numeric> {
        self.mantissa.checked_abs().map(|m| Numeric {
            mantissa: m,
            scale: self.scale,
        })
    }

    /// Rounds half away from zero to an integer.
    pub fn round_to_i64(&self) -> Option<i64> {
        let divisor = pow10(self.scale)?;
        let quotient = self.mantissa / divisor;
        let remainder = (self.mantissa % divisor).abs();
        let rounded = if remainder >= divisor - remainder {
            quotient + self.mantissa.signum()
        } else {
            quotient
        };
        rounded.try_into().ok()
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / 10_f64.powi(i32::from(self.scale))
    }

    /// Converts a finite float. Returns `None` for NaN and infinity.
    pub fn from_f64(value: f64) -> Option<Numeric> {
        if !value.is_finite() {
            return None;
        }
        Numeric::parse(&format!("{}", value)).ok()
    }

    /// Orders two numerics by value.
    pub fn cmp_value(&self, other: &Numeric) -> Ordering {
        let scale = self.scale.max(other.scale);
        match (self.mantissa_at(scale), other.mantissa_at(scale)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self
                .to_f64()
                .partial_cmp(&other.to_f64())
                .unwrap_or(Ordering::Equal),
        }
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let digits = self.mantissa.abs().to_string();
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let scale = self.scale as usize;
        if scale == 0 {
            write!(f, "{}{}", sign, digits)
        } else if digits.len() > scale {
            let (int, frac) = digits.split_at(digits.len() - scale);
            write!(f, "{}{}.{}", sign, int, frac)
        } else {
            write!(f, "{}0.{}{}", sign, "0".repeat(scale - digits.len()), digits)
        }
    }
}

/// Converts a date (days since 2000-01-01) into year, month, and day.
pub fn date_to_ymd(date: i32) -> (i64, u32, u32) {
    let z = i64::from(date) + UNIX_EPOCH_OFFSET_DAYS + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

/// Converts year, month, and day into a date (days since 2000-01-01).
pub fn ymd_to_date(year: i64, month: u32, day: u32) -> i32 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let m = i64::from(month);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    (era * 146_097 + doe - 719_468 - UNIX_EPOCH_OFFSET_DAYS) as i32
}

fn fmt_time_of_day(f: &mut fmt::Formatter, micros: i64) -> fmt::Result {
    let secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    write!(
        f,
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )?;
    if frac != 0 {
        write!(f, ".{:06}", frac)?;
    }
    Ok(())
}

fn fmt_timestamp(f: &mut fmt::Formatter, ts: i64) -> fmt::Result {
    let days = ts.div_euclid(USECS_PER_DAY);
    let micros = ts.rem_euclid(USECS_PER_DAY);
    let (y, m, d) = date_to_ymd(days as i32);
    write!(f, "{:04}-{:02}-{:02} ", y, m, d)?;
    fmt_time_of_day(f, micros)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", if *b { "t" } else { "f" }),
            Value::Int1(v) => write!(f, "{}", v),
            Value::Int2(v) => write!(f, "{}", v),
            Value::Int4(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Float4(v) => write!(f, "{}", v),
            Value::Float8(v) => write!(f, "{}", v),
            Value::Numeric(n) => write!(f, "{}", n),
            Value::Text(s) | Value::Bpchar(s) => write!(f, "{}", s),
            Value::Bytea(b) => {
                write!(f, "\\x")?;
                b.iter().try_for_each(|byte| write!(f, "{:02x}", byte))
            }
            Value::Date(d) => {
                let (y, m, d) = date_to_ymd(*d);
                write!(f, "{:04}-{:02}-{:02}", y, m, d)
            }
            Value::Time(t) => fmt_time_of_day(f, *t),
            Value::Timestamp(ts) => fmt_timestamp(f, *ts),
            Value::Timestamptz(ts) => {
                fmt_timestamp(f, *ts)?;
                write!(f, "+00")
            }
            Value::Interval(iv) => write!(
                f,
                "{} mons {} days {} us",
                iv.months, iv.days, iv.micros
            ),
            Value::Money(cents) => {
                let sign = if *cents < 0 { "-" } else { "" };
                let abs = i128::from(*cents).abs();
                write!(f, "{}${}.{:02}", sign, abs / 100, abs % 100)
            }
            Value::Uuid(u) => {
                for (i, byte) in u.iter().enumerate() {
                    if i == 4 || i == 6 || i == 8 || i == 10 {
                        write!(f, "-")?;
                    }
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// Total order on floats that sorts NaN above all other values and treats
/// all NaNs as equal.
fn float_cmp(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn take<'a>(bytes: &'a [u8], len: usize, code: TypeOpCode) -> Result<&'a [u8]> {
    bytes.get(..len).ok_or_else(|| {
        ErrorKind::Corrupted(format!(
            "value image of {:?} truncated: need {} bytes, have {}",
            code,
            len,
            bytes.len()
        ))
        .into()
    })
}

macro_rules! le_array {
    ($bytes:expr, $n:expr) => {{
        let mut array = [0_u8; $n];
        array.copy_from_slice(&$bytes[..$n]);
        array
    }};
}

impl Value {
    pub fn type_code(&self) -> TypeOpCode {
        match self {
            Value::Bool(_) => TypeOpCode::Bool,
            Value::Int1(_) => TypeOpCode::Int1,
            Value::Int2(_) => TypeOpCode::Int2,
            Value::Int4(_) => TypeOpCode::Int4,
            Value::Int8(_) => TypeOpCode::Int8,
            Value::Float4(_) => TypeOpCode::Float4,
            Value::Float8(_) => TypeOpCode::Float8,
            Value::Numeric(_) => TypeOpCode::Numeric,
            Value::Text(_) => TypeOpCode::Text,
            Value::Bpchar(_) => TypeOpCode::Bpchar,
            Value::Bytea(_) => TypeOpCode::Bytea,
            Value::Date(_) => TypeOpCode::Date,
            Value::Time(_) => TypeOpCode::Time,
            Value::Timestamp(_) => TypeOpCode::Timestamp,
            Value::Timestamptz(_) => TypeOpCode::Timestamptz,
            Value::Interval(_) => TypeOpCode::Interval,
            Value::Money(_) => TypeOpCode::Money,
            Value::Uuid(_) => TypeOpCode::Uuid,
        }
    }

    pub fn numeric(s: &str) -> Result<Value> {
        Numeric::parse(s).map(Value::Numeric)
    }

    pub fn date(year: i64, month: u32, day: u32) -> Value {
        Value::Date(ymd_to_date(year, month, day))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Length of the binary image.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Text(s) | Value::Bpchar(s) => 4 + s.len(),
            Value::Bytea(b) => 4 + b.len(),
            other => other.type_code().fixed_len().unwrap_or(0),
        }
    }

    /// Appends the binary image to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bool(b) => out.push(*b as u8),
            Value::Int1(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int2(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int4(v) | Value::Date(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int8(v)
            | Value::Time(v)
            | Value::Timestamp(v)
            | Value::Timestamptz(v)
            | Value::Money(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float4(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Float8(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Numeric(n) => {
                out.extend_from_slice(&n.mantissa.to_le_bytes());
                out.extend_from_slice(&n.scale.to_le_bytes());
            }
            Value::Text(s) | Value::Bpchar(s) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Bytea(b) => {
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
            Value::Interval(iv) => {
                out.extend_from_slice(&iv.months.to_le_bytes());
                out.extend_from_slice(&iv.days.to_le_bytes());
                out.extend_from_slice(&iv.micros.to_le_bytes());
            }
            Value::Uuid(u) => out.extend_from_slice(u),
        }
    }

    /// Decodes a binary image of type `code` from the start of `bytes`.
    ///
    /// Returns the value and the number of bytes consumed.
    pub fn decode(code: TypeOpCode, bytes: &[u8]) -> Result<(Value, usize)> {
        if let Some(len) = code.fixed_len() {
            let b = take(bytes, len, code)?;
            let value = match code {
                TypeOpCode::Bool => match b[0] {
                    0 => Value::Bool(false),
                    1 => Value::Bool(true),
                    other => Err(ErrorKind::Corrupted(format!(
                        "invalid bool image {}",
                        other
                    )))?,
                },
                TypeOpCode::Int1 => Value::Int1(i8::from_le_bytes(le_array!(b, 1))),
                TypeOpCode::Int2 => Value::Int2(i16::from_le_bytes(le_array!(b, 2))),
                TypeOpCode::Int4 => Value::Int4(i32::from_le_bytes(le_array!(b, 4))),
                TypeOpCode::Date => Value::Date(i32::from_le_bytes(le_array!(b, 4))),
                TypeOpCode::Int8 => Value::Int8(i64::from_le_bytes(le_array!(b, 8))),
                TypeOpCode::Time => Value::Time(i64::from_le_bytes(le_array!(b, 8))),
                TypeOpCode::Timestamp => Value::Timestamp(i64::from_le_bytes(le_array!(b, 8))),
                TypeOpCode::Timestamptz => {
                    Value::Timestamptz(i64::from_le_bytes(le_array!(b, 8)))
                }
                TypeOpCode::Money => Value::Money(i64::from_le_bytes(le_array!(b, 8))),
                TypeOpCode::Float4 => {
                    Value::Float4(f32::from_bits(u32::from_le_bytes(le_array!(b, 4))))
                }
                TypeOpCode::Float8 => {
                    Value::Float8(f64::from_bits(u64::from_le_bytes(le_array!(b, 8))))
                }
                TypeOpCode::Numeric => {
                    let mantissa = i128::from_le_bytes(le_array!(b, 16));
                    let scale = u16::from_le_bytes(le_array!(&b[16..], 2));
                    let numeric = Numeric::new(mantissa, scale);
                    if numeric.mantissa != mantissa || numeric.scale != scale {
                        Err(ErrorKind::Corrupted(
                            "numeric image is not normalized".to_string(),
                        ))?;
                    }
                    Value::Numeric(numeric)
                }
                TypeOpCode::Interval => Value::Interval(Interval {
                    months: i32::from_le_bytes(le_array!(b, 4)),
                    days: i32::from_le_bytes(le_array!(&b[4..], 4)),
                    micros: i64::from_le_bytes(le_array!(&b[8..], 8)),
                }),
                TypeOpCode::Uuid => Value::Uuid(le_array!(b, 16)),
                _ => Err(ErrorKind::LogicError(format!(
                    "no fixed-length decoder for {:?}",
                    code
                )))?,
            };
            Ok((value, len))
        } else {
            let len_bytes = take(bytes, 4, code)?;
            let len = u32::from_le_bytes(le_array!(len_bytes, 4)) as usize;
            let body = take(&bytes[4..], len, code)?;
            let value = match code {
                TypeOpCode::Bytea => Value::Bytea(body.to_vec()),
                TypeOpCode::Text | TypeOpCode::Bpchar => {
                    let s = String::from_utf8(body.to_vec()).map_err(|_| {
                        ErrorKind::Corrupted(format!("invalid UTF-8 in {:?} image", code))
                    })?;
                    if code == TypeOpCode::Text {
                        Value::Text(s)
                    } else {
                        Value::Bpchar(s)
                    }
                }
                _ => Err(ErrorKind::Unsupported(format!(
                    "values of {:?} have no binary image",
                    code
                )))?,
            };
            Ok((value, 4 + len))
        }
    }

    /// Compares two values of the same type with SQL semantics.
    ///
    /// Returns `None` if the types differ. Text compares bytewise, as in the
    /// C collation; bpchar ignores trailing spaces.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        let ord = match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int1(a), Value::Int1(b)) => a.cmp(b),
            (Value::Int2(a), Value::Int2(b)) => a.cmp(b),
            (Value::Int4(a), Value::Int4(b)) => a.cmp(b),
            (Value::Int8(a), Value::Int8(b)) => a.cmp(b),
            (Value::Float4(a), Value::Float4(b)) => float_cmp(f64::from(*a), f64::from(*b)),
            (Value::Float8(a), Value::Float8(b)) => float_cmp(*a, *b),
            (Value::Numeric(a), Value::Numeric(b)) => a.cmp_value(b),
            (Value::Text(a), Value::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Bpchar(a), Value::Bpchar(b)) => a
                .trim_end_matches(' ')
                .as_bytes()
                .cmp(b.trim_end_matches(' ').as_bytes()),
            (Value::Bytea(a), Value::Bytea(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b))
            | (Value::Timestamp(a), Value::Timestamp(b))
            | (Value::Timestamptz(a), Value::Timestamptz(b))
            | (Value::Money(a), Value::Money(b)) => a.cmp(b),
            (Value::Interval(a), Value::Interval(b)) => {
                let span = |iv: &Interval| {
                    (i128::from(iv.months) * 30 + i128::from(iv.days)) * i128::from(USECS_PER_DAY)
                        + i128::from(iv.micros)
                };
                span(a).cmp(&span(b))
            }
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            _ => return None,
        };
        Some(ord)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_is_normalized() {
        let n = Numeric::parse("-12.3400").unwrap();
        assert_eq!(n.mantissa(), -1234);
        assert_eq!(n.scale(), 2);
        assert_eq!(n.to_string(), "-12.34");

        let zero = Numeric::parse("0.000").unwrap();
        assert_eq!(zero.scale(), 0);
        assert_eq!(zero, Numeric::from_i64(0));

        assert_eq!(Numeric::parse("1.50").unwrap(), Numeric::parse("1.5").unwrap());
        assert_eq!(Numeric::parse("0.05").unwrap().to_string(), "0.05");
    }

    #[test]
    fn numeric_arithmetic() {
        let a = Numeric::parse("1.25").unwrap();
        let b = Numeric::parse("0.75").unwrap();
        assert_eq!(a.checked_add(&b).unwrap(), Numeric::from_i64(2));
        assert_eq!(a.checked_sub(&b).unwrap().to_string(), "0.5");
        assert_eq!(a.checked_mul(&b).unwrap().to_string(), "0.9375");
        assert_eq!(Numeric::parse("2.5").unwrap().round_to_i64(), Some(3));
        assert_eq!(Numeric::parse("-2.5").unwrap().round_to_i64(), Some(-3));
        assert_eq!(
            a.cmp_value(&Numeric::parse("1.3").unwrap()),
            Ordering::Less
        );
    }

    #[test]
    fn dates_round_trip() {
        assert_eq!(ymd_to_date(2000, 1, 1), 0);
        assert_eq!(date_to_ymd(0), (2000, 1, 1));
        assert_eq!(date_to_ymd(ymd_to_date(1999, 12, 31)), (1999, 12, 31));
        assert_eq!(date_to_ymd(ymd_to_date(2024, 2, 29)), (2024, 2, 29));
        assert_eq!(Value::date(2021, 3, 4).to_string(), "2021-03-04");
    }

    #[test]
    fn value_image_round_trip() {
        let values = vec![
            Value::Bool(true),
            Value::Int2(-3),
            Value::Int8(1 << 40),
            Value::Float8(2.5),
            Value::numeric("3.14").unwrap(),
            Value::Text("hello".to_string()),
            Value::Interval(Interval {
                months: 1,
                days: 2,
                micros: 3,
            }),
        ];
        for value in values {
            let mut buf = Vec::new();
            value.encode(&mut buf);
            assert_eq!(buf.len(), value.encoded_len());
            let (decoded, len) = Value::decode(value.type_code(), &buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(len, buf.len());
        }
    }

    #[test]
    fn truncated_image_is_corrupted() {
        let err = Value::decode(TypeOpCode::Int8, &[0, 1, 2]).unwrap_err();
        assert!(err.is_corrupted());
    }

    #[test]
    fn bpchar_ignores_trailing_spaces() {
        let a = Value::Bpchar("ab  ".to_string());
        let b = Value::Bpchar("ab".to_string());
        assert_eq!(a.sql_cmp(&b), Some(Ordering::Equal));
    }
}
