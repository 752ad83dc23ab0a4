//! The type registry.
//!
//! A [`TypeDescriptor`] names one SQL type together with its declared
//! length, precision and scale. It knows how to declare itself in SQL text,
//! which TYPE_INFO it travels as, how to validate a [`SqlValue`] against its
//! domain, and how to produce the value bytes that
//! [`TypeInfo::write_value`](tds_protocol::TypeInfo::write_value) then frames.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tds_protocol::{Collation, TypeId, TypeInfo};

use crate::collation::encoding_for;
use crate::error::TypeError;
use crate::value::SqlValue;

/// Longest `varchar(n)` / `varbinary(n)` before `(max)` is required.
pub const MAX_BYTE_LENGTH: u16 = 8000;

/// Longest `nvarchar(n)` before `(max)` is required.
pub const MAX_CHAR_LENGTH: u16 = 4000;

/// Largest decimal precision.
pub const MAX_PRECISION: u8 = 38;

/// Largest scale `rust_decimal` can hold.
const MAX_DECIMAL_SCALE: u8 = 28;

/// Declared length of a variable-length type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Length {
    /// `(n)`: characters for `nvarchar`, bytes otherwise.
    Limited(u16),
    /// `(max)`, sent in PLP form.
    Max,
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Max => f.write_str("max"),
        }
    }
}

/// A SQL type the client can send and receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    /// `bit`
    Bit,
    /// `tinyint`
    TinyInt,
    /// `smallint`
    SmallInt,
    /// `int`
    Int,
    /// `bigint`
    BigInt,
    /// `real`
    Real,
    /// `float`
    Float,
    /// `decimal(p, s)`
    Decimal {
        /// Total digits, 1 to 38.
        precision: u8,
        /// Digits after the point.
        scale: u8,
    },
    /// `varchar(n)` / `varchar(max)`
    VarChar(Length),
    /// `nvarchar(n)` / `nvarchar(max)`
    NVarChar(Length),
    /// `varbinary(n)` / `varbinary(max)`
    VarBinary(Length),
}

impl TypeDescriptor {
    /// `nvarchar(n)`, promoted to `nvarchar(max)` above 4000 characters.
    #[must_use]
    pub fn nvarchar(chars: usize) -> Self {
        Self::NVarChar(limited(chars, MAX_CHAR_LENGTH))
    }

    /// `varchar(n)`, promoted to `varchar(max)` above 8000 bytes.
    #[must_use]
    pub fn varchar(bytes: usize) -> Self {
        Self::VarChar(limited(bytes, MAX_BYTE_LENGTH))
    }

    /// `varbinary(n)`, promoted to `varbinary(max)` above 8000 bytes.
    #[must_use]
    pub fn varbinary(bytes: usize) -> Self {
        Self::VarBinary(limited(bytes, MAX_BYTE_LENGTH))
    }

    /// `decimal(precision, scale)`.
    #[must_use]
    pub fn decimal(precision: u8, scale: u8) -> Self {
        Self::Decimal { precision, scale }
    }

    /// The descriptor used for a parameter declared without an explicit type.
    #[must_use]
    pub fn for_value(value: &SqlValue) -> Self {
        match value {
            SqlValue::Null => Self::NVarChar(Length::Limited(1)),
            SqlValue::Bool(_) => Self::Bit,
            SqlValue::TinyInt(_) => Self::TinyInt,
            SqlValue::SmallInt(_) => Self::SmallInt,
            SqlValue::Int(_) => Self::Int,
            SqlValue::BigInt(_) => Self::BigInt,
            SqlValue::Float(_) => Self::Real,
            SqlValue::Double(_) => Self::Float,
            SqlValue::Decimal(d) => Self::Decimal {
                precision: MAX_PRECISION,
                scale: d.scale() as u8,
            },
            SqlValue::String(s) if s.encode_utf16().count() <= MAX_CHAR_LENGTH as usize => {
                Self::NVarChar(Length::Limited(MAX_CHAR_LENGTH))
            }
            SqlValue::String(_) => Self::NVarChar(Length::Max),
            SqlValue::Binary(b) if b.len() <= MAX_BYTE_LENGTH as usize => {
                Self::VarBinary(Length::Limited(MAX_BYTE_LENGTH))
            }
            SqlValue::Binary(_) => Self::VarBinary(Length::Max),
        }
    }

    /// Map wire metadata back to a registry entry.
    pub fn from_type_info(info: &TypeInfo) -> Result<Self, TypeError> {
        let max_length = info.max_length.unwrap_or(0);
        let byte_length = || {
            if info.is_plp() {
                Length::Max
            } else {
                Length::Limited(max_length.min(u32::from(MAX_BYTE_LENGTH)) as u16)
            }
        };

        Ok(match info.type_id {
            TypeId::Bit | TypeId::BitN => Self::Bit,
            TypeId::Int1 => Self::TinyInt,
            TypeId::Int2 => Self::SmallInt,
            TypeId::Int4 => Self::Int,
            TypeId::Int8 => Self::BigInt,
            TypeId::IntN => match max_length {
                1 => Self::TinyInt,
                2 => Self::SmallInt,
                4 => Self::Int,
                8 => Self::BigInt,
                _ => return Err(TypeError::UnsupportedType(info.type_id as u8)),
            },
            TypeId::Float4 => Self::Real,
            TypeId::Float8 => Self::Float,
            TypeId::FloatN if max_length == 4 => Self::Real,
            TypeId::FloatN => Self::Float,
            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                Self::Decimal {
                    precision: info.precision.unwrap_or(18),
                    scale: info.scale.unwrap_or(0),
                }
            }
            TypeId::BigVarChar | TypeId::BigChar | TypeId::VarChar | TypeId::Char => {
                Self::VarChar(byte_length())
            }
            TypeId::Text => Self::VarChar(Length::Max),
            TypeId::NVarChar | TypeId::NChar if info.is_plp() => Self::NVarChar(Length::Max),
            TypeId::NVarChar | TypeId::NChar => {
                Self::NVarChar(Length::Limited((max_length / 2) as u16))
            }
            TypeId::NText | TypeId::Xml => Self::NVarChar(Length::Max),
            TypeId::BigVarBinary | TypeId::BigBinary | TypeId::VarBinary | TypeId::Binary => {
                Self::VarBinary(byte_length())
            }
            TypeId::Image => Self::VarBinary(Length::Max),
            other => return Err(TypeError::UnsupportedType(other as u8)),
        })
    }

    /// Replace the declared length. Fixed-width types are returned unchanged.
    #[must_use]
    pub fn with_length(self, length: Length) -> Self {
        match self {
            Self::VarChar(_) => Self::VarChar(length),
            Self::NVarChar(_) => Self::NVarChar(length),
            Self::VarBinary(_) => Self::VarBinary(length),
            other => other,
        }
    }

    /// Replace precision and/or scale. Non-decimal types are returned unchanged.
    #[must_use]
    pub fn with_precision(self, precision: Option<u8>, scale: Option<u8>) -> Self {
        match self {
            Self::Decimal {
                precision: p,
                scale: s,
            } => Self::Decimal {
                precision: precision.unwrap_or(p),
                scale: scale.unwrap_or(s),
            },
            other => other,
        }
    }

    /// Lower-case SQL name without length or precision.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bit => "bit",
            Self::TinyInt => "tinyint",
            Self::SmallInt => "smallint",
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Real => "real",
            Self::Float => "float",
            Self::Decimal { .. } => "decimal",
            Self::VarChar(_) => "varchar",
            Self::NVarChar(_) => "nvarchar",
            Self::VarBinary(_) => "varbinary",
        }
    }

    /// The declaration used in parameter lists and DDL, e.g. `nvarchar(50)`.
    #[must_use]
    pub fn declaration(&self) -> String {
        match self {
            Self::Decimal { precision, scale } => format!("decimal({precision}, {scale})"),
            Self::VarChar(len) | Self::NVarChar(len) | Self::VarBinary(len) => {
                format!("{}({len})", self.name())
            }
            other => other.name().to_owned(),
        }
    }

    /// The TYPE_INFO values of this type are framed with.
    #[must_use]
    pub fn type_info(&self) -> TypeInfo {
        let ushort = |len: Length, unit: u32| match len {
            Length::Limited(n) => u32::from(n.max(1)) * unit,
            Length::Max => tds_protocol::types::MAX_LENGTH_PLP,
        };
        match *self {
            Self::Bit => TypeInfo::new(TypeId::BitN).with_max_length(1),
            Self::TinyInt => TypeInfo::new(TypeId::IntN).with_max_length(1),
            Self::SmallInt => TypeInfo::new(TypeId::IntN).with_max_length(2),
            Self::Int => TypeInfo::new(TypeId::IntN).with_max_length(4),
            Self::BigInt => TypeInfo::new(TypeId::IntN).with_max_length(8),
            Self::Real => TypeInfo::new(TypeId::FloatN).with_max_length(4),
            Self::Float => TypeInfo::new(TypeId::FloatN).with_max_length(8),
            Self::Decimal { precision, scale } => TypeInfo::new(TypeId::DecimalN)
                .with_max_length(decimal_width(precision) as u32 + 1)
                .with_precision(precision, scale),
            Self::VarChar(len) => TypeInfo::new(TypeId::BigVarChar)
                .with_max_length(ushort(len, 1))
                .with_collation(Collation::DEFAULT),
            Self::NVarChar(len) => TypeInfo::new(TypeId::NVarChar)
                .with_max_length(ushort(len, 2))
                .with_collation(Collation::DEFAULT),
            Self::VarBinary(len) => {
                TypeInfo::new(TypeId::BigVarBinary).with_max_length(ushort(len, 1))
            }
        }
    }

    /// Check `value` against this type's domain and coerce it to the
    /// variant the type is encoded from.
    ///
    /// NULL is valid for every type.
    pub fn validate(&self, value: &SqlValue) -> Result<SqlValue, TypeError> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        match *self {
            Self::Bit => to_bool(value).map(SqlValue::Bool),
            Self::TinyInt => ranged(value, "tinyint", u8::try_from).map(SqlValue::TinyInt),
            Self::SmallInt => ranged(value, "smallint", i16::try_from).map(SqlValue::SmallInt),
            Self::Int => ranged(value, "int", i32::try_from).map(SqlValue::Int),
            Self::BigInt => ranged(value, "bigint", Ok::<i64, std::convert::Infallible>)
                .map(SqlValue::BigInt),
            Self::Real => {
                let v = to_f64(value, "real")?;
                if v.abs() > f64::from(f32::MAX) {
                    return Err(TypeError::OutOfRange { target_type: "real" });
                }
                Ok(SqlValue::Float(v as f32))
            }
            Self::Float => to_f64(value, "float").map(SqlValue::Double),
            Self::Decimal { precision, scale } => {
                fit_decimal(to_decimal(value)?, precision, scale).map(SqlValue::Decimal)
            }
            Self::VarChar(len) => {
                let s = expect_string(value)?;
                let bytes = encode_varchar(s, None)?;
                check_length(bytes.len(), len)?;
                Ok(SqlValue::String(s.to_owned()))
            }
            Self::NVarChar(len) => {
                let s = expect_string(value)?;
                check_length(s.encode_utf16().count(), len)?;
                Ok(SqlValue::String(s.to_owned()))
            }
            Self::VarBinary(len) => match value {
                SqlValue::Binary(b) => {
                    check_length(b.len(), len)?;
                    Ok(SqlValue::Binary(b.clone()))
                }
                other => Err(mismatch("varbinary", other)),
            },
        }
    }

    /// Validate `value` and produce its unframed wire bytes; `None` is NULL.
    pub fn encode(&self, value: &SqlValue) -> Result<Option<Bytes>, TypeError> {
        let value = self.validate(value)?;
        let mut buf = BytesMut::new();
        match (*self, &value) {
            (_, SqlValue::Null) => return Ok(None),
            (_, SqlValue::Bool(v)) => buf.put_u8(u8::from(*v)),
            (_, SqlValue::TinyInt(v)) => buf.put_u8(*v),
            (_, SqlValue::SmallInt(v)) => buf.put_i16_le(*v),
            (_, SqlValue::Int(v)) => buf.put_i32_le(*v),
            (_, SqlValue::BigInt(v)) => buf.put_i64_le(*v),
            (_, SqlValue::Float(v)) => buf.put_f32_le(*v),
            (_, SqlValue::Double(v)) => buf.put_f64_le(*v),
            (Self::Decimal { precision, .. }, SqlValue::Decimal(d)) => {
                encode_decimal(*d, decimal_width(precision), &mut buf);
            }
            (Self::VarChar(_), SqlValue::String(s)) => return encode_varchar(s, None).map(Some),
            (_, SqlValue::String(s)) => {
                for unit in s.encode_utf16() {
                    buf.put_u16_le(unit);
                }
            }
            (_, SqlValue::Binary(b)) => return Ok(Some(b.clone())),
            (_, other) => return Err(mismatch(self.name(), other)),
        }
        Ok(Some(buf.freeze()))
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.declaration())
    }
}

fn limited(len: usize, max: u16) -> Length {
    if len > max as usize {
        Length::Max
    } else {
        Length::Limited(len.max(1) as u16)
    }
}

/// Magnitude width for a decimal of the given precision.
pub(crate) fn decimal_width(precision: u8) -> usize {
    match precision {
        0..=9 => 4,
        10..=19 => 8,
        20..=28 => 12,
        _ => 16,
    }
}

/// Sign byte (1 positive, 0 negative) then the magnitude, little-endian.
pub(crate) fn encode_decimal(d: Decimal, width: usize, buf: &mut BytesMut) {
    buf.put_u8(u8::from(!d.is_sign_negative()));
    let magnitude = d.mantissa().unsigned_abs().to_le_bytes();
    buf.put_slice(&magnitude[..width]);
}

pub(crate) fn encode_varchar(s: &str, collation: Option<&Collation>) -> Result<Bytes, TypeError> {
    let encoding = encoding_for(collation);
    let (bytes, _, had_errors) = encoding.encode(s);
    if had_errors {
        return Err(TypeError::InvalidEncoding(format!(
            "string is not representable in {}",
            encoding.name()
        )));
    }
    Ok(Bytes::copy_from_slice(&bytes))
}

fn check_length(len: usize, declared: Length) -> Result<(), TypeError> {
    match declared {
        Length::Limited(max) if len > max as usize => Err(TypeError::Truncation {
            length: len,
            max: max as usize,
        }),
        _ => Ok(()),
    }
}

fn mismatch(expected: &'static str, value: &SqlValue) -> TypeError {
    TypeError::TypeMismatch {
        expected,
        actual: value.type_name().to_owned(),
    }
}

fn expect_string(value: &SqlValue) -> Result<&str, TypeError> {
    value.as_str().ok_or_else(|| mismatch("string", value))
}

fn to_bool(value: &SqlValue) -> Result<bool, TypeError> {
    match value {
        SqlValue::Bool(v) => Ok(*v),
        SqlValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(mismatch("bit", value)),
        },
        other => match other.as_i64() {
            Some(v) => Ok(v != 0),
            None => Err(mismatch("bit", value)),
        },
    }
}

/// Integer coercion with a range check for the target width.
fn ranged<T, E>(
    value: &SqlValue,
    target_type: &'static str,
    narrow: impl FnOnce(i64) -> Result<T, E>,
) -> Result<T, TypeError> {
    let wide = match value {
        SqlValue::Bool(v) => i64::from(*v),
        SqlValue::Float(_) | SqlValue::Double(_) => {
            let v = to_f64(value, target_type)?;
            if v.fract() != 0.0 || v < i64::MIN as f64 || v >= i64::MAX as f64 {
                return Err(TypeError::OutOfRange { target_type });
            }
            v as i64
        }
        SqlValue::Decimal(d) => {
            if !d.fract().is_zero() {
                return Err(TypeError::OutOfRange { target_type });
            }
            i64::try_from(d.trunc()).map_err(|_| TypeError::OutOfRange { target_type })?
        }
        SqlValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| mismatch(target_type, value))?,
        other => other.as_i64().ok_or_else(|| mismatch(target_type, other))?,
    };
    narrow(wide).map_err(|_| TypeError::OutOfRange { target_type })
}

fn to_f64(value: &SqlValue, target_type: &'static str) -> Result<f64, TypeError> {
    let v = match value {
        SqlValue::Float(v) => f64::from(*v),
        SqlValue::Double(v) => *v,
        SqlValue::Decimal(d) => d.to_f64().ok_or(TypeError::OutOfRange { target_type })?,
        SqlValue::String(s) => s
            .trim()
            .parse()
            .map_err(|_| mismatch(target_type, value))?,
        other => other.as_i64().ok_or_else(|| mismatch(target_type, other))? as f64,
    };
    if !v.is_finite() {
        return Err(TypeError::OutOfRange { target_type });
    }
    Ok(v)
}

fn to_decimal(value: &SqlValue) -> Result<Decimal, TypeError> {
    match value {
        SqlValue::Decimal(d) => Ok(*d),
        SqlValue::Float(v) => Decimal::try_from(f64::from(*v))
            .map_err(|e| TypeError::InvalidDecimal(e.to_string())),
        SqlValue::Double(v) => {
            Decimal::try_from(*v).map_err(|e| TypeError::InvalidDecimal(e.to_string()))
        }
        SqlValue::String(s) => s
            .trim()
            .parse()
            .map_err(|e: rust_decimal::Error| TypeError::InvalidDecimal(e.to_string())),
        other => other
            .as_i64()
            .map(Decimal::from)
            .ok_or_else(|| mismatch("decimal", other)),
    }
}

/// Round to `scale` and check the result fits `precision` digits.
fn fit_decimal(d: Decimal, precision: u8, scale: u8) -> Result<Decimal, TypeError> {
    if precision == 0 || precision > MAX_PRECISION {
        return Err(TypeError::InvalidDecimal(format!(
            "precision {precision} is outside 1..=38"
        )));
    }
    if scale > precision || scale > MAX_DECIMAL_SCALE {
        return Err(TypeError::InvalidDecimal(format!(
            "scale {scale} is not supported with precision {precision}"
        )));
    }

    let mut fitted =
        d.round_dp_with_strategy(u32::from(scale), RoundingStrategy::MidpointAwayFromZero);
    fitted.rescale(u32::from(scale));
    if fitted.scale() != u32::from(scale) {
        return Err(TypeError::OutOfRange {
            target_type: "decimal",
        });
    }
    if fitted.mantissa().unsigned_abs() >= 10u128.pow(u32::from(precision)) {
        return Err(TypeError::OutOfRange {
            target_type: "decimal",
        });
    }
    Ok(fitted)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_declarations() {
        assert_eq!(TypeDescriptor::Int.declaration(), "int");
        assert_eq!(TypeDescriptor::decimal(18, 4).declaration(), "decimal(18, 4)");
        assert_eq!(TypeDescriptor::nvarchar(50).declaration(), "nvarchar(50)");
        assert_eq!(TypeDescriptor::nvarchar(4001).declaration(), "nvarchar(max)");
        assert_eq!(TypeDescriptor::varbinary(0).declaration(), "varbinary(1)");
    }

    #[test]
    fn test_type_info_shapes() {
        let info = TypeDescriptor::Int.type_info();
        assert_eq!(info.type_id, TypeId::IntN);
        assert_eq!(info.max_length, Some(4));

        let info = TypeDescriptor::nvarchar(10).type_info();
        assert_eq!(info.max_length, Some(20));
        assert!(!info.is_plp());
        assert!(TypeDescriptor::NVarChar(Length::Max).type_info().is_plp());

        let info = TypeDescriptor::decimal(10, 2).type_info();
        assert_eq!(info.max_length, Some(9));
        assert_eq!((info.precision, info.scale), (Some(10), Some(2)));
    }

    #[test]
    fn test_type_info_maps_back() {
        for descriptor in [
            TypeDescriptor::Bit,
            TypeDescriptor::TinyInt,
            TypeDescriptor::SmallInt,
            TypeDescriptor::Int,
            TypeDescriptor::BigInt,
            TypeDescriptor::Real,
            TypeDescriptor::Float,
            TypeDescriptor::decimal(30, 5),
            TypeDescriptor::varchar(20),
            TypeDescriptor::nvarchar(20),
            TypeDescriptor::NVarChar(Length::Max),
            TypeDescriptor::VarBinary(Length::Max),
        ] {
            let back = TypeDescriptor::from_type_info(&descriptor.type_info()).unwrap();
            assert_eq!(back, descriptor);
        }
    }

    #[test]
    fn test_int_range() {
        let int = TypeDescriptor::Int;
        assert_eq!(int.validate(&SqlValue::BigInt(7)).unwrap(), SqlValue::Int(7));
        assert_eq!(
            int.validate(&SqlValue::BigInt(1 << 40)),
            Err(TypeError::OutOfRange { target_type: "int" })
        );
        assert_eq!(
            TypeDescriptor::TinyInt.validate(&SqlValue::Int(-1)),
            Err(TypeError::OutOfRange {
                target_type: "tinyint"
            })
        );
        assert!(int.validate(&SqlValue::Double(1.5)).is_err());
        assert_eq!(int.validate(&"42".into()).unwrap(), SqlValue::Int(42));
        assert!(matches!(
            int.validate(&"abc".into()),
            Err(TypeError::TypeMismatch { expected: "int", .. })
        ));
    }

    #[test]
    fn test_null_is_always_valid() {
        assert_eq!(TypeDescriptor::Bit.encode(&SqlValue::Null).unwrap(), None);
        assert_eq!(
            TypeDescriptor::nvarchar(1).encode(&SqlValue::Null).unwrap(),
            None
        );
    }

    #[test]
    fn test_encode_fixed_widths() {
        assert_eq!(
            TypeDescriptor::Int.encode(&SqlValue::Int(123)).unwrap().unwrap().as_ref(),
            &[123, 0, 0, 0]
        );
        assert_eq!(
            TypeDescriptor::SmallInt.encode(&SqlValue::Int(-2)).unwrap().unwrap().as_ref(),
            &[0xFE, 0xFF]
        );
        assert_eq!(
            TypeDescriptor::Bit.encode(&SqlValue::Bool(true)).unwrap().unwrap().as_ref(),
            &[1]
        );
    }

    #[test]
    fn test_decimal_rounds_to_scale() {
        let d = TypeDescriptor::decimal(5, 2);
        let v = d.validate(&SqlValue::Decimal(Decimal::from_str("1.005").unwrap())).unwrap();
        assert_eq!(v, SqlValue::Decimal(Decimal::from_str("1.01").unwrap()));

        assert_eq!(
            d.validate(&SqlValue::Int(1000)),
            Err(TypeError::OutOfRange {
                target_type: "decimal"
            })
        );
    }

    #[test]
    fn test_decimal_wire_form() {
        let bytes = TypeDescriptor::decimal(9, 2)
            .encode(&SqlValue::Decimal(Decimal::from_str("-12.34").unwrap()))
            .unwrap()
            .unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0xD2, 0x04, 0, 0]);
    }

    #[test]
    fn test_string_length_limits() {
        let short = TypeDescriptor::nvarchar(3);
        assert!(short.validate(&"abc".into()).is_ok());
        assert_eq!(
            short.validate(&"abcd".into()),
            Err(TypeError::Truncation { length: 4, max: 3 })
        );
        assert!(
            TypeDescriptor::NVarChar(Length::Max)
                .validate(&"x".repeat(10_000).into())
                .is_ok()
        );
    }

    #[test]
    fn test_varchar_uses_code_page() {
        let bytes = TypeDescriptor::varchar(10).encode(&"café".into()).unwrap().unwrap();
        assert_eq!(bytes.as_ref(), &[b'c', b'a', b'f', 0xE9]);
        assert!(matches!(
            TypeDescriptor::varchar(10).validate(&"日本".into()),
            Err(TypeError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_nvarchar_is_utf16() {
        let bytes = TypeDescriptor::nvarchar(10).encode(&"hé".into()).unwrap().unwrap();
        assert_eq!(bytes.as_ref(), &[b'h', 0, 0xE9, 0]);
    }

    #[test]
    fn test_for_value_defaults() {
        assert_eq!(
            TypeDescriptor::for_value(&SqlValue::Int(1)),
            TypeDescriptor::Int
        );
        assert_eq!(
            TypeDescriptor::for_value(&"x".into()),
            TypeDescriptor::NVarChar(Length::Limited(4000))
        );
        assert_eq!(
            TypeDescriptor::for_value(&SqlValue::Binary(Bytes::from(vec![0; 9000]))),
            TypeDescriptor::VarBinary(Length::Max)
        );
    }
}
