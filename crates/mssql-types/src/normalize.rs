//! Always Encrypted normalization.
//!
//! Before encryption a value is converted to a canonical byte form that
//! depends only on its base type, so that deterministic encryption of equal
//! values yields equal ciphertext regardless of the declared length:
//!
//! | Base type | Normalized form |
//! |-----------|-----------------|
//! | bit, tinyint, smallint, int, bigint | 8-byte little-endian `i64` |
//! | real | 4-byte little-endian `f32` |
//! | float | 8-byte little-endian `f64` |
//! | decimal | sign byte, then a 16-byte little-endian magnitude |
//! | nvarchar | UTF-16LE |
//! | varchar | bytes in the column's code page |
//! | varbinary | the bytes themselves |

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::TypeInfo;

use crate::decode::{decode_decimal, decode_utf16, decode_varchar};
use crate::descriptor::{TypeDescriptor, encode_decimal, encode_varchar};
use crate::error::TypeError;
use crate::value::SqlValue;

/// Normalize `value` for encryption under base type `base`.
///
/// NULL is never encrypted and yields `None`.
pub fn normalize(base: &TypeInfo, value: &SqlValue) -> Result<Option<Bytes>, TypeError> {
    let descriptor = TypeDescriptor::from_type_info(base)?;
    let value = descriptor.validate(value)?;

    let mut buf = BytesMut::new();
    match (&descriptor, &value) {
        (_, SqlValue::Null) => return Ok(None),
        (_, SqlValue::Bool(v)) => buf.put_i64_le(i64::from(*v)),
        (_, SqlValue::TinyInt(v)) => buf.put_i64_le(i64::from(*v)),
        (_, SqlValue::SmallInt(v)) => buf.put_i64_le(i64::from(*v)),
        (_, SqlValue::Int(v)) => buf.put_i64_le(i64::from(*v)),
        (_, SqlValue::BigInt(v)) => buf.put_i64_le(*v),
        (_, SqlValue::Float(v)) => buf.put_f32_le(*v),
        (_, SqlValue::Double(v)) => buf.put_f64_le(*v),
        (_, SqlValue::Decimal(d)) => encode_decimal(*d, 16, &mut buf),
        (TypeDescriptor::VarChar(_), SqlValue::String(s)) => {
            return encode_varchar(s, base.collation.as_ref()).map(Some);
        }
        (_, SqlValue::String(s)) => {
            for unit in s.encode_utf16() {
                buf.put_u16_le(unit);
            }
        }
        (_, SqlValue::Binary(b)) => return Ok(Some(b.clone())),
    }
    Ok(Some(buf.freeze()))
}

/// Reverse [`normalize`]: rebuild the native value from decrypted bytes.
pub fn denormalize(base: &TypeInfo, bytes: &[u8]) -> Result<SqlValue, TypeError> {
    let descriptor = TypeDescriptor::from_type_info(base)?;
    let integer = |type_name: &'static str| -> Result<i64, TypeError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            type_name,
            actual: bytes.len(),
        })?;
        Ok(i64::from_le_bytes(raw))
    };
    let out_of_range = |target_type| TypeError::OutOfRange { target_type };

    Ok(match descriptor {
        TypeDescriptor::Bit => SqlValue::Bool(integer("bit")? != 0),
        TypeDescriptor::TinyInt => SqlValue::TinyInt(
            u8::try_from(integer("tinyint")?).map_err(|_| out_of_range("tinyint"))?,
        ),
        TypeDescriptor::SmallInt => SqlValue::SmallInt(
            i16::try_from(integer("smallint")?).map_err(|_| out_of_range("smallint"))?,
        ),
        TypeDescriptor::Int => {
            SqlValue::Int(i32::try_from(integer("int")?).map_err(|_| out_of_range("int"))?)
        }
        TypeDescriptor::BigInt => SqlValue::BigInt(integer("bigint")?),
        TypeDescriptor::Real => {
            let raw: [u8; 4] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
                type_name: "real",
                actual: bytes.len(),
            })?;
            SqlValue::Float(f32::from_le_bytes(raw))
        }
        TypeDescriptor::Float => {
            let raw: [u8; 8] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
                type_name: "float",
                actual: bytes.len(),
            })?;
            SqlValue::Double(f64::from_le_bytes(raw))
        }
        TypeDescriptor::Decimal { scale, .. } => SqlValue::Decimal(decode_decimal(bytes, scale)?),
        TypeDescriptor::VarChar(_) => SqlValue::String(decode_varchar(bytes, base)?),
        TypeDescriptor::NVarChar(_) => SqlValue::String(decode_utf16(bytes)?),
        TypeDescriptor::VarBinary(_) => SqlValue::Binary(Bytes::copy_from_slice(bytes)),
    })
}
