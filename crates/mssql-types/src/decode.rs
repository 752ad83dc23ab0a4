//! Interpreting framed value bytes.
//!
//! [`TypeInfo::read_value`](tds_protocol::TypeInfo::read_value) strips the
//! length prefix or PLP chunking; [`decode_value`] turns what is left into a
//! [`SqlValue`].

use bytes::{Buf, Bytes};
use rust_decimal::Decimal;
use tds_protocol::{TypeId, TypeInfo};

use crate::collation::encoding_for;
use crate::error::TypeError;
use crate::value::SqlValue;

/// Decode one value of type `info`. `None` is SQL NULL.
///
/// Types the registry has no rule for (date/time, guid, sql_variant) are
/// returned as their raw wire bytes.
pub fn decode_value(info: &TypeInfo, raw: Option<Bytes>) -> Result<SqlValue, TypeError> {
    let Some(mut raw) = raw else {
        return Ok(SqlValue::Null);
    };

    match info.type_id {
        TypeId::Null => Ok(SqlValue::Null),
        TypeId::Bit | TypeId::BitN => {
            expect_len(&raw, 1, "bit")?;
            Ok(SqlValue::Bool(raw[0] != 0))
        }
        TypeId::Int1 | TypeId::Int2 | TypeId::Int4 | TypeId::Int8 | TypeId::IntN => {
            match raw.len() {
                1 => Ok(SqlValue::TinyInt(raw.get_u8())),
                2 => Ok(SqlValue::SmallInt(raw.get_i16_le())),
                4 => Ok(SqlValue::Int(raw.get_i32_le())),
                8 => Ok(SqlValue::BigInt(raw.get_i64_le())),
                actual => Err(TypeError::InvalidLength {
                    type_name: "int",
                    actual,
                }),
            }
        }
        TypeId::Float4 | TypeId::Float8 | TypeId::FloatN => match raw.len() {
            4 => Ok(SqlValue::Float(raw.get_f32_le())),
            8 => Ok(SqlValue::Double(raw.get_f64_le())),
            actual => Err(TypeError::InvalidLength {
                type_name: "float",
                actual,
            }),
        },
        TypeId::Money | TypeId::Money4 | TypeId::MoneyN => decode_money(raw),
        TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
            decode_decimal(&raw, info.scale.unwrap_or(0)).map(SqlValue::Decimal)
        }
        TypeId::BigVarChar | TypeId::BigChar | TypeId::VarChar | TypeId::Char | TypeId::Text => {
            decode_varchar(&raw, info).map(SqlValue::String)
        }
        TypeId::NVarChar | TypeId::NChar | TypeId::NText | TypeId::Xml => {
            decode_utf16(&raw).map(SqlValue::String)
        }
        _ => Ok(SqlValue::Binary(raw)),
    }
}

fn expect_len(raw: &[u8], len: usize, type_name: &'static str) -> Result<(), TypeError> {
    if raw.len() != len {
        return Err(TypeError::InvalidLength {
            type_name,
            actual: raw.len(),
        });
    }
    Ok(())
}

/// Sign byte then little-endian magnitude of up to 16 bytes.
pub(crate) fn decode_decimal(raw: &[u8], scale: u8) -> Result<Decimal, TypeError> {
    let Some((&sign, magnitude)) = raw.split_first() else {
        return Err(TypeError::InvalidLength {
            type_name: "decimal",
            actual: 0,
        });
    };
    if magnitude.len() > 16 {
        return Err(TypeError::InvalidLength {
            type_name: "decimal",
            actual: raw.len(),
        });
    }

    let mut bytes = [0u8; 16];
    bytes[..magnitude.len()].copy_from_slice(magnitude);
    let mantissa = i128::try_from(u128::from_le_bytes(bytes)).map_err(|_| {
        TypeError::OutOfRange {
            target_type: "decimal",
        }
    })?;
    let signed = if sign == 0 { -mantissa } else { mantissa };

    Decimal::try_from_i128_with_scale(signed, u32::from(scale)).map_err(|_| {
        TypeError::OutOfRange {
            target_type: "decimal",
        }
    })
}

/// money is a 64-bit count of ten-thousandths, sent high dword first.
fn decode_money(mut raw: Bytes) -> Result<SqlValue, TypeError> {
    let units = match raw.len() {
        4 => i64::from(raw.get_i32_le()),
        8 => {
            let high = i64::from(raw.get_i32_le());
            let low = i64::from(raw.get_u32_le());
            (high << 32) | low
        }
        actual => {
            return Err(TypeError::InvalidLength {
                type_name: "money",
                actual,
            });
        }
    };
    Ok(SqlValue::Decimal(Decimal::new(units, 4)))
}

pub(crate) fn decode_utf16(raw: &[u8]) -> Result<String, TypeError> {
    if raw.len() % 2 != 0 {
        return Err(TypeError::InvalidEncoding(
            "odd byte count in UTF-16 data".into(),
        ));
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| TypeError::InvalidEncoding(e.to_string()))
}

pub(crate) fn decode_varchar(raw: &[u8], info: &TypeInfo) -> Result<String, TypeError> {
    let encoding = encoding_for(info.collation.as_ref());
    let (text, had_errors) = encoding.decode_without_bom_handling(raw);
    if had_errors {
        return Err(TypeError::InvalidEncoding(format!(
            "invalid {} data",
            encoding.name()
        )));
    }
    Ok(text.into_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::descriptor::TypeDescriptor;
    use std::str::FromStr;
    use tds_protocol::Collation;

    fn roundtrip(descriptor: TypeDescriptor, value: SqlValue) -> SqlValue {
        let bytes = descriptor.encode(&value).unwrap();
        decode_value(&descriptor.type_info(), bytes).unwrap()
    }

    #[test]
    fn test_int_123() {
        let info = TypeInfo::new(TypeId::IntN).with_max_length(4);
        let value = decode_value(&info, Some(Bytes::from_static(&[123, 0, 0, 0]))).unwrap();
        assert_eq!(value, SqlValue::Int(123));
    }

    #[test]
    fn test_null() {
        let info = TypeInfo::new(TypeId::IntN).with_max_length(4);
        assert_eq!(decode_value(&info, None).unwrap(), SqlValue::Null);
    }

    #[test]
    fn test_wrong_width() {
        let info = TypeInfo::new(TypeId::IntN).with_max_length(4);
        assert_eq!(
            decode_value(&info, Some(Bytes::from_static(&[1, 2, 3]))),
            Err(TypeError::InvalidLength {
                type_name: "int",
                actual: 3
            })
        );
    }

    #[test]
    fn test_registry_roundtrips() {
        let d = Decimal::from_str("-1234567.891").unwrap();
        assert_eq!(
            roundtrip(TypeDescriptor::decimal(20, 3), SqlValue::Decimal(d)),
            SqlValue::Decimal(d)
        );
        assert_eq!(
            roundtrip(TypeDescriptor::Real, SqlValue::Float(2.5)),
            SqlValue::Float(2.5)
        );
        assert_eq!(
            roundtrip(TypeDescriptor::nvarchar(20), "日本語".into()),
            SqlValue::String("日本語".into())
        );
        assert_eq!(
            roundtrip(TypeDescriptor::varchar(20), "naïve".into()),
            SqlValue::String("naïve".into())
        );
    }

    #[test]
    fn test_money() {
        let info = TypeInfo::new(TypeId::MoneyN).with_max_length(8);
        // 1.2345 = 12345 ten-thousandths
        let raw = Bytes::from_static(&[0, 0, 0, 0, 0x39, 0x30, 0, 0]);
        assert_eq!(
            decode_value(&info, Some(raw)).unwrap(),
            SqlValue::Decimal(Decimal::from_str("1.2345").unwrap())
        );
    }

    #[test]
    fn test_varchar_follows_column_collation() {
        let info = TypeInfo::new(TypeId::BigVarChar)
            .with_max_length(10)
            .with_collation(Collation {
                info: 0x0419,
                sort_id: 0,
            });
        let value = decode_value(&info, Some(Bytes::from_static(&[0xC4, 0xE0]))).unwrap();
        assert_eq!(value, SqlValue::String("Да".into()));
    }

    #[test]
    fn test_unmapped_types_are_raw() {
        let info = TypeInfo::new(TypeId::Guid).with_max_length(16);
        let raw = Bytes::from(vec![7u8; 16]);
        assert_eq!(
            decode_value(&info, Some(raw.clone())).unwrap(),
            SqlValue::Binary(raw)
        );
    }
}
