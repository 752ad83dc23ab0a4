//! Extracting Rust values from row cells and output parameters.

use bytes::Bytes;
use rust_decimal::Decimal;

use crate::error::TypeError;
use crate::value::SqlValue;

/// Types that can be read out of a [`SqlValue`].
pub trait FromSql: Sized {
    /// Convert from a SQL value to this type.
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError>;

    /// Like [`from_sql`](Self::from_sql), but NULL becomes `None`.
    fn from_sql_nullable(value: &SqlValue) -> Result<Option<Self>, TypeError> {
        if value.is_null() {
            Ok(None)
        } else {
            Self::from_sql(value).map(Some)
        }
    }
}

macro_rules! from_sql_via {
    ($ty:ty, $name:literal, |$v:ident| $convert:expr) => {
        impl FromSql for $ty {
            fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
                if value.is_null() {
                    return Err(TypeError::UnexpectedNull);
                }
                let $v = value;
                $convert.ok_or_else(|| TypeError::TypeMismatch {
                    expected: $name,
                    actual: value.type_name().to_owned(),
                })
            }
        }
    };
}

from_sql_via!(bool, "bool", |v| v.as_bool());
from_sql_via!(i32, "i32", |v| v.as_i32());
from_sql_via!(i64, "i64", |v| v.as_i64());
from_sql_via!(f64, "f64", |v| v.as_f64());
from_sql_via!(Decimal, "Decimal", |v| v.as_decimal());
from_sql_via!(String, "String", |v| v.as_str().map(str::to_owned));
from_sql_via!(Vec<u8>, "Vec<u8>", |v| v.as_bytes().map(<[u8]>::to_vec));
from_sql_via!(Bytes, "Bytes", |v| match v {
    SqlValue::Binary(b) => Some(b.clone()),
    _ => None,
});
from_sql_via!(u8, "u8", |v| match v {
    SqlValue::TinyInt(n) => Some(*n),
    _ => None,
});
from_sql_via!(i16, "i16", |v| match v {
    SqlValue::SmallInt(n) => Some(*n),
    SqlValue::TinyInt(n) => Some(i16::from(*n)),
    _ => None,
});
from_sql_via!(f32, "f32", |v| match v {
    SqlValue::Float(n) => Some(*n),
    _ => None,
});

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        T::from_sql_nullable(value)
    }
}

impl FromSql for SqlValue {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        Ok(value.clone())
    }
}
