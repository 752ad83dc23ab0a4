//! Converting Rust values into parameters.

use bytes::Bytes;
use rust_decimal::Decimal;

use crate::descriptor::TypeDescriptor;
use crate::error::TypeError;
use crate::value::SqlValue;

/// Types that can be bound as a parameter or bulk-load cell.
pub trait ToSql {
    /// Convert this value to a SQL value.
    fn to_sql(&self) -> Result<SqlValue, TypeError>;

    /// The type the value is declared as when no explicit type is given.
    fn descriptor(&self) -> TypeDescriptor {
        match self.to_sql() {
            Ok(value) => TypeDescriptor::for_value(&value),
            Err(_) => TypeDescriptor::NVarChar(crate::Length::Limited(1)),
        }
    }
}

macro_rules! to_sql_by_into {
    ($($ty:ty),*) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> Result<SqlValue, TypeError> {
                    Ok(SqlValue::from(self.clone()))
                }
            }
        )*
    };
}

to_sql_by_into!(bool, u8, i16, i32, i64, f32, f64, Decimal, String, Bytes, Vec<u8>);

impl ToSql for str {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::String(self.to_owned()))
    }
}

impl ToSql for [u8] {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::Binary(Bytes::copy_from_slice(self)))
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(self.clone())
    }
}

impl<T: ToSql> ToSql for Option<T> {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        match self {
            Some(v) => v.to_sql(),
            None => Ok(SqlValue::Null),
        }
    }
}

impl<T: ToSql + ?Sized> ToSql for &T {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        (*self).to_sql()
    }

    fn descriptor(&self) -> TypeDescriptor {
        (*self).descriptor()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_inference() {
        assert_eq!(42i32.descriptor(), TypeDescriptor::Int);
        assert_eq!("hi".descriptor().declaration(), "nvarchar(4000)");
        assert_eq!(Some(1.5f64).descriptor(), TypeDescriptor::Float);
    }

    #[test]
    fn test_option() {
        assert_eq!(Some(42i32).to_sql().unwrap(), SqlValue::Int(42));
        assert_eq!(None::<i32>.to_sql().unwrap(), SqlValue::Null);
    }
}
