//! # mssql-types
//!
//! The type registry consumed by the request encoder, the bulk-load encoder
//! and row materialization.
//!
//! Framing (length prefixes, PLP chunks) lives in `tds-protocol`'s
//! `TypeInfo`. This crate owns everything that depends on what the bytes
//! *mean*: validating a value against its declared type, turning it into
//! wire bytes and back, and the canonical normalized form Always Encrypted
//! encrypts.
//!
//! ## Type Mappings
//!
//! | SQL Server Type | [`SqlValue`] variant | Rust Type |
//! |-----------------|----------------------|-----------|
//! | `BIT` | `Bool` | `bool` |
//! | `TINYINT` | `TinyInt` | `u8` |
//! | `SMALLINT` | `SmallInt` | `i16` |
//! | `INT` | `Int` | `i32` |
//! | `BIGINT` | `BigInt` | `i64` |
//! | `REAL` | `Float` | `f32` |
//! | `FLOAT` | `Double` | `f64` |
//! | `DECIMAL`/`NUMERIC`/`MONEY` | `Decimal` | `rust_decimal::Decimal` |
//! | `VARCHAR`/`NVARCHAR` | `String` | `String` |
//! | `VARBINARY` | `Binary` | `bytes::Bytes` |
//!
//! ```
//! use mssql_types::{SqlValue, TypeDescriptor, decode_value};
//!
//! let int = TypeDescriptor::Int;
//! let bytes = int.encode(&SqlValue::Int(123)).unwrap();
//! assert_eq!(decode_value(&int.type_info(), bytes).unwrap(), SqlValue::Int(123));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod collation;
pub mod decode;
pub mod descriptor;
pub mod error;
pub mod from_sql;
pub mod normalize;
pub mod to_sql;
pub mod value;

pub use decode::decode_value;
pub use descriptor::{Length, TypeDescriptor};
pub use error::TypeError;
pub use from_sql::FromSql;
pub use normalize::{denormalize, normalize};
pub use to_sql::ToSql;
pub use value::SqlValue;
