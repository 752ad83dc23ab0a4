//! Result rows and their column metadata.
//!
//! Rows are materialized when their ROW token arrives: each cell is decoded
//! through the type registry, or decrypted first when its column is
//! protected. Column metadata is shared between all rows of a result set.

use std::sync::Arc;

use mssql_auth::AlwaysEncryptedEngine;
use mssql_types::{FromSql, SqlValue, TypeDescriptor, TypeError, decode_value};
use tds_protocol::token::{ColMetaData, RawRow};
use tds_protocol::{CryptoMetadata, TypeInfo};

use crate::error::Error;

/// Column metadata describing a result set column.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column index (0-based).
    pub index: usize,
    /// Type of the values as the caller sees them. For encrypted columns this
    /// is the plaintext type, not the varbinary the server sends.
    pub type_info: TypeInfo,
    /// Whether the column allows NULL values.
    pub nullable: bool,
    /// Whether the column is protected by Always Encrypted.
    pub encrypted: bool,
    crypto: Option<CryptoMetadata>,
}

impl Column {
    fn from_metadata(index: usize, column: &tds_protocol::token::Column) -> Self {
        Self {
            name: column.name.clone(),
            index,
            type_info: column.plaintext_type().clone(),
            nullable: column.is_nullable(),
            encrypted: column.is_encrypted(),
            crypto: column.crypto.clone(),
        }
    }

    /// The registry type for this column, when it has one.
    #[must_use]
    pub fn descriptor(&self) -> Option<TypeDescriptor> {
        TypeDescriptor::from_type_info(&self.type_info).ok()
    }

    /// SQL type name, e.g. `int` or `nvarchar`.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.descriptor().map_or("unknown", |d| d.name())
    }
}

/// Build the caller-facing columns of a COLMETADATA token.
pub(crate) fn columns_of(meta: &ColMetaData) -> Arc<[Column]> {
    meta.columns
        .iter()
        .enumerate()
        .map(|(i, c)| Column::from_metadata(i, c))
        .collect()
}

/// Decode one ROW token into values, decrypting protected cells.
pub(crate) async fn materialize(
    columns: &Arc<[Column]>,
    meta: &ColMetaData,
    raw: RawRow,
    engine: Option<&AlwaysEncryptedEngine>,
) -> Result<Row, Error> {
    let mut values = Vec::with_capacity(raw.values.len());
    for ((column, wire), cell) in columns.iter().zip(&meta.columns).zip(raw.values) {
        let value = match (&column.crypto, engine, cell) {
            (Some(_), _, None) => SqlValue::Null,
            (Some(crypto), Some(engine), Some(ciphertext)) if crypto.is_encrypted() => {
                engine.decrypt(&ciphertext, crypto).await?
            }
            (_, _, cell) => decode_value(&wire.type_info, cell)?,
        };
        values.push(value);
    }
    Ok(Row::new(Arc::clone(columns), values))
}

/// A row from a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Create a row from columns and decoded values.
    pub fn new(columns: Arc<[Column]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Get a value by column index with type conversion.
    pub fn get<T: FromSql>(&self, index: usize) -> Result<T, TypeError> {
        self.values
            .get(index)
            .ok_or_else(|| TypeError::TypeMismatch {
                expected: "valid column index",
                actual: format!("index {index} out of bounds"),
            })
            .and_then(T::from_sql)
    }

    /// Get a value by column name with type conversion.
    pub fn get_by_name<T: FromSql>(&self, name: &str) -> Result<T, TypeError> {
        let index = self
            .find(name)
            .ok_or_else(|| TypeError::TypeMismatch {
                expected: "valid column name",
                actual: format!("column '{name}' not found"),
            })?;
        self.get(index)
    }

    /// Try to get a value by column index, returning None if NULL or not found.
    pub fn try_get<T: FromSql>(&self, index: usize) -> Option<T> {
        self.values
            .get(index)
            .and_then(|v| T::from_sql_nullable(v).ok().flatten())
    }

    /// The raw value at `index`.
    #[must_use]
    pub fn get_raw(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Check if a column value is NULL. Missing columns count as NULL.
    #[must_use]
    pub fn is_null(&self, index: usize) -> bool {
        self.values.get(index).is_none_or(SqlValue::is_null)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column metadata.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// All values in column order.
    #[must_use]
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Take the values out of the row.
    #[must_use]
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = &'a SqlValue;
    type IntoIter = std::slice::Iter<'a, SqlValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
