//! Bulk Copy Protocol (BCP) support.
//!
//! A [`BulkLoad`] declares a target table's columns and collects rows, either
//! buffered up front with [`BulkLoad::add_row`] or streamed from another
//! task through a [`RowSender`]. [`Client::execute_bulk_load`] runs the
//! `insert bulk` statement and then sends the rows as a bulk load message
//! (packet type 0x07):
//!
//! - one COLMETADATA token, written before the first row
//! - one ROW token per row
//! - one DONE token with final status
//!
//! ```rust,ignore
//! let mut bulk = BulkLoad::new("dbo.Users");
//! bulk.add_column("id", TypeDescriptor::Int, ColumnOptions::new().nullable(false))?;
//! bulk.add_column("name", TypeDescriptor::nvarchar(50), ColumnOptions::new())?;
//!
//! let rows = bulk.row_sender(64)?;
//! tokio::spawn(async move {
//!     for (id, name) in users {
//!         rows.send(vec![SqlValue::from(id), SqlValue::from(name)]).await?;
//!     }
//!     Ok::<_, Error>(())
//! });
//! let inserted = client.execute_bulk_load(&mut bulk).await?;
//! ```
//!
//! [`Client::execute_bulk_load`]: crate::Client::execute_bulk_load

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use mssql_types::{Length, SqlValue, TypeDescriptor};
use tds_protocol::token::{ColMetaData, Column, Done, RawRow, TokenType};
use tds_protocol::{ColumnFlags, TdsVersion};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, RequestError};

/// Table hints appended to the `insert bulk` statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkLoadOptions {
    /// Enforce CHECK constraints.
    pub check_constraints: bool,
    /// Fire INSERT triggers.
    pub fire_triggers: bool,
    /// Keep NULLs instead of applying column defaults.
    pub keep_nulls: bool,
    /// Take a table-level lock.
    pub lock_table: bool,
}

impl BulkLoadOptions {
    /// ` WITH (...)` for the options that are set, or nothing.
    fn hints(&self) -> String {
        let hints: Vec<&str> = [
            (self.check_constraints, "CHECK_CONSTRAINTS"),
            (self.fire_triggers, "FIRE_TRIGGERS"),
            (self.keep_nulls, "KEEP_NULLS"),
            (self.lock_table, "TABLOCK"),
        ]
        .into_iter()
        .filter_map(|(set, hint)| set.then_some(hint))
        .collect();

        if hints.is_empty() {
            String::new()
        } else {
            format!(" WITH ({})", hints.join(","))
        }
    }
}

/// Per-column options for [`BulkLoad::add_column`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnOptions {
    length: Option<Length>,
    precision: Option<u8>,
    scale: Option<u8>,
    obj_name: Option<String>,
    nullable: bool,
}

impl Default for ColumnOptions {
    fn default() -> Self {
        Self {
            length: None,
            precision: None,
            scale: None,
            obj_name: None,
            nullable: true,
        }
    }
}

impl ColumnOptions {
    /// Defaults: nullable, type's own length, precision and scale.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared length of a variable-length column.
    #[must_use]
    pub fn length(mut self, length: Length) -> Self {
        self.length = Some(length);
        self
    }

    /// Decimal precision.
    #[must_use]
    pub fn precision(mut self, precision: u8) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Decimal scale.
    #[must_use]
    pub fn scale(mut self, scale: u8) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Key used to find the column's value in named rows.
    #[must_use]
    pub fn obj_name(mut self, name: impl Into<String>) -> Self {
        self.obj_name = Some(name.into());
        self
    }

    /// Whether the column accepts NULL.
    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// A declared bulk load column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkColumn {
    /// Column name in the target table.
    pub name: String,
    /// Column type with length, precision and scale applied.
    pub descriptor: TypeDescriptor,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Key in named rows.
    pub obj_name: String,
}

/// One row for a bulk load.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkRow {
    /// Values in column order.
    Positional(Vec<SqlValue>),
    /// Values keyed by each column's `obj_name`. Missing keys are NULL.
    Named(HashMap<String, SqlValue>),
}

impl From<Vec<SqlValue>> for BulkRow {
    fn from(values: Vec<SqlValue>) -> Self {
        Self::Positional(values)
    }
}

impl From<HashMap<String, SqlValue>> for BulkRow {
    fn from(values: HashMap<String, SqlValue>) -> Self {
        Self::Named(values)
    }
}

/// Sends rows into a running bulk load.
///
/// Backed by a bounded channel: `send` waits while the connection is still
/// writing earlier rows. Dropping every sender ends the row stream.
#[derive(Debug, Clone)]
pub struct RowSender {
    tx: mpsc::Sender<BulkRow>,
}

impl RowSender {
    /// Queue a row, waiting for room.
    pub async fn send(&self, row: impl Into<BulkRow>) -> Result<(), Error> {
        self.tx
            .send(row.into())
            .await
            .map_err(|_| Error::cancelled())
    }
}

/// A bulk load into one table.
#[derive(Debug)]
pub struct BulkLoad {
    table: String,
    options: BulkLoadOptions,
    columns: Vec<BulkColumn>,
    rows: Vec<Vec<SqlValue>>,
    receiver: Option<mpsc::Receiver<BulkRow>>,
    streaming: bool,
    columns_closed: bool,
    started: bool,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl BulkLoad {
    /// A bulk load into `table` with default options.
    pub fn new(table: impl Into<String>) -> Self {
        Self::with_options(table, BulkLoadOptions::default())
    }

    /// A bulk load into `table`.
    pub fn with_options(table: impl Into<String>, options: BulkLoadOptions) -> Self {
        Self {
            table: table.into(),
            options,
            columns: Vec::new(),
            rows: Vec::new(),
            receiver: None,
            streaming: false,
            columns_closed: false,
            started: false,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Declare the next column.
    ///
    /// Fails once a row was added, streaming was enabled or the load started.
    pub fn add_column(
        &mut self,
        name: impl Into<String>,
        descriptor: TypeDescriptor,
        options: ColumnOptions,
    ) -> Result<(), Error> {
        if self.columns_closed {
            return Err(RequestError::invalid_state(
                "Columns cannot be added to bulk insert after the first row has been written.",
            )
            .into());
        }
        let name = name.into();
        let mut descriptor = descriptor.with_precision(options.precision, options.scale);
        if let Some(length) = options.length {
            descriptor = descriptor.with_length(length);
        }
        self.columns.push(BulkColumn {
            obj_name: options.obj_name.unwrap_or_else(|| name.clone()),
            name,
            descriptor,
            nullable: options.nullable,
        });
        Ok(())
    }

    /// Buffer a row. Values are validated now, so a bad row fails here.
    pub fn add_row(&mut self, row: impl Into<BulkRow>) -> Result<(), Error> {
        if self.streaming || self.started {
            return Err(RequestError::invalid_state(
                "Rows cannot be added to a bulk load that is streaming or executing.",
            )
            .into());
        }
        let values = self.resolve_row(row.into())?;
        self.columns_closed = true;
        self.rows.push(values);
        Ok(())
    }

    /// Switch to streaming rows from a [`RowSender`] with room for
    /// `capacity` queued rows.
    pub fn row_sender(&mut self, capacity: usize) -> Result<RowSender, Error> {
        if !self.rows.is_empty() || self.started || self.streaming {
            return Err(RequestError::invalid_state(
                "Streaming can only be enabled before rows are added or the load starts.",
            )
            .into());
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.receiver = Some(rx);
        self.streaming = true;
        self.columns_closed = true;
        Ok(RowSender { tx })
    }

    /// Stop the load. A running load then fails with `Canceled.`; rows not
    /// yet written are never sent.
    pub fn cancel(&self) {
        tracing::debug!(table = %self.table, "bulk load cancel requested");
        self.cancel.cancel();
    }

    /// Token that cancels this load from another task.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Override the command timeout for this load.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The timeout override, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Target table.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Declared columns.
    #[must_use]
    pub fn columns(&self) -> &[BulkColumn] {
        &self.columns
    }

    /// Rows buffered with [`add_row`](Self::add_row).
    #[must_use]
    pub fn buffered_rows(&self) -> usize {
        self.rows.len()
    }

    /// The `insert bulk` statement that precedes the rows.
    #[must_use]
    pub fn sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("[{}] {}", c.name, c.descriptor.declaration()))
            .collect();
        format!(
            "insert bulk {}({}){}",
            self.table,
            columns.join(", "),
            self.options.hints()
        )
    }

    /// DDL for a table matching the declared columns.
    #[must_use]
    pub fn table_creation_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let null = if c.nullable { "NULL" } else { "NOT NULL" };
                format!("[{}] {} {}", c.name, c.descriptor.declaration(), null)
            })
            .collect();
        format!("CREATE TABLE {}(\n{}\n)", self.table, columns.join(",\n"))
    }

    /// Mark the load as executing; columns and rows are closed from here on.
    pub(crate) fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Err(RequestError::invalid_state("The bulk load has already been executed.").into());
        }
        if self.columns.is_empty() {
            return Err(RequestError::invalid_state("A bulk load needs at least one column.").into());
        }
        self.started = true;
        self.columns_closed = true;
        Ok(())
    }

    pub(crate) fn encoder(&self, version: TdsVersion) -> BulkLoadEncoder {
        BulkLoadEncoder::new(&self.columns, version)
    }

    pub(crate) fn take_rows(&mut self) -> Vec<Vec<SqlValue>> {
        std::mem::take(&mut self.rows)
    }

    pub(crate) fn take_receiver(&mut self) -> Option<mpsc::Receiver<BulkRow>> {
        self.receiver.take()
    }

    /// Put a row's values in column order and validate them.
    pub(crate) fn resolve_row(&self, row: BulkRow) -> Result<Vec<SqlValue>, Error> {
        let values = match row {
            BulkRow::Positional(values) => {
                if values.len() != self.columns.len() {
                    return Err(RequestError::invalid_state(format!(
                        "Row has {} values but {} columns were declared.",
                        values.len(),
                        self.columns.len()
                    ))
                    .into());
                }
                values
            }
            BulkRow::Named(mut values) => self
                .columns
                .iter()
                .map(|c| values.remove(&c.obj_name).unwrap_or(SqlValue::Null))
                .collect(),
        };

        self.columns
            .iter()
            .zip(values)
            .map(|(column, value)| {
                if value.is_null() && !column.nullable {
                    return Err(Error::from(RequestError::param(
                        &column.name,
                        "NULL is not allowed.",
                    )));
                }
                column
                    .descriptor
                    .validate(&value)
                    .map_err(|e| Error::from(RequestError::param(&column.name, e)))
            })
            .collect()
    }
}

/// Turns declared columns and rows into the bulk load token stream.
#[derive(Debug)]
pub struct BulkLoadEncoder {
    metadata: ColMetaData,
    columns: Vec<(String, TypeDescriptor)>,
    version: TdsVersion,
    metadata_written: bool,
    rows: u64,
}

impl BulkLoadEncoder {
    /// An encoder for the given columns.
    #[must_use]
    pub fn new(columns: &[BulkColumn], version: TdsVersion) -> Self {
        let metadata = ColMetaData::new(
            columns
                .iter()
                .map(|c| {
                    let mut flags = ColumnFlags::UPDATEABLE_READ_WRITE;
                    if c.nullable {
                        flags |= ColumnFlags::NULLABLE;
                    }
                    Column::new(&c.name, c.descriptor.type_info(), flags)
                })
                .collect(),
        );
        Self {
            metadata,
            columns: columns
                .iter()
                .map(|c| (c.name.clone(), c.descriptor))
                .collect(),
            version,
            metadata_written: false,
            rows: 0,
        }
    }

    /// Append one ROW token, preceded by COLMETADATA for the first row.
    pub fn encode_row(&mut self, values: &[SqlValue], dst: &mut BytesMut) -> Result<(), Error> {
        let cells = self
            .columns
            .iter()
            .zip(values)
            .map(|((name, descriptor), value)| {
                descriptor
                    .encode(value)
                    .map_err(|e| Error::from(RequestError::param(name, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.write_metadata(dst);
        RawRow { values: cells }.encode(dst, &self.metadata);
        self.rows += 1;
        Ok(())
    }

    /// Append the terminating DONE, plus COLMETADATA if no row was written.
    pub fn finish(&mut self, dst: &mut BytesMut) {
        self.write_metadata(dst);
        Done::final_done().encode(dst, TokenType::Done, self.version);
    }

    /// Rows encoded so far.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn write_metadata(&mut self, dst: &mut BytesMut) {
        if !self.metadata_written {
            self.metadata.encode(dst, self.version);
            self.metadata_written = true;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::{EINVALIDSTATE, EPARAM};
    use tds_protocol::TokenStreamParser;
    use tds_protocol::token::{DoneStatus, Token};

    fn users() -> BulkLoad {
        let mut bulk = BulkLoad::new("dbo.Users");
        bulk.add_column("id", TypeDescriptor::Int, ColumnOptions::new().nullable(false))
            .unwrap();
        bulk.add_column(
            "name",
            TypeDescriptor::nvarchar(1),
            ColumnOptions::new()
                .length(Length::Limited(50))
                .obj_name("userName"),
        )
        .unwrap();
        bulk
    }

    #[test]
    fn test_insert_bulk_sql() {
        let bulk = users();
        assert_eq!(
            bulk.sql(),
            "insert bulk dbo.Users([id] int, [name] nvarchar(50))"
        );

        let mut options = BulkLoadOptions {
            keep_nulls: true,
            lock_table: true,
            ..BulkLoadOptions::default()
        };
        assert_eq!(options.hints(), " WITH (KEEP_NULLS,TABLOCK)");
        options.check_constraints = true;
        options.fire_triggers = true;
        assert_eq!(
            options.hints(),
            " WITH (CHECK_CONSTRAINTS,FIRE_TRIGGERS,KEEP_NULLS,TABLOCK)"
        );
    }

    #[test]
    fn test_table_creation_sql() {
        let mut bulk = users();
        bulk.add_column(
            "balance",
            TypeDescriptor::decimal(18, 0),
            ColumnOptions::new().precision(10).scale(2),
        )
        .unwrap();
        assert_eq!(
            bulk.table_creation_sql(),
            "CREATE TABLE dbo.Users(\n[id] int NOT NULL,\n[name] nvarchar(50) NULL,\n[balance] decimal(10, 2) NULL\n)"
        );
    }

    #[test]
    fn test_add_column_after_row_fails() {
        let mut bulk = users();
        bulk.add_row(vec![SqlValue::Int(1), SqlValue::from("ann")])
            .unwrap();
        let err = bulk
            .add_column("age", TypeDescriptor::Int, ColumnOptions::new())
            .unwrap_err();
        assert_eq!(err.code(), Some(EINVALIDSTATE));
    }

    #[test]
    fn test_named_rows_use_obj_name() {
        let bulk = users();
        let mut row = HashMap::new();
        row.insert("id".to_owned(), SqlValue::Int(7));
        row.insert("userName".to_owned(), SqlValue::from("bo"));
        let values = bulk.resolve_row(BulkRow::Named(row)).unwrap();
        assert_eq!(values, vec![SqlValue::Int(7), SqlValue::from("bo")]);

        let missing = bulk.resolve_row(BulkRow::Named(HashMap::new())).unwrap_err();
        assert_eq!(missing.code(), Some(EPARAM));
    }

    #[test]
    fn test_invalid_value_rejected() {
        let mut bulk = users();
        let err = bulk
            .add_row(vec![SqlValue::Int(1), SqlValue::from("x".repeat(51))])
            .unwrap_err();
        assert_eq!(err.code(), Some(EPARAM));
        assert!(bulk.add_row(vec![SqlValue::Int(1)]).is_err());
    }

    #[test]
    fn test_rejected_first_row_keeps_columns_open() {
        let mut bulk = users();
        let err = bulk
            .add_row(vec![SqlValue::Null, SqlValue::from("ann")])
            .unwrap_err();
        assert_eq!(err.code(), Some(EPARAM));
        assert_eq!(bulk.buffered_rows(), 0);

        bulk.add_column("age", TypeDescriptor::Int, ColumnOptions::new())
            .unwrap();
        bulk.add_row(vec![SqlValue::Int(1), SqlValue::from("ann"), SqlValue::Null])
            .unwrap();
        assert_eq!(bulk.columns().len(), 3);
    }

    #[test]
    fn test_streaming_excludes_buffered_rows() {
        let mut bulk = users();
        let _sender = bulk.row_sender(4).unwrap();
        assert!(bulk.add_row(vec![SqlValue::Int(1), SqlValue::Null]).is_err());
        assert!(bulk.row_sender(4).is_err());

        let mut buffered = users();
        buffered
            .add_row(vec![SqlValue::Int(1), SqlValue::Null])
            .unwrap();
        assert!(buffered.row_sender(4).is_err());
    }

    #[test]
    fn test_start_closes_the_load() {
        let mut bulk = users();
        bulk.start().unwrap();
        assert!(bulk.start().is_err());
        assert!(bulk.add_row(vec![SqlValue::Int(1), SqlValue::Null]).is_err());
        assert!(BulkLoad::new("t").start().is_err());
    }

    #[test]
    fn test_token_stream_ends_with_single_final_done() {
        let mut bulk = users();
        bulk.add_row(vec![SqlValue::Int(1), SqlValue::from("ann")])
            .unwrap();
        bulk.add_row(vec![SqlValue::Int(2), SqlValue::Null]).unwrap();

        let mut encoder = bulk.encoder(TdsVersion::V7_4);
        let mut buf = BytesMut::new();
        for row in bulk.take_rows() {
            encoder.encode_row(&row, &mut buf).unwrap();
        }
        encoder.finish(&mut buf);
        assert_eq!(encoder.rows(), 2);

        let mut parser = TokenStreamParser::new(TdsVersion::V7_4);
        parser.feed(&buf);
        let tokens = parser.drain().unwrap();
        parser.finish().unwrap();

        let Token::ColMetaData(meta) = &tokens[0] else {
            panic!("expected column metadata");
        };
        assert_eq!(meta.columns.len(), 2);
        // NOT NULL columns are declared without the nullable bit
        assert!(!meta.columns[0].is_nullable());
        assert!(meta.columns[1].is_nullable());
        assert!(
            meta.columns
                .iter()
                .all(|c| c.flags.contains(ColumnFlags::UPDATEABLE_READ_WRITE))
        );
        assert_eq!(
            tokens
                .iter()
                .filter(|t| matches!(t, Token::ColMetaData(_)))
                .count(),
            1
        );
        let Token::Row(first) = &tokens[1] else {
            panic!("expected a row");
        };
        assert_eq!(first.values[0].as_deref(), Some(&1i32.to_le_bytes()[..]));
        assert!(matches!(&tokens[2], Token::Row(row) if row.values[1].is_none()));

        let dones: Vec<_> = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Done(done) => Some(done),
                _ => None,
            })
            .collect();
        assert_eq!(dones.len(), 1);
        assert_eq!(dones[0].status, DoneStatus::empty());
        assert!(matches!(tokens.last(), Some(Token::Done(_))));
    }

    #[test]
    fn test_empty_load_still_sends_metadata() {
        let bulk = users();
        let mut encoder = bulk.encoder(TdsVersion::V7_4);
        let mut buf = BytesMut::new();
        encoder.finish(&mut buf);

        let mut parser = TokenStreamParser::new(TdsVersion::V7_4);
        parser.feed(&buf);
        let tokens = parser.drain().unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(matches!(tokens[1], Token::Done(_)));
    }
}
