//! # mssql-client
//!
//! Async SQL Server client over TDS 7.4.
//!
//! A [`Client`] owns one session. It negotiates PRELOGIN, logs in, follows
//! routing redirects and retries transient login failures, then runs one
//! request at a time: ad-hoc batches, parameterized `sp_executesql` calls,
//! stored procedures, the prepare/execute/unprepare lifecycle and bulk
//! loads. Columns and parameters protected by Always Encrypted are encrypted
//! and decrypted transparently once the server acknowledges the feature.
//!
//! ## Session states
//!
//! ```text
//! Initial -> Connecting -> SentPrelogin -> [SentTlsNegotiation] -> SentLogin7
//!         -> LoggedIn <-> Executing -> [Attention] -> LoggedIn
//! any state -> Errored | Final
//! ```
//!
//! Every transition goes through a single table in [`state`]; an operation
//! that does not fit the current state is refused with `EINVALIDSTATE`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_client::{Client, Config, Credentials, Request, TypeDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mssql_client::Error> {
//!     let config = Config::new()
//!         .host("localhost")
//!         .credentials(Credentials::sql_server("sa", "secret"))
//!         .database("test");
//!     let mut client = Client::connect(config).await?;
//!
//!     let mut request = Request::new("SELECT name FROM users WHERE id = @id")
//!         .parameter("id", TypeDescriptor::Int, 7);
//!     let mut stream = client.execute(&mut request).await?;
//!     while let Some(row) = stream.next_row().await? {
//!         let name: String = row.get(0)?;
//!         println!("user: {name}");
//!     }
//!
//!     client.close().await
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod bulk;
pub mod client;
pub mod config;
pub mod error;
pub mod request;
pub mod row;
pub mod state;
pub mod stream;
pub mod transport;

pub use bulk::{
    BulkColumn, BulkLoad, BulkLoadEncoder, BulkLoadOptions, BulkRow, ColumnOptions, RowSender,
};
pub use client::{Client, PauseHandle};
pub use config::{Config, RetryPolicy, TimeoutConfig};
pub use error::{
    ECANCEL, EINVALIDSTATE, EPARAM, ETIMEOUT, Error, ErrorClass, RequestError, Result, ServerError,
};
pub use request::{Parameter, Request, RequestKind};
pub use row::{Column, Row};
pub use state::{AttentionReason, ConnectionState};
pub use stream::{ExecuteResult, OutputParam, ResultItem, ResultSet, ResultStream};
pub use transport::{Connector, TcpConnector, Transport};

pub use mssql_auth::{Credentials, InMemoryKeyStore, KeyStoreProvider, KeyStoreRegistry};
pub use mssql_types::{FromSql, Length, SqlValue, ToSql, TypeDescriptor, TypeError};
pub use tds_protocol::{EncryptionLevel, TdsVersion};
