//! # tds-protocol
//!
//! The MS-TDS wire grammar used by Microsoft SQL Server: packet headers,
//! PRELOGIN and LOGIN7, RPC payloads, the response token stream, and the
//! Always Encrypted metadata carried inside it.
//!
//! This crate performs no I/O. [`mssql-codec`] frames packets over a byte
//! stream and [`mssql-client`] drives the session on top of both.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{Token, TokenStreamParser, TdsVersion};
//!
//! let mut parser = TokenStreamParser::new(TdsVersion::V7_4);
//! parser.feed(&[0xFD, 0x00, 0x00, 0x00, 0x00]);
//! // DONE needs 12 bytes of body at 7.4; the parser waits for the rest.
//! assert!(parser.next_token().unwrap().is_none());
//! parser.feed(&[0u8; 8]);
//! assert!(matches!(parser.next_token().unwrap(), Some(Token::Done(_))));
//! ```
//!
//! [`mssql-codec`]: https://docs.rs/mssql-codec
//! [`mssql-client`]: https://docs.rs/mssql-client

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod crypto;
pub mod error;
pub mod login7;
pub mod packet;
pub mod prelogin;
pub mod rpc;
pub mod token;
pub mod types;
pub mod version;

pub use crypto::{CekTable, CekTableEntry, CekValue, CryptoMetadata, EncryptionType};
pub use error::ProtocolError;
pub use login7::{FeatureExtension, FeatureId, Login7};
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType,
};
pub use prelogin::{EncryptionLevel, PreLogin};
pub use rpc::{ParamStatus, ProcId, RpcOptions, RpcParam, RpcRequest, encode_sql_batch};
pub use token::{
    ColMetaData, Column, Done, DoneStatus, EnvChange, FeatureExtAck, LoginAck, RawRow,
    ReturnValue, ServerMessage, Token, TokenContext, TokenStreamParser, TokenType,
};
pub use types::{Collation, ColumnFlags, TypeId, TypeInfo};
pub use version::TdsVersion;
