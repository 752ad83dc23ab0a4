//! # mssql-codec
//!
//! Packet framing for TDS over an async byte stream.
//!
//! ```text
//! transport → PacketFramer (packets) → MessageAssembler (messages) → client
//! ```
//!
//! [`PacketFramer`] is a tokio-util `Decoder`/`Encoder` that validates packet
//! headers against the negotiated packet size and splits outbound messages.
//! [`Connection`] splits the transport so an ATTENTION packet can be written
//! through a [`CancelHandle`] while a read is outstanding.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod framed;
pub mod message;
pub mod packet_codec;

pub use connection::{CancelHandle, Connection, StreamingMessage};
pub use error::CodecError;
pub use framed::{PacketReader, PacketWriter};
pub use message::{Message, MessageAssembler};
pub use packet_codec::{Packet, PacketFramer, attention_packet};
