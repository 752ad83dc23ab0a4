//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while encoding or decoding the TDS wire grammar.
///
/// Apart from [`ProtocolError::UnexpectedEof`], every variant is fatal to the
/// connection that produced it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer ended before the current structure was complete.
    ///
    /// The token parser treats this as "suspend and wait for more bytes".
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    /// A length-prefixed region claimed more bytes than were available.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes the header declared.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },

    /// Unknown packet type byte in a packet header.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Status byte carried bits outside the defined set.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Packet length outside `8..=max_packet_size`.
    #[error("invalid packet length {length} (allowed 8..={max})")]
    InvalidPacketLength {
        /// Length from the header.
        length: usize,
        /// Negotiated maximum.
        max: usize,
    },

    /// Unknown token discriminator.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// Unknown data type byte in a TYPE_INFO.
    #[error("invalid data type: 0x{0:02X}")]
    InvalidDataType(u8),

    /// Known data type that this implementation does not decode.
    #[error("unsupported data type: 0x{0:02X}")]
    UnsupportedDataType(u8),

    /// Unknown pre-login option.
    #[error("invalid pre-login option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// A field held a value outside its domain.
    #[error("invalid value {value} for field {field}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: u32,
    },

    /// A row arrived before any column metadata.
    #[error("row token without preceding column metadata")]
    MissingMetadata,

    /// A token arrived where the session does not allow it.
    #[error("unexpected {0} token")]
    UnexpectedToken(&'static str),

    /// CryptoMetadata referenced a CEK table entry that does not exist.
    #[error("CEK table ordinal {ordinal} out of range (table has {len} entries)")]
    CekOrdinalOutOfRange {
        /// Ordinal from the column.
        ordinal: u16,
        /// Entries in the table.
        len: usize,
    },

    /// Bytes remained after the final token of a message.
    #[error("{0} trailing bytes after last complete token")]
    TrailingBytes(usize),

    /// String data was not valid UTF-16.
    #[error("string encoding error: {0}")]
    StringEncoding(String),
}

impl ProtocolError {
    /// Whether the error only means "not enough bytes yet".
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::UnexpectedEof | Self::IncompletePacket { .. })
    }
}
