//! Codec error types.

use std::io;

use tds_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while framing packets.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Transport I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A header or payload violated the wire grammar.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An outbound packet would exceed the negotiated size.
    #[error("packet of {size} bytes exceeds maximum {max}")]
    PacketTooLarge {
        /// Total packet size.
        size: usize,
        /// Negotiated maximum.
        max: usize,
    },

    /// The peer closed the stream, possibly mid-message.
    #[error("connection closed (partial message buffered: {partial})")]
    ConnectionClosed {
        /// Whether a message was partially assembled.
        partial: bool,
    },
}

impl CodecError {
    /// Whether the error came from the transport rather than the peer's bytes.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed { .. })
    }
}
