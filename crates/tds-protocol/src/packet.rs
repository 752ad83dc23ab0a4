//! TDS packet header definitions.
//!
//! Every logical message travels as one or more packets, each prefixed by an
//! 8-byte header. Multi-byte header fields are big-endian, unlike the rest of
//! the protocol.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// TDS packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Maximum TDS packet size (64KB - 1).
pub const MAX_PACKET_SIZE: usize = 65535;

/// Default TDS packet size.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Smallest packet size a client may negotiate.
pub const MIN_PACKET_SIZE: usize = 512;

/// TDS packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Tabular response from the server.
    TabularResult = 0x04,
    /// Attention signal (header only).
    Attention = 0x06,
    /// Bulk load row data.
    BulkLoad = 0x07,
    /// Federated authentication token.
    FedAuthToken = 0x08,
    /// Transaction manager request.
    TransactionManager = 0x0E,
    /// TDS7+ login packet.
    Tds7Login = 0x10,
    /// SSPI authentication.
    Sspi = 0x11,
    /// Pre-login packet.
    PreLogin = 0x12,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x01 => Self::SqlBatch,
            0x03 => Self::Rpc,
            0x04 => Self::TabularResult,
            0x06 => Self::Attention,
            0x07 => Self::BulkLoad,
            0x08 => Self::FedAuthToken,
            0x0E => Self::TransactionManager,
            0x10 => Self::Tds7Login,
            0x11 => Self::Sspi,
            0x12 => Self::PreLogin,
            _ => return Err(ProtocolError::InvalidPacketType(value)),
        })
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// Normal packet, more packets to follow.
        const NORMAL = 0x00;
        /// Last packet of the logical message.
        const END_OF_MESSAGE = 0x01;
        /// Client asks the server to ignore this message.
        const IGNORE_EVENT = 0x02;
        /// Reset connection before processing this request.
        const RESET_CONNECTION = 0x08;
        /// Reset connection but keep transaction state.
        const RESET_CONNECTION_KEEP_TRANSACTION = 0x10;
    }
}

/// TDS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header.
    pub length: u16,
    /// Server process ID (SPID).
    pub spid: u16,
    /// Packet sequence number, wrapping within `1..=255`.
    pub packet_id: u8,
    /// Reserved, always 0.
    pub window: u8,
}

impl PacketHeader {
    /// Create a new packet header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 1,
            window: 0,
        }
    }

    /// Parse a packet header from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: PACKET_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status_byte = src.get_u8();
        let status = PacketStatus::from_bits(status_byte)
            .ok_or(ProtocolError::InvalidPacketStatus(status_byte))?;

        Ok(Self {
            packet_type,
            status,
            length: src.get_u16(),
            spid: src.get_u16(),
            packet_id: src.get_u8(),
            window: src.get_u8(),
        })
    }

    /// Check the declared length against `8..=max_packet_size`.
    pub fn validate_length(&self, max_packet_size: usize) -> Result<(), ProtocolError> {
        let length = self.length as usize;
        if length < PACKET_HEADER_SIZE || length > max_packet_size {
            return Err(ProtocolError::InvalidPacketLength {
                length,
                max: max_packet_size,
            });
        }
        Ok(())
    }

    /// Encode the packet header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Encode the packet header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Payload length (total length minus header).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Set the packet ID (sequence number).
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }

    /// Set the SPID.
    #[must_use]
    pub const fn with_spid(mut self, spid: u16) -> Self {
        self.spid = spid;
        self
    }
}

/// The sequence number following `id`; 0 is never produced.
#[must_use]
pub const fn next_packet_id(id: u8) -> u8 {
    if id == u8::MAX { 1 } else { id + 1 }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            packet_type: PacketType::Rpc,
            status: PacketStatus::END_OF_MESSAGE,
            length: 100,
            spid: 54,
            packet_id: 3,
            window: 0,
        };

        let bytes = header.encode_to_bytes();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);
        // big-endian length
        assert_eq!(&bytes[2..4], &[0x00, 0x64]);

        let mut cursor = bytes.as_ref();
        assert_eq!(PacketHeader::decode(&mut cursor).unwrap(), header);
    }

    #[test]
    fn test_payload_length() {
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 100);
        assert_eq!(header.payload_length(), 92);
    }

    #[test]
    fn test_validate_length() {
        let short = PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 7);
        assert!(matches!(
            short.validate_length(4096),
            Err(ProtocolError::InvalidPacketLength { length: 7, .. })
        ));

        let long = PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 4097);
        assert!(long.validate_length(4096).is_err());

        let ok = PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 8);
        assert!(ok.validate_length(4096).is_ok());
    }

    #[test]
    fn test_unknown_packet_type() {
        assert_eq!(PacketType::from_u8(0x12).unwrap(), PacketType::PreLogin);
        assert_eq!(
            PacketType::from_u8(0xFF),
            Err(ProtocolError::InvalidPacketType(0xFF))
        );
    }

    #[test]
    fn test_packet_id_wraps_skipping_zero() {
        assert_eq!(next_packet_id(1), 2);
        assert_eq!(next_packet_id(254), 255);
        assert_eq!(next_packet_id(255), 1);
    }
}
