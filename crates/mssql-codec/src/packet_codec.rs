//! Packet framing for tokio-util.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    next_packet_id,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::message::Message;

/// A packet with its header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Header. `length` and `packet_id` are rewritten on encode.
    pub header: PacketHeader,
    /// Payload without the header.
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet.
    #[must_use]
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Total size including the header.
    #[must_use]
    pub fn total_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Whether this packet closes its message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// Splits and validates packets against the negotiated packet size.
///
/// As a [`Decoder`] it yields single packets; pair it with
/// [`MessageAssembler`](crate::MessageAssembler) to get whole messages. As an
/// [`Encoder`] it accepts either a ready [`Packet`] or a whole [`Message`],
/// which it splits into `max_packet_size - 8` byte chunks.
#[derive(Debug, Clone)]
pub struct PacketFramer {
    max_packet_size: usize,
    packet_id: u8,
}

impl PacketFramer {
    /// A framer using the default 4096-byte packet size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_PACKET_SIZE)
    }

    /// A framer with a specific packet size, clamped to the protocol maximum.
    #[must_use]
    pub fn with_max_packet_size(size: usize) -> Self {
        Self {
            max_packet_size: size.clamp(PACKET_HEADER_SIZE + 1, MAX_PACKET_SIZE),
            packet_id: 1,
        }
    }

    /// Renegotiate the packet size (after a packet-size ENVCHANGE).
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.clamp(PACKET_HEADER_SIZE + 1, MAX_PACKET_SIZE);
        tracing::debug!(packet_size = self.max_packet_size, "packet size changed");
    }

    /// Current packet size limit.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Largest payload a single packet can carry.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.max_packet_size - PACKET_HEADER_SIZE
    }

    fn take_packet_id(&mut self) -> u8 {
        let id = self.packet_id;
        self.packet_id = next_packet_id(id);
        id
    }

    /// Restart the sequence at 1.
    pub fn reset_packet_id(&mut self) {
        self.packet_id = 1;
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketFramer {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let header = PacketHeader::decode(&mut &src[..PACKET_HEADER_SIZE])?;
        header.validate_length(self.max_packet_size)?;

        let length = header.length as usize;
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut packet = src.split_to(length);
        let payload = packet.split_off(PACKET_HEADER_SIZE).freeze();

        tracing::trace!(
            packet_type = ?header.packet_type,
            length,
            packet_id = header.packet_id,
            eom = header.is_end_of_message(),
            "decoded packet"
        );

        Ok(Some(Packet::new(header, payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::ConnectionClosed { partial: true }),
        }
    }
}

impl Encoder<Packet> for PacketFramer {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total = item.total_size();
        if total > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }

        let mut header = item.header;
        header.length = total as u16;
        header.packet_id = self.take_packet_id();

        dst.reserve(total);
        header.encode(dst);
        dst.put_slice(&item.payload);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = total,
            packet_id = header.packet_id,
            eom = header.is_end_of_message(),
            "encoded packet"
        );
        Ok(())
    }
}

impl Encoder<Message> for PacketFramer {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.reset_packet_id();
        for packet in item.into_packets(self.max_payload()) {
            Encoder::<Packet>::encode(self, packet, dst)?;
        }
        Ok(())
    }
}

/// Header-only ATTENTION packet bytes.
#[must_use]
pub fn attention_packet() -> Bytes {
    PacketHeader::new(
        tds_protocol::PacketType::Attention,
        PacketStatus::END_OF_MESSAGE,
        PACKET_HEADER_SIZE as u16,
    )
    .encode_to_bytes()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::{PacketType, ProtocolError};

    fn raw_packet(length: u16, payload: &[u8]) -> BytesMut {
        let mut data = BytesMut::new();
        data.put_u8(PacketType::TabularResult as u8);
        data.put_u8(PacketStatus::END_OF_MESSAGE.bits());
        data.put_u16(length);
        data.put_u16(0);
        data.put_u8(1);
        data.put_u8(0);
        data.put_slice(payload);
        data
    }

    #[test]
    fn test_decode_packet() {
        let mut framer = PacketFramer::new();
        let mut data = raw_packet(12, b"test");

        let packet = framer.decode(&mut data).unwrap().unwrap();
        assert_eq!(packet.header.packet_type, PacketType::TabularResult);
        assert!(packet.is_end_of_message());
        assert_eq!(&packet.payload[..], b"test");
        assert!(data.is_empty());
    }

    #[test]
    fn test_incomplete_packet_waits() {
        let mut framer = PacketFramer::new();
        let mut data = raw_packet(12, b"te");
        assert!(framer.decode(&mut data).unwrap().is_none());
        data.put_slice(b"st");
        assert!(framer.decode(&mut data).unwrap().is_some());
    }

    #[test]
    fn test_length_below_header_is_fatal() {
        let mut framer = PacketFramer::new();
        let mut data = raw_packet(7, b"");
        assert!(matches!(
            framer.decode(&mut data),
            Err(CodecError::Protocol(ProtocolError::InvalidPacketLength { length: 7, .. }))
        ));
    }

    #[test]
    fn test_length_above_negotiated_is_fatal() {
        let mut framer = PacketFramer::with_max_packet_size(512);
        let mut data = raw_packet(513, &[0; 505]);
        assert!(framer.decode(&mut data).is_err());
    }

    #[test]
    fn test_unknown_packet_type_is_fatal() {
        let mut framer = PacketFramer::new();
        let mut data = raw_packet(8, b"");
        data[0] = 0x55;
        assert!(matches!(
            framer.decode(&mut data),
            Err(CodecError::Protocol(ProtocolError::InvalidPacketType(0x55)))
        ));
    }

    #[test]
    fn test_encode_rewrites_length_and_sequence() {
        let mut framer = PacketFramer::new();
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 0);
        let mut dst = BytesMut::new();
        framer
            .encode(Packet::new(header, Bytes::from_static(b"test")), &mut dst)
            .unwrap();
        framer
            .encode(Packet::new(header, Bytes::from_static(b"x")), &mut dst)
            .unwrap();

        assert_eq!(&dst[2..4], &[0, 12]);
        assert_eq!(dst[6], 1);
        assert_eq!(dst[12 + 6], 2);
    }

    #[test]
    fn test_sequence_wraps_past_zero() {
        let mut framer = PacketFramer::new();
        framer.packet_id = 255;
        assert_eq!(framer.take_packet_id(), 255);
        assert_eq!(framer.take_packet_id(), 1);
    }

    #[test]
    fn test_attention_packet() {
        let bytes = attention_packet();
        assert_eq!(&bytes[..], &[0x06, 0x01, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00]);
    }
}
