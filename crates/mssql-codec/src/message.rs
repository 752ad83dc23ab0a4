//! Logical message splitting and reassembly.
//!
//! A message spans one or more packets; only the last carries
//! `END_OF_MESSAGE`.

use bytes::{Bytes, BytesMut};
use tds_protocol::packet::{PacketHeader, PacketStatus, PacketType};

use crate::packet_codec::Packet;

/// A complete logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Packet type shared by every packet of the message.
    pub packet_type: PacketType,
    /// Concatenated payload.
    pub payload: Bytes,
    /// Ask the server to reset session state first.
    pub reset_connection: bool,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(packet_type: PacketType, payload: Bytes) -> Self {
        Self {
            packet_type,
            payload,
            reset_connection: false,
        }
    }

    /// Set the RESETCONNECTION flag.
    #[must_use]
    pub fn with_reset_connection(mut self, reset: bool) -> Self {
        self.reset_connection = reset;
        self
    }

    /// Payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Split into packets carrying at most `max_payload` bytes each.
    ///
    /// An empty payload still yields one (header-only) packet. RESETCONNECTION
    /// is only ever set on the first packet.
    #[must_use]
    pub fn into_packets(self, max_payload: usize) -> Vec<Packet> {
        let max_payload = max_payload.max(1);
        let count = self.payload.len().div_ceil(max_payload).max(1);
        let mut packets = Vec::with_capacity(count);
        let mut rest = self.payload;

        for i in 0..count {
            let chunk = rest.split_to(rest.len().min(max_payload));
            let mut status = if i + 1 == count {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            if i == 0 && self.reset_connection {
                status |= PacketStatus::RESET_CONNECTION;
            }
            packets.push(Packet::new(
                PacketHeader::new(self.packet_type, status, 0),
                chunk,
            ));
        }
        packets
    }
}

/// Accumulates packet payloads until `END_OF_MESSAGE`.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: BytesMut,
    packet_type: Option<PacketType>,
    packet_count: usize,
}

impl MessageAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a packet; returns the message it completes, if any.
    pub fn push(&mut self, packet: Packet) -> Option<Message> {
        let packet_type = *self.packet_type.get_or_insert(packet.header.packet_type);
        self.buffer.extend_from_slice(&packet.payload);
        self.packet_count += 1;

        tracing::trace!(
            ?packet_type,
            packet_count = self.packet_count,
            buffered = self.buffer.len(),
            "assembling message"
        );

        if !packet.is_end_of_message() {
            return None;
        }
        self.packet_type = None;
        self.packet_count = 0;
        Some(Message::new(packet_type, self.buffer.split().freeze()))
    }

    /// Whether a message is partially assembled.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.packet_type.is_some()
    }

    /// Packets accumulated for the current message.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packet_count
    }

    /// Drop any partial message.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.packet_type = None;
        self.packet_count = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::packet_codec::PacketFramer;
    use proptest::prelude::*;
    use tokio_util::codec::{Decoder, Encoder};

    fn packet(eom: bool, payload: &'static [u8]) -> Packet {
        let status = if eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        Packet::new(
            PacketHeader::new(PacketType::TabularResult, status, 0),
            Bytes::from_static(payload),
        )
    }

    #[test]
    fn test_multi_packet_message() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.push(packet(false, b"hello ")).is_none());
        assert!(assembler.push(packet(false, b"world")).is_none());
        assert!(assembler.has_partial());
        assert_eq!(assembler.packet_count(), 2);

        let message = assembler.push(packet(true, b"!")).expect("complete");
        assert_eq!(message.packet_type, PacketType::TabularResult);
        assert_eq!(&message.payload[..], b"hello world!");
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_clear_drops_partial() {
        let mut assembler = MessageAssembler::new();
        assembler.push(packet(false, b"partial"));
        assembler.clear();
        assert!(!assembler.has_partial());
        let message = assembler.push(packet(true, b"x")).expect("complete");
        assert_eq!(&message.payload[..], b"x");
    }

    #[test]
    fn test_split_sets_eom_on_last_only() {
        let message = Message::new(PacketType::Rpc, Bytes::from(vec![7u8; 10]))
            .with_reset_connection(true);
        let packets = message.into_packets(4);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].header.status, PacketStatus::RESET_CONNECTION);
        assert_eq!(packets[1].header.status, PacketStatus::NORMAL);
        assert_eq!(packets[2].header.status, PacketStatus::END_OF_MESSAGE);
        assert_eq!(packets[2].payload.len(), 2);
    }

    #[test]
    fn test_empty_message_is_one_packet() {
        let packets = Message::new(PacketType::Attention, Bytes::new()).into_packets(100);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_end_of_message());
    }

    proptest! {
        #[test]
        fn roundtrip_through_framer(
            packet_size in 512usize..1024,
            len in 1usize..4096,
            seed in any::<u8>(),
        ) {
            let payload: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect();
            let original = Message::new(PacketType::TabularResult, Bytes::from(payload));

            let mut framer = PacketFramer::with_max_packet_size(packet_size);
            let mut wire = BytesMut::new();
            framer.encode(original.clone(), &mut wire).unwrap();

            let mut assembler = MessageAssembler::new();
            let mut decoded = Vec::new();
            let mut packets = 0;
            while let Some(p) = framer.decode(&mut wire).unwrap() {
                prop_assert!(p.total_size() <= packet_size);
                packets += 1;
                let eom = p.is_end_of_message();
                if let Some(m) = assembler.push(p) {
                    decoded.push(m);
                } else {
                    prop_assert!(!eom);
                }
            }

            prop_assert_eq!(packets, len.div_ceil(packet_size - 8));
            prop_assert_eq!(decoded, vec![original]);
        }
    }
}
