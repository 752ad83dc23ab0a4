//! Split-I/O packet connection.
//!
//! The transport is split into read and write halves so an ATTENTION packet
//! can be written while a read is outstanding. The write half sits behind an
//! async mutex held for a whole message, so an attention never lands between
//! two packets of the same request.
//!
//! ATTENTION is only meaningful while a request is outstanding. The
//! connection tracks that with a small shared state word, so a
//! [`CancelHandle`] used on an idle connection sends nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tds_protocol::packet::{PacketHeader, PacketStatus, PacketType};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::CodecError;
use crate::framed::{PacketReader, PacketWriter};
use crate::message::{Message, MessageAssembler};
use crate::packet_codec::{Packet, PacketFramer};

const IDLE: u8 = 0;
const ACTIVE: u8 = 1;
const ATTENTION: u8 = 2;

/// A packet-level connection over an async transport.
pub struct Connection<T> {
    reader: PacketReader<ReadHalf<T>>,
    writer: Arc<Mutex<PacketWriter<WriteHalf<T>>>>,
    assembler: MessageAssembler,
    request: Arc<AtomicU8>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a transport, framing with the given packet size.
    pub fn new(transport: T, packet_size: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            reader: PacketReader::new(read_half, PacketFramer::with_max_packet_size(packet_size)),
            writer: Arc::new(Mutex::new(PacketWriter::new(
                write_half,
                PacketFramer::with_max_packet_size(packet_size),
            ))),
            assembler: MessageAssembler::new(),
            request: Arc::new(AtomicU8::new(IDLE)),
        }
    }

    /// A handle that can send ATTENTION from another task.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle<T> {
        CancelHandle {
            writer: Arc::clone(&self.writer),
            request: Arc::clone(&self.request),
        }
    }

    /// Current packet size limit.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.reader.framer().max_packet_size()
    }

    /// Renegotiate the packet size for both directions.
    pub async fn set_packet_size(&mut self, size: usize) {
        self.reader.framer_mut().set_max_packet_size(size);
        self.writer.lock().await.framer_mut().set_max_packet_size(size);
    }

    /// Read the next packet.
    ///
    /// End of stream is reported as [`CodecError::ConnectionClosed`].
    pub async fn read_packet(&mut self) -> Result<Packet, CodecError> {
        match self.reader.next().await {
            Some(result) => result,
            None => Err(CodecError::ConnectionClosed {
                partial: self.assembler.has_partial() || PacketReader::buffered(&self.reader) > 0,
            }),
        }
    }

    /// Read packets until a whole message is assembled.
    pub async fn read_message(&mut self) -> Result<Message, CodecError> {
        loop {
            let packet = self.read_packet().await?;
            if let Some(message) = self.assembler.push(packet) {
                return Ok(message);
            }
        }
    }

    /// Send a whole message, split into packets.
    pub async fn send_message(&self, message: Message) -> Result<(), CodecError> {
        tracing::trace!(
            packet_type = ?message.packet_type,
            len = message.len(),
            "sending message"
        );
        self.writer.lock().await.send(message).await
    }

    /// Send a request message and mark it outstanding.
    ///
    /// The mark is set before the write half is released, so an attention
    /// from a [`CancelHandle`] can only follow the whole request.
    pub async fn send_request(&self, message: Message) -> Result<(), CodecError> {
        tracing::trace!(
            packet_type = ?message.packet_type,
            len = message.len(),
            "sending request"
        );
        let mut writer = self.writer.lock().await;
        writer.send(message).await?;
        self.request.store(ACTIVE, Ordering::Release);
        Ok(())
    }

    /// Mark the outstanding request complete.
    ///
    /// Returns `true` when an attention went out for it that the server has
    /// not acknowledged yet; its DONE is still on the way.
    pub fn end_request(&self) -> bool {
        self.request.swap(IDLE, Ordering::AcqRel) == ATTENTION
    }

    /// Start a request message whose payload is produced piece by piece.
    ///
    /// Full packets go out as soon as they fill, so a slow transport slows
    /// the producer down. The write half stays locked until the message is
    /// finished or aborted, either of which marks the request outstanding.
    pub async fn start_message(&self, packet_type: PacketType) -> StreamingMessage<T> {
        let mut writer = Arc::clone(&self.writer).lock_owned().await;
        writer.framer_mut().reset_packet_id();
        let max_payload = writer.framer().max_payload();
        StreamingMessage {
            writer,
            request: Arc::clone(&self.request),
            packet_type,
            buffer: BytesMut::with_capacity(max_payload),
            max_payload,
        }
    }

    /// Send ATTENTION for the outstanding request.
    ///
    /// See [`CancelHandle::send_attention`].
    pub async fn send_attention(&self) -> Result<bool, CodecError> {
        self.cancel_handle().send_attention().await
    }

    /// Whether an ATTENTION was sent and not yet acknowledged.
    #[must_use]
    pub fn attention_pending(&self) -> bool {
        self.request.load(Ordering::Acquire) == ATTENTION
    }

    /// Record that the server acknowledged the attention, which also ends
    /// the request.
    pub fn clear_attention(&self) {
        self.request.store(IDLE, Ordering::Release);
    }

    /// Close the write direction of the transport.
    ///
    /// Works while [`CancelHandle`]s are alive; later attentions fail.
    pub async fn shutdown(&self) -> Result<(), CodecError> {
        self.request.store(IDLE, Ordering::Release);
        let mut writer = self.writer.lock().await;
        SinkExt::<Message>::close(&mut *writer).await
    }

    /// Reassemble the transport, e.g. to hand it to a TLS handshake.
    ///
    /// Fails while a [`CancelHandle`] is still alive.
    pub fn into_inner(self) -> Result<T, CodecError> {
        let writer = Arc::try_unwrap(self.writer).map_err(|_| {
            CodecError::Io(std::io::Error::other("cancel handle still holds the writer"))
        })?;
        let write_half = writer.into_inner().into_inner();
        Ok(self.reader.into_inner().unsplit(write_half))
    }
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("reader", &self.reader)
            .field("request", &self.request.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// An outbound message being written incrementally.
///
/// Dropping it without [`finish`](Self::finish) or [`abort`](Self::abort)
/// leaves the server waiting for the rest of the message.
pub struct StreamingMessage<T> {
    writer: OwnedMutexGuard<PacketWriter<WriteHalf<T>>>,
    request: Arc<AtomicU8>,
    packet_type: PacketType,
    buffer: BytesMut,
    max_payload: usize,
}

impl<T> StreamingMessage<T>
where
    T: AsyncWrite,
{
    /// Append payload bytes, sending every packet that fills up.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.buffer.extend_from_slice(data);
        // the last chunk is held back so `finish` always has a packet to mark
        while self.buffer.len() > self.max_payload {
            let chunk = self.buffer.split_to(self.max_payload).freeze();
            self.send(PacketStatus::NORMAL, chunk).await?;
        }
        Ok(())
    }

    /// Send the remaining bytes with `END_OF_MESSAGE`.
    pub async fn finish(mut self) -> Result<(), CodecError> {
        let chunk = self.buffer.split().freeze();
        self.send(PacketStatus::END_OF_MESSAGE, chunk).await?;
        self.request.store(ACTIVE, Ordering::Release);
        Ok(())
    }

    /// End the message with the ignore bit set so the server discards it.
    pub async fn abort(mut self) -> Result<(), CodecError> {
        tracing::debug!(packet_type = ?self.packet_type, "aborting streamed message");
        self.buffer.clear();
        self.send(
            PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE_EVENT,
            Bytes::new(),
        )
        .await?;
        // the server still answers the attention that follows
        self.request.store(ACTIVE, Ordering::Release);
        Ok(())
    }

    async fn send(&mut self, status: PacketStatus, payload: Bytes) -> Result<(), CodecError> {
        let packet = Packet::new(PacketHeader::new(self.packet_type, status, 0), payload);
        self.writer.send(packet).await
    }
}

impl<T> std::fmt::Debug for StreamingMessage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingMessage")
            .field("packet_type", &self.packet_type)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

/// Sends ATTENTION on a shared connection.
pub struct CancelHandle<T> {
    writer: Arc<Mutex<PacketWriter<WriteHalf<T>>>>,
    request: Arc<AtomicU8>,
}

impl<T> CancelHandle<T>
where
    T: AsyncWrite,
{
    /// Send a header-only ATTENTION packet for the outstanding request.
    ///
    /// Returns `false` without writing anything when no request is
    /// outstanding or an attention for it is already on the wire.
    pub async fn send_attention(&self) -> Result<bool, CodecError> {
        let mut writer = self.writer.lock().await;
        if self
            .request
            .compare_exchange(ACTIVE, ATTENTION, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("no request to attend to, attention not sent");
            return Ok(false);
        }
        tracing::debug!("sending attention");
        writer
            .send(Message::new(PacketType::Attention, Bytes::new()))
            .await?;
        Ok(true)
    }
}

impl<T> CancelHandle<T> {
    /// Whether an acknowledgement is still outstanding.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.request.load(Ordering::Acquire) == ATTENTION
    }
}

impl<T> Clone for CancelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            request: Arc::clone(&self.request),
        }
    }
}

impl<T> std::fmt::Debug for CancelHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}
