//! Packet streams over the two halves of a split transport.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::Sink;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::CodecError;
use crate::message::Message;
use crate::packet_codec::{Packet, PacketFramer};

pin_project! {
    /// Inbound packets.
    pub struct PacketReader<T> {
        #[pin]
        inner: FramedRead<T, PacketFramer>,
    }
}

impl<T> PacketReader<T>
where
    T: AsyncRead,
{
    /// Read packets with the given framer.
    pub fn new(transport: T, framer: PacketFramer) -> Self {
        Self {
            inner: FramedRead::new(transport, framer),
        }
    }

    /// The framer.
    pub fn framer(&self) -> &PacketFramer {
        self.inner.decoder()
    }

    /// The framer, mutably.
    pub fn framer_mut(&mut self) -> &mut PacketFramer {
        self.inner.decoder_mut()
    }

    /// Bytes read from the transport but not yet framed.
    pub fn buffered(&self) -> usize {
        self.inner.read_buffer().len()
    }

    /// Recover the transport half.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> Stream for PacketReader<T>
where
    T: AsyncRead,
{
    type Item = Result<Packet, CodecError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl<T> std::fmt::Debug for PacketReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("framer", self.inner.decoder())
            .finish_non_exhaustive()
    }
}

pin_project! {
    /// Outbound messages, split into packets on the way out.
    pub struct PacketWriter<T> {
        #[pin]
        inner: FramedWrite<T, PacketFramer>,
    }
}

impl<T> PacketWriter<T>
where
    T: AsyncWrite,
{
    /// Write packets with the given framer.
    pub fn new(transport: T, framer: PacketFramer) -> Self {
        Self {
            inner: FramedWrite::new(transport, framer),
        }
    }

    /// The framer, mutably.
    pub fn framer_mut(&mut self) -> &mut PacketFramer {
        self.inner.encoder_mut()
    }

    /// The framer.
    pub fn framer(&self) -> &PacketFramer {
        self.inner.encoder()
    }

    /// Recover the transport half.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> Sink<Message> for PacketWriter<T>
where
    T: AsyncWrite,
{
    type Error = CodecError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Sink::<Message>::poll_ready(self.project().inner, cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        Sink::<Message>::start_send(self.project().inner, item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Sink::<Message>::poll_flush(self.project().inner, cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Sink::<Message>::poll_close(self.project().inner, cx)
    }
}

impl<T> Sink<Packet> for PacketWriter<T>
where
    T: AsyncWrite,
{
    type Error = CodecError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Sink::<Packet>::poll_ready(self.project().inner, cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Packet) -> Result<(), Self::Error> {
        Sink::<Packet>::start_send(self.project().inner, item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Sink::<Packet>::poll_flush(self.project().inner, cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Sink::<Packet>::poll_close(self.project().inner, cx)
    }
}

impl<T> std::fmt::Debug for PacketWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("framer", self.inner.encoder())
            .finish_non_exhaustive()
    }
}
