//! Transport acquisition.
//!
//! The client speaks TDS over any [`Transport`]. A [`Connector`] opens one
//! for a host and port and, when PRELOGIN negotiates encryption, upgrades it
//! to TLS. The handshake itself belongs to the connector: in TDS 7.x its
//! records travel inside PRELOGIN packets, which a TLS-capable connector
//! wraps and unwraps.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::Error;

/// A byte stream the client can run a session over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens transports to a server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The stream produced, before and after any TLS upgrade.
    type Stream: Transport;

    /// Open a stream to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> io::Result<Self::Stream>;

    /// Run a TLS handshake over `stream` after PRELOGIN agreed on encryption.
    ///
    /// The default refuses, which suits connectors for trusted networks that
    /// only ever negotiate `NotSupported`.
    async fn upgrade_tls(&self, stream: Self::Stream, host: &str) -> Result<Self::Stream, Error> {
        drop(stream);
        Err(Error::Config(format!(
            "server {host} negotiated TLS but the connector cannot provide it"
        )))
    }
}

/// Plain TCP connector with `TCP_NODELAY` set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        tracing::debug!(host, port, "establishing TCP connection");
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
