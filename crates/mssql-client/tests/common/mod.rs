//! Scripted in-process server for client tests.
//!
//! Each [`MockConnector`] hands out one end of an in-memory duplex pipe per
//! connection attempt; the matching [`MockServer`] speaks just enough TDS to
//! answer PRELOGIN and LOGIN7 and then replays whatever token streams a test
//! gives it.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use mssql_client::{
    Config, Connector, Credentials, EncryptionLevel, RetryPolicy, SqlValue, TypeDescriptor,
};
use mssql_codec::{Connection, Message};
use tds_protocol::token::{
    ColMetaData, Column, Done, DoneStatus, EnvChange, FeatureAck, FeatureExtAck, LoginAck, RawRow,
    ReturnValue, ServerMessage, TokenType,
};
use tds_protocol::{ColumnFlags, FeatureId, PacketType, PreLogin, TdsVersion};
use tokio::io::DuplexStream;

pub const VERSION: TdsVersion = TdsVersion::V7_4;

/// Hands out pre-made pipe ends in order and records every endpoint dialed.
pub struct MockConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
    endpoints: Mutex<Vec<(String, u16)>>,
}

impl MockConnector {
    /// A connector good for `attempts` connections, with their servers.
    pub fn new(attempts: usize) -> (Self, Vec<MockServer>) {
        init_tracing();
        let mut streams = VecDeque::new();
        let mut servers = Vec::new();
        for _ in 0..attempts {
            let (client, server) = tokio::io::duplex(64 * 1024);
            streams.push_back(client);
            servers.push(MockServer {
                conn: Connection::new(server, 4096),
            });
        }
        let connector = Self {
            streams: Mutex::new(streams),
            endpoints: Mutex::new(Vec::new()),
        };
        (connector, servers)
    }

    pub fn endpoints(&self) -> Vec<(String, u16)> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Stream = DuplexStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<DuplexStream> {
        self.endpoints.lock().unwrap().push((host.to_owned(), port));
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no more servers"))
    }
}

/// Route client logs through the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Configuration pointing at the mock server over an unencrypted session.
pub fn config() -> Config {
    Config::new()
        .host("db.test")
        .credentials(Credentials::sql_server("sa", "secret"))
        .database("master")
        .encrypt(EncryptionLevel::NotSupported)
        .retry(
            RetryPolicy::new()
                .max_retries(2)
                .initial_backoff(std::time::Duration::from_millis(1)),
        )
}

/// Server side of one connection.
pub struct MockServer {
    pub conn: Connection<DuplexStream>,
}

impl MockServer {
    /// Answer PRELOGIN and LOGIN7, replying to the login with `response`.
    pub async fn handshake(&mut self, response: BytesMut) {
        let prelogin = self.expect(PacketType::PreLogin).await;
        PreLogin::decode(&prelogin.payload).unwrap();
        self.conn
            .send_message(Message::new(
                PacketType::TabularResult,
                PreLogin::new(EncryptionLevel::NotSupported).encode(),
            ))
            .await
            .unwrap();
        self.expect(PacketType::Tds7Login).await;
        self.reply(response).await;
    }

    /// Log the client in with a plain acknowledgement.
    pub async fn accept_login(&mut self) {
        self.handshake(login_ok()).await;
    }

    /// Read the next message and check its type.
    pub async fn expect(&mut self, packet_type: PacketType) -> Message {
        let message = self.conn.read_message().await.unwrap();
        assert_eq!(message.packet_type, packet_type);
        message
    }

    /// Read a SQL batch and return its text.
    pub async fn expect_batch(&mut self) -> String {
        let message = self.expect(PacketType::SqlBatch).await;
        utf16(&message.payload[22..])
    }

    /// Read an RPC request and return its well-known procedure id.
    pub async fn expect_rpc(&mut self) -> u16 {
        let message = self.expect(PacketType::Rpc).await;
        assert_eq!(&message.payload[22..24], &[0xFF, 0xFF]);
        u16::from_le_bytes([message.payload[24], message.payload[25]])
    }

    pub async fn reply(&mut self, tokens: BytesMut) {
        self.conn
            .send_message(Message::new(PacketType::TabularResult, tokens.freeze()))
            .await
            .unwrap();
    }

    /// Wait for an attention and acknowledge it.
    pub async fn acknowledge_attention(&mut self) {
        self.expect(PacketType::Attention).await;
        let mut tokens = BytesMut::new();
        done(&mut tokens, TokenType::Done, DoneStatus::ATTN, 0);
        self.reply(tokens).await;
    }
}

fn utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).unwrap()
}

// =============================================================================
// Token builders
// =============================================================================

pub fn login_ok() -> BytesMut {
    let mut tokens = BytesMut::new();
    EnvChange::Database {
        new: "master".into(),
        old: String::new(),
    }
    .encode(&mut tokens);
    login_ack(&mut tokens);
    done(&mut tokens, TokenType::Done, DoneStatus::empty(), 0);
    tokens
}

pub fn login_ack(dst: &mut BytesMut) {
    LoginAck {
        interface: 1,
        tds_version: VERSION,
        prog_name: "Microsoft SQL Server".into(),
        prog_version: 0x1000_0000,
    }
    .encode(dst);
}

pub fn column_encryption_ack(dst: &mut BytesMut) {
    FeatureExtAck {
        features: vec![FeatureAck {
            feature_id: FeatureId::ColumnEncryption as u8,
            data: Bytes::from_static(&[1]),
        }],
    }
    .encode(dst);
}

pub fn done(dst: &mut BytesMut, kind: TokenType, status: DoneStatus, rows: u64) {
    let status = if rows > 0 { status | DoneStatus::COUNT } else { status };
    Done {
        status,
        cur_cmd: 0xC1,
        row_count: rows,
    }
    .encode(dst, kind, VERSION);
}

pub fn error(dst: &mut BytesMut, number: i32, class: u8, message: &str) {
    ServerMessage {
        number,
        state: 1,
        class,
        message: message.into(),
        server: "mock".into(),
        procedure: String::new(),
        line: 1,
    }
    .encode(dst, TokenType::Error, VERSION);
}

pub fn return_status(dst: &mut BytesMut, status: i32) {
    dst.put_u8(TokenType::ReturnStatus as u8);
    dst.put_i32_le(status);
}

pub fn return_value(
    dst: &mut BytesMut,
    ordinal: u16,
    name: &str,
    descriptor: TypeDescriptor,
    value: SqlValue,
) {
    ReturnValue {
        ordinal,
        name: name.into(),
        status: 1,
        user_type: 0,
        flags: ColumnFlags::NULLABLE,
        type_info: descriptor.type_info(),
        crypto: None,
        value: descriptor.encode(&value).unwrap(),
    }
    .encode(dst, VERSION);
}

/// One result set: COLMETADATA followed by a ROW per entry of `rows`.
pub fn result_set(
    dst: &mut BytesMut,
    columns: &[(&str, TypeDescriptor)],
    rows: &[Vec<SqlValue>],
) {
    let meta = ColMetaData::new(
        columns
            .iter()
            .map(|(name, d)| Column::new(*name, d.type_info(), ColumnFlags::NULLABLE))
            .collect(),
    );
    meta.encode(dst, VERSION);
    for row in rows {
        let values = columns
            .iter()
            .zip(row)
            .map(|((_, d), v)| d.encode(v).unwrap())
            .collect();
        RawRow { values }.encode(dst, &meta);
    }
}
