//! TDS token stream.
//!
//! A tabular response is a sequence of self-describing tokens, each starting
//! with a one-byte discriminator. [`TokenStreamParser`] owns a byte buffer that
//! callers [`feed`](TokenStreamParser::feed) as packets arrive; when a token is
//! only partially buffered the parser returns `Ok(None)` and retries from the
//! same token boundary once more bytes are fed. A large partial token (a long
//! PLP value, say) is only retried after the buffer has doubled or the caller
//! reports [`end_of_message`](TokenStreamParser::end_of_message), so decoding
//! a value spread over many packets stays linear in its size.
//!
//! Several fields depend on session state: user types and DONE row counts
//! widen at TDS 7.2, COLMETADATA carries a CEK table only when column
//! encryption was negotiated, and ROW/NBCROW can only be framed against the
//! most recent COLMETADATA. That state lives in [`TokenContext`].

use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{
    ensure, read_b_varchar, read_us_varchar, write_b_varchar, write_us_varchar,
};
use crate::crypto::{CekTable, CryptoMetadata, read_user_type, write_user_type};
use crate::error::ProtocolError;
use crate::login7::FeatureId;
use crate::types::{Collation, ColumnFlags, TypeInfo};
use crate::version::TdsVersion;

/// Token discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// OFFSET.
    Offset = 0x78,
    /// RETURNSTATUS.
    ReturnStatus = 0x79,
    /// COLMETADATA.
    ColMetaData = 0x81,
    /// TABNAME.
    TabName = 0xA4,
    /// COLINFO.
    ColInfo = 0xA5,
    /// ORDER.
    Order = 0xA9,
    /// ERROR.
    Error = 0xAA,
    /// INFO.
    Info = 0xAB,
    /// RETURNVALUE.
    ReturnValue = 0xAC,
    /// LOGINACK.
    LoginAck = 0xAD,
    /// FEATUREEXTACK.
    FeatureExtAck = 0xAE,
    /// ROW.
    Row = 0xD1,
    /// NBCROW.
    NbcRow = 0xD2,
    /// ENVCHANGE.
    EnvChange = 0xE3,
    /// SESSIONSTATE.
    SessionState = 0xE4,
    /// SSPI.
    Sspi = 0xED,
    /// FEDAUTHINFO.
    FedAuthInfo = 0xEE,
    /// DONE.
    Done = 0xFD,
    /// DONEPROC.
    DoneProc = 0xFE,
    /// DONEINPROC.
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Map a discriminator byte; anything unlisted is a fatal protocol error.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x78 => Self::Offset,
            0x79 => Self::ReturnStatus,
            0x81 => Self::ColMetaData,
            0xA4 => Self::TabName,
            0xA5 => Self::ColInfo,
            0xA9 => Self::Order,
            0xAA => Self::Error,
            0xAB => Self::Info,
            0xAC => Self::ReturnValue,
            0xAD => Self::LoginAck,
            0xAE => Self::FeatureExtAck,
            0xD1 => Self::Row,
            0xD2 => Self::NbcRow,
            0xE3 => Self::EnvChange,
            0xE4 => Self::SessionState,
            0xED => Self::Sspi,
            0xEE => Self::FedAuthInfo,
            0xFD => Self::Done,
            0xFE => Self::DoneProc,
            0xFF => Self::DoneInProc,
            _ => return Err(ProtocolError::InvalidTokenType(value)),
        })
    }
}

/// A decoded token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Result set column descriptions.
    ColMetaData(Arc<ColMetaData>),
    /// A row, from either ROW or NBCROW.
    Row(RawRow),
    /// End of a SQL statement.
    Done(Done),
    /// End of a stored procedure.
    DoneProc(Done),
    /// End of a statement inside a stored procedure.
    DoneInProc(Done),
    /// Server error message.
    Error(ServerMessage),
    /// Server informational message.
    Info(ServerMessage),
    /// Login accepted.
    LoginAck(LoginAck),
    /// Session environment change.
    EnvChange(EnvChange),
    /// Stored procedure return status.
    ReturnStatus(i32),
    /// Output parameter or UDF return value.
    ReturnValue(ReturnValue),
    /// ORDER BY column ordinals.
    Order(Vec<u16>),
    /// Feature extension acknowledgement.
    FeatureExtAck(FeatureExtAck),
    /// SSPI challenge.
    Sspi(Bytes),
    /// Federated authentication info.
    FedAuthInfo(Bytes),
    /// Session recovery state.
    SessionState(Bytes),
    /// Browse-mode column info.
    ColInfo(Bytes),
    /// Browse-mode table names.
    TabName(Bytes),
    /// Legacy OFFSET token.
    Offset {
        /// Keyword identifier.
        identifier: u16,
        /// Offset length.
        offset_len: u16,
    },
}

/// Session state the token grammar depends on.
#[derive(Debug, Clone, Default)]
pub struct TokenContext {
    /// Negotiated protocol version.
    pub version: TdsVersion,
    /// Whether the server acknowledged column encryption.
    pub column_encryption: bool,
    /// Metadata that subsequent rows are framed against.
    pub metadata: Option<Arc<ColMetaData>>,
}

impl TokenContext {
    /// A context for a freshly negotiated session.
    #[must_use]
    pub fn new(version: TdsVersion) -> Self {
        Self {
            version,
            column_encryption: false,
            metadata: None,
        }
    }
}

/// One column of a COLMETADATA token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// User type.
    pub user_type: u32,
    /// Column flags.
    pub flags: ColumnFlags,
    /// On-the-wire type; varbinary for encrypted columns.
    pub type_info: TypeInfo,
    /// Encryption metadata, when the column is encrypted.
    pub crypto: Option<CryptoMetadata>,
}

impl Column {
    /// A plain column.
    #[must_use]
    pub fn new(name: impl Into<String>, type_info: TypeInfo, flags: ColumnFlags) -> Self {
        Self {
            name: name.into(),
            user_type: 0,
            flags,
            type_info,
            crypto: None,
        }
    }

    /// Whether the column accepts NULL.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.contains(ColumnFlags::NULLABLE)
    }

    /// Whether values arrive encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    /// Type of the decrypted value.
    #[must_use]
    pub fn plaintext_type(&self) -> &TypeInfo {
        self.crypto
            .as_ref()
            .map_or(&self.type_info, |c| &c.base_type)
    }

    fn decode(
        src: &mut impl Buf,
        ctx: &TokenContext,
        cek_table: Option<&CekTable>,
    ) -> Result<Self, ProtocolError> {
        let user_type = read_user_type(src, ctx.version)?;
        ensure(src, 2)?;
        let flags = ColumnFlags::from_bits_retain(src.get_u16_le());
        let type_info = TypeInfo::decode(src)?;
        let crypto = if ctx.column_encryption && flags.contains(ColumnFlags::ENCRYPTED) {
            Some(CryptoMetadata::decode(src, ctx.version, cek_table)?)
        } else {
            None
        };
        let name = read_b_varchar(src)?;
        Ok(Self {
            name,
            user_type,
            flags,
            type_info,
            crypto,
        })
    }

    fn encode(&self, dst: &mut impl BufMut, version: TdsVersion) {
        write_user_type(dst, version, self.user_type);
        dst.put_u16_le(self.flags.bits());
        self.type_info.encode(dst);
        if let Some(crypto) = &self.crypto {
            crypto.encode(dst, version);
        }
        write_b_varchar(dst, &self.name);
    }
}

/// COLMETADATA.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColMetaData {
    /// CEK table, present when column encryption is active.
    pub cek_table: Option<CekTable>,
    /// Columns in result order.
    pub columns: Vec<Column>,
}

impl ColMetaData {
    /// Column count marker for "no metadata".
    pub const NO_METADATA: u16 = 0xFFFF;

    /// Metadata without a CEK table.
    #[must_use]
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            cek_table: None,
            columns,
        }
    }

    /// Decode the body (after the discriminator).
    pub fn decode(src: &mut impl Buf, ctx: &TokenContext) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let count = src.get_u16_le();
        if count == Self::NO_METADATA {
            return Ok(Self::default());
        }

        let cek_table = if ctx.column_encryption {
            Some(CekTable::decode(src)?)
        } else {
            None
        };

        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            columns.push(Column::decode(src, ctx, cek_table.as_ref())?);
        }
        Ok(Self { cek_table, columns })
    }

    /// Encode including the discriminator.
    pub fn encode(&self, dst: &mut impl BufMut, version: TdsVersion) {
        dst.put_u8(TokenType::ColMetaData as u8);
        dst.put_u16_le(self.columns.len() as u16);
        if let Some(table) = &self.cek_table {
            table.encode(dst);
        }
        for column in &self.columns {
            column.encode(dst, version);
        }
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether there are no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A row with each value still in wire form. `None` is SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    /// Framed column values in column order.
    pub values: Vec<Option<Bytes>>,
}

impl RawRow {
    /// Decode a ROW body.
    pub fn decode(src: &mut impl Buf, metadata: &ColMetaData) -> Result<Self, ProtocolError> {
        let values = metadata
            .columns
            .iter()
            .map(|col| col.type_info.read_value(src))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { values })
    }

    /// Decode an NBCROW body: a null bitmap, then only the non-null values.
    pub fn decode_nbc(src: &mut impl Buf, metadata: &ColMetaData) -> Result<Self, ProtocolError> {
        let bitmap_len = metadata.columns.len().div_ceil(8);
        ensure(src, bitmap_len)?;
        let bitmap = src.copy_to_bytes(bitmap_len);

        let mut values = Vec::with_capacity(metadata.columns.len());
        for (i, col) in metadata.columns.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                values.push(None);
            } else {
                values.push(col.type_info.read_value(src)?);
            }
        }
        Ok(Self { values })
    }

    /// Encode as a ROW token.
    pub fn encode(&self, dst: &mut impl BufMut, metadata: &ColMetaData) {
        dst.put_u8(TokenType::Row as u8);
        for (col, value) in metadata.columns.iter().zip(&self.values) {
            col.type_info.write_value(dst, value.as_deref());
        }
    }

    /// Encode as an NBCROW token.
    pub fn encode_nbc(&self, dst: &mut impl BufMut, metadata: &ColMetaData) {
        dst.put_u8(TokenType::NbcRow as u8);
        let mut bitmap = vec![0u8; metadata.columns.len().div_ceil(8)];
        for (i, value) in self.values.iter().enumerate() {
            if value.is_none() {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        dst.put_slice(&bitmap);
        for (col, value) in metadata.columns.iter().zip(&self.values) {
            if let Some(v) = value {
                col.type_info.write_value(dst, Some(v));
            }
        }
    }
}

bitflags! {
    /// DONE status bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is in progress.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention.
        const ATTN = 0x0020;
        /// Severe server error; discard the result set.
        const SRV_ERROR = 0x0100;
    }
}

/// DONE, DONEPROC and DONEINPROC share this body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Done {
    /// Status bits.
    pub status: DoneStatus,
    /// Current command token.
    pub cur_cmd: u16,
    /// Rows affected, valid when `COUNT` is set.
    pub row_count: u64,
}

impl Done {
    /// The terminal DONE of a finished message.
    #[must_use]
    pub const fn final_done() -> Self {
        Self {
            status: DoneStatus::empty(),
            cur_cmd: 0,
            row_count: 0,
        }
    }

    /// Decode the body.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        let wide = version.has_wide_row_count();
        ensure(src, if wide { 12 } else { 8 })?;
        let status = DoneStatus::from_bits_retain(src.get_u16_le());
        let cur_cmd = src.get_u16_le();
        let row_count = if wide {
            src.get_u64_le()
        } else {
            u64::from(src.get_u32_le())
        };
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode with the given discriminator (DONE, DONEPROC or DONEINPROC).
    pub fn encode(&self, dst: &mut impl BufMut, kind: TokenType, version: TdsVersion) {
        dst.put_u8(kind as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        if version.has_wide_row_count() {
            dst.put_u64_le(self.row_count);
        } else {
            dst.put_u32_le(self.row_count as u32);
        }
    }

    /// Whether more results follow in this message.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Whether this acknowledges an attention.
    #[must_use]
    pub fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }

    /// The row count when the server flagged it valid.
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.status
            .contains(DoneStatus::COUNT)
            .then_some(self.row_count)
    }
}

/// ERROR and INFO body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

impl ServerMessage {
    /// Decode the body.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        let mut body = take_us_length(src)?;
        let msg = (|| -> Result<Self, ProtocolError> {
            ensure(&body, 6)?;
            let number = body.get_i32_le();
            let state = body.get_u8();
            let class = body.get_u8();
            let message = read_us_varchar(&mut body)?;
            let server = read_b_varchar(&mut body)?;
            let procedure = read_b_varchar(&mut body)?;
            let line = if version.at_least(TdsVersion::V7_2) {
                ensure(&body, 4)?;
                body.get_i32_le()
            } else {
                ensure(&body, 2)?;
                i32::from(body.get_u16_le())
            };
            Ok(Self {
                number,
                state,
                class,
                message,
                server,
                procedure,
                line,
            })
        })();
        msg.map_err(|e| malformed(e, "message"))
    }

    /// Encode as ERROR or INFO.
    pub fn encode(&self, dst: &mut impl BufMut, kind: TokenType, version: TdsVersion) {
        let mut body = BytesMut::new();
        body.put_i32_le(self.number);
        body.put_u8(self.state);
        body.put_u8(self.class);
        write_us_varchar(&mut body, &self.message);
        write_b_varchar(&mut body, &self.server);
        write_b_varchar(&mut body, &self.procedure);
        if version.at_least(TdsVersion::V7_2) {
            body.put_i32_le(self.line);
        } else {
            body.put_u16_le(self.line as u16);
        }
        dst.put_u8(kind as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }

    /// Severity 20 and above terminates the connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= 20
    }
}

/// LOGINACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// SQL interface type.
    pub interface: u8,
    /// Protocol version the server accepted.
    pub tds_version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Server program version.
    pub prog_version: u32,
}

impl LoginAck {
    /// Decode the body. Unlike LOGIN7, the version is big-endian here.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut body = take_us_length(src)?;
        let ack = (|| -> Result<Self, ProtocolError> {
            ensure(&body, 5)?;
            let interface = body.get_u8();
            let tds_version = TdsVersion::new(body.get_u32());
            let prog_name = read_b_varchar(&mut body)?;
            ensure(&body, 4)?;
            let prog_version = body.get_u32();
            Ok(Self {
                interface,
                tds_version,
                prog_name,
                prog_version,
            })
        })();
        ack.map_err(|e| malformed(e, "loginack"))
    }

    /// Encode including the discriminator.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = BytesMut::new();
        body.put_u8(self.interface);
        body.put_u32(self.tds_version.raw());
        write_b_varchar(&mut body, &self.prog_name);
        body.put_u32(self.prog_version);
        dst.put_u8(TokenType::LoginAck as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }
}

/// ENVCHANGE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    /// Current database changed.
    Database {
        /// New database.
        new: String,
        /// Previous database.
        old: String,
    },
    /// Session language changed.
    Language {
        /// New language.
        new: String,
        /// Previous language.
        old: String,
    },
    /// Packet size renegotiated.
    PacketSize {
        /// New size.
        new: u32,
        /// Previous size.
        old: u32,
    },
    /// Default collation changed.
    SqlCollation(Option<Collation>),
    /// A transaction started; carries the new descriptor.
    BeginTransaction(u64),
    /// The transaction committed.
    CommitTransaction,
    /// The transaction rolled back.
    RollbackTransaction,
    /// Connection reset acknowledged.
    ResetConnectionAck,
    /// Server redirects the client to another endpoint.
    Routing {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
    /// Any other change type, kept as raw bytes.
    Other {
        /// Change type.
        env_type: u8,
        /// Remaining body.
        data: Bytes,
    },
}

impl EnvChange {
    const DATABASE: u8 = 1;
    const LANGUAGE: u8 = 2;
    const PACKET_SIZE: u8 = 4;
    const SQL_COLLATION: u8 = 7;
    const BEGIN_TRANSACTION: u8 = 8;
    const COMMIT_TRANSACTION: u8 = 9;
    const ROLLBACK_TRANSACTION: u8 = 10;
    const RESET_CONNECTION_ACK: u8 = 18;
    const ROUTING: u8 = 20;

    /// Decode the body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut body = take_us_length(src)?;
        let change = (|| -> Result<Self, ProtocolError> {
            ensure(&body, 1)?;
            let env_type = body.get_u8();
            Ok(match env_type {
                Self::DATABASE => Self::Database {
                    new: read_b_varchar(&mut body)?,
                    old: read_b_varchar(&mut body)?,
                },
                Self::LANGUAGE => Self::Language {
                    new: read_b_varchar(&mut body)?,
                    old: read_b_varchar(&mut body)?,
                },
                Self::PACKET_SIZE => {
                    let new = read_b_varchar(&mut body)?;
                    let old = read_b_varchar(&mut body)?;
                    Self::PacketSize {
                        new: parse_packet_size(&new)?,
                        old: old.parse().unwrap_or(0),
                    }
                }
                Self::SQL_COLLATION => {
                    ensure(&body, 1)?;
                    let len = body.get_u8() as usize;
                    ensure(&body, len)?;
                    let collation = if len >= 5 {
                        let mut value = body.copy_to_bytes(len);
                        Some(Collation::decode(&mut value)?)
                    } else {
                        body.advance(len);
                        None
                    };
                    Self::SqlCollation(collation)
                }
                Self::BEGIN_TRANSACTION => {
                    ensure(&body, 1)?;
                    let len = body.get_u8() as usize;
                    ensure(&body, len)?;
                    let mut value = body.copy_to_bytes(len);
                    ensure(&value, 8)?;
                    Self::BeginTransaction(value.get_u64_le())
                }
                Self::COMMIT_TRANSACTION => Self::CommitTransaction,
                Self::ROLLBACK_TRANSACTION => Self::RollbackTransaction,
                Self::RESET_CONNECTION_ACK => Self::ResetConnectionAck,
                Self::ROUTING => {
                    ensure(&body, 2 + 1 + 2)?;
                    let _value_len = body.get_u16_le();
                    let _protocol = body.get_u8();
                    let port = body.get_u16_le();
                    let host = read_us_varchar(&mut body)?;
                    Self::Routing { host, port }
                }
                _ => Self::Other {
                    env_type,
                    data: body.copy_to_bytes(body.remaining()),
                },
            })
        })();
        change.map_err(|e| malformed(e, "envchange"))
    }

    /// Encode including the discriminator.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = BytesMut::new();
        match self {
            Self::Database { new, old } | Self::Language { new, old } => {
                body.put_u8(if matches!(self, Self::Database { .. }) {
                    Self::DATABASE
                } else {
                    Self::LANGUAGE
                });
                write_b_varchar(&mut body, new);
                write_b_varchar(&mut body, old);
            }
            Self::PacketSize { new, old } => {
                body.put_u8(Self::PACKET_SIZE);
                write_b_varchar(&mut body, &new.to_string());
                write_b_varchar(&mut body, &old.to_string());
            }
            Self::SqlCollation(collation) => {
                body.put_u8(Self::SQL_COLLATION);
                match collation {
                    Some(c) => {
                        body.put_u8(5);
                        c.encode(&mut body);
                    }
                    None => body.put_u8(0),
                }
                body.put_u8(0);
            }
            Self::BeginTransaction(descriptor) => {
                body.put_u8(Self::BEGIN_TRANSACTION);
                body.put_u8(8);
                body.put_u64_le(*descriptor);
                body.put_u8(0);
            }
            Self::CommitTransaction | Self::RollbackTransaction => {
                body.put_u8(if matches!(self, Self::CommitTransaction) {
                    Self::COMMIT_TRANSACTION
                } else {
                    Self::ROLLBACK_TRANSACTION
                });
                body.put_u8(0);
                body.put_u8(8);
                body.put_u64_le(0);
            }
            Self::ResetConnectionAck => {
                body.put_u8(Self::RESET_CONNECTION_ACK);
                body.put_u16_le(0);
            }
            Self::Routing { host, port } => {
                body.put_u8(Self::ROUTING);
                let host_len = host.encode_utf16().count() * 2;
                body.put_u16_le((1 + 2 + 2 + host_len) as u16);
                body.put_u8(0); // TCP
                body.put_u16_le(*port);
                write_us_varchar(&mut body, host);
                body.put_u16_le(0);
            }
            Self::Other { env_type, data } => {
                body.put_u8(*env_type);
                body.put_slice(data);
            }
        }
        dst.put_u8(TokenType::EnvChange as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }
}

fn parse_packet_size(s: &str) -> Result<u32, ProtocolError> {
    s.parse().map_err(|_| ProtocolError::InvalidField {
        field: "packet size",
        value: 0,
    })
}

/// Status bit of a RETURNVALUE carrying an output parameter.
pub const RETURN_VALUE_OUTPUT_PARAM: u8 = 0x01;

/// RETURNVALUE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub ordinal: u16,
    /// Parameter name, including the leading `@`.
    pub name: String,
    /// 0x01 output parameter, 0x02 UDF return value.
    pub status: u8,
    /// User type.
    pub user_type: u32,
    /// Flags.
    pub flags: ColumnFlags,
    /// On-the-wire type.
    pub type_info: TypeInfo,
    /// Encryption metadata for encrypted output parameters.
    pub crypto: Option<CryptoMetadata>,
    /// Framed value.
    pub value: Option<Bytes>,
}

impl ReturnValue {
    /// Decode the body.
    pub fn decode(src: &mut impl Buf, ctx: &TokenContext) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let ordinal = src.get_u16_le();
        let name = read_b_varchar(src)?;
        ensure(src, 1)?;
        let status = src.get_u8();
        let user_type = read_user_type(src, ctx.version)?;
        ensure(src, 2)?;
        let flags = ColumnFlags::from_bits_retain(src.get_u16_le());
        let type_info = TypeInfo::decode(src)?;
        let crypto = if ctx.column_encryption && flags.contains(ColumnFlags::ENCRYPTED) {
            Some(CryptoMetadata::decode(src, ctx.version, None)?)
        } else {
            None
        };
        let value = type_info.read_value(src)?;
        Ok(Self {
            ordinal,
            name,
            status,
            user_type,
            flags,
            type_info,
            crypto,
            value,
        })
    }

    /// Encode including the discriminator.
    pub fn encode(&self, dst: &mut impl BufMut, version: TdsVersion) {
        dst.put_u8(TokenType::ReturnValue as u8);
        dst.put_u16_le(self.ordinal);
        write_b_varchar(dst, &self.name);
        dst.put_u8(self.status);
        write_user_type(dst, version, self.user_type);
        dst.put_u16_le(self.flags.bits());
        self.type_info.encode(dst);
        if let Some(crypto) = &self.crypto {
            crypto.encode(dst, version);
        }
        self.type_info.write_value(dst, self.value.as_deref());
    }

    /// Name without the leading `@`.
    #[must_use]
    pub fn param_name(&self) -> &str {
        self.name.strip_prefix('@').unwrap_or(&self.name)
    }
}

/// One acknowledged feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureAck {
    /// Feature id.
    pub feature_id: u8,
    /// Feature data.
    pub data: Bytes,
}

/// FEATUREEXTACK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureExtAck {
    /// Acknowledged features in server order.
    pub features: Vec<FeatureAck>,
}

impl FeatureExtAck {
    /// Decode the body, up to and including the 0xFF terminator.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut features = Vec::new();
        loop {
            ensure(src, 1)?;
            let feature_id = src.get_u8();
            if feature_id == FeatureId::Terminator as u8 {
                break;
            }
            ensure(src, 4)?;
            let len = src.get_u32_le() as usize;
            ensure(src, len)?;
            features.push(FeatureAck {
                feature_id,
                data: src.copy_to_bytes(len),
            });
        }
        Ok(Self { features })
    }

    /// Encode including the discriminator.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::FeatureExtAck as u8);
        for feature in &self.features {
            dst.put_u8(feature.feature_id);
            dst.put_u32_le(feature.data.len() as u32);
            dst.put_slice(&feature.data);
        }
        dst.put_u8(FeatureId::Terminator as u8);
    }

    /// Column encryption version the server agreed to, if any.
    #[must_use]
    pub fn column_encryption_version(&self) -> Option<u8> {
        self.features
            .iter()
            .find(|f| f.feature_id == FeatureId::ColumnEncryption as u8)
            .and_then(|f| f.data.first().copied())
    }
}

impl Token {
    /// Decode one token including its discriminator.
    pub fn decode(src: &mut impl Buf, ctx: &TokenContext) -> Result<Self, ProtocolError> {
        ensure(src, 1)?;
        let token_type = TokenType::from_u8(src.get_u8())?;
        Ok(match token_type {
            TokenType::ColMetaData => Self::ColMetaData(Arc::new(ColMetaData::decode(src, ctx)?)),
            TokenType::Row => {
                let meta = ctx.metadata.as_deref().ok_or(ProtocolError::MissingMetadata)?;
                Self::Row(RawRow::decode(src, meta)?)
            }
            TokenType::NbcRow => {
                let meta = ctx.metadata.as_deref().ok_or(ProtocolError::MissingMetadata)?;
                Self::Row(RawRow::decode_nbc(src, meta)?)
            }
            TokenType::Done => Self::Done(Done::decode(src, ctx.version)?),
            TokenType::DoneProc => Self::DoneProc(Done::decode(src, ctx.version)?),
            TokenType::DoneInProc => Self::DoneInProc(Done::decode(src, ctx.version)?),
            TokenType::Error => Self::Error(ServerMessage::decode(src, ctx.version)?),
            TokenType::Info => Self::Info(ServerMessage::decode(src, ctx.version)?),
            TokenType::LoginAck => Self::LoginAck(LoginAck::decode(src)?),
            TokenType::EnvChange => Self::EnvChange(EnvChange::decode(src)?),
            TokenType::ReturnStatus => {
                ensure(src, 4)?;
                Self::ReturnStatus(src.get_i32_le())
            }
            TokenType::ReturnValue => Self::ReturnValue(ReturnValue::decode(src, ctx)?),
            TokenType::Order => {
                let mut body = take_us_length(src)?;
                let mut ordinals = Vec::with_capacity(body.len() / 2);
                while body.remaining() >= 2 {
                    ordinals.push(body.get_u16_le());
                }
                Self::Order(ordinals)
            }
            TokenType::FeatureExtAck => Self::FeatureExtAck(FeatureExtAck::decode(src)?),
            TokenType::Sspi => Self::Sspi(take_us_length(src)?),
            TokenType::ColInfo => Self::ColInfo(take_us_length(src)?),
            TokenType::TabName => Self::TabName(take_us_length(src)?),
            TokenType::FedAuthInfo => Self::FedAuthInfo(take_u32_length(src)?),
            TokenType::SessionState => Self::SessionState(take_u32_length(src)?),
            TokenType::Offset => {
                ensure(src, 4)?;
                Self::Offset {
                    identifier: src.get_u16_le(),
                    offset_len: src.get_u16_le(),
                }
            }
        })
    }
}

/// Read a u16 length and that many bytes.
fn take_us_length(src: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    ensure(src, 2)?;
    let len = src.get_u16_le() as usize;
    ensure(src, len)?;
    Ok(src.copy_to_bytes(len))
}

/// Read a u32 length and that many bytes.
fn take_u32_length(src: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    ensure(src, 4)?;
    let len = src.get_u32_le() as usize;
    ensure(src, len)?;
    Ok(src.copy_to_bytes(len))
}

/// A short read inside a fully buffered, length-prefixed body is malformed
/// input, not a reason to wait for more bytes.
fn malformed(err: ProtocolError, field: &'static str) -> ProtocolError {
    if err.is_incomplete() {
        ProtocolError::InvalidField { field, value: 0 }
    } else {
        err
    }
}

/// Re-entrant token parser over a growing buffer.
#[derive(Debug, Default)]
pub struct TokenStreamParser {
    buffer: BytesMut,
    context: TokenContext,
    /// An incomplete token is not decoded again until this many bytes are
    /// buffered. Zero retries on every call.
    retry_at: usize,
    #[cfg(test)]
    attempts: usize,
}

/// Partial tokens smaller than this are retried on every call.
const DEFER_THRESHOLD: usize = 16 * 1024;

impl TokenStreamParser {
    /// Create a parser for the given protocol version.
    #[must_use]
    pub fn new(version: TdsVersion) -> Self {
        Self {
            buffer: BytesMut::new(),
            context: TokenContext::new(version),
            retry_at: 0,
            #[cfg(test)]
            attempts: 0,
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// The last bytes of the message have been fed; retry any partial token
    /// on the next call regardless of its size.
    pub fn end_of_message(&mut self) {
        self.retry_at = 0;
    }

    /// Decode the next complete token, or `Ok(None)` if more bytes are needed.
    ///
    /// On `Ok(None)` no bytes are consumed; the partial token is retried once
    /// enough bytes have been fed.
    pub fn next_token(&mut self) -> Result<Option<Token>, ProtocolError> {
        if self.buffer.is_empty() || self.buffer.len() < self.retry_at {
            return Ok(None);
        }

        #[cfg(test)]
        {
            self.attempts += 1;
        }
        let mut cursor: &[u8] = &self.buffer;
        let token = match Token::decode(&mut cursor, &self.context) {
            Ok(token) => token,
            Err(e) if e.is_incomplete() => {
                let buffered = self.buffer.len();
                self.retry_at = if buffered >= DEFER_THRESHOLD {
                    buffered.saturating_mul(2)
                } else {
                    0
                };
                tracing::trace!(buffered, retry_at = self.retry_at, "token incomplete, waiting");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let consumed = self.buffer.len() - cursor.len();
        self.buffer.advance(consumed);
        self.retry_at = 0;

        if let Token::ColMetaData(meta) = &token {
            self.context.metadata = Some(Arc::clone(meta));
        }
        tracing::trace!(consumed, token = ?token_kind(&token), "decoded token");
        Ok(Some(token))
    }

    /// Drain every complete token currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Token>, ProtocolError> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// Check that the message ended on a token boundary.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            let trailing = self.buffer.len();
            self.buffer.clear();
            self.retry_at = 0;
            Err(ProtocolError::TrailingBytes(trailing))
        }
    }

    /// Bytes buffered but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Session context.
    #[must_use]
    pub fn context(&self) -> &TokenContext {
        &self.context
    }

    /// Switch protocol version after LOGINACK.
    pub fn set_version(&mut self, version: TdsVersion) {
        self.context.version = version;
    }

    /// Record whether column encryption was acknowledged.
    pub fn set_column_encryption(&mut self, enabled: bool) {
        self.context.column_encryption = enabled;
    }
}

impl Token {
    /// Token name as written in the protocol documentation, e.g. `DONEPROC`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        token_kind(self)
    }
}

fn token_kind(token: &Token) -> &'static str {
    match token {
        Token::ColMetaData(_) => "COLMETADATA",
        Token::Row(_) => "ROW",
        Token::Done(_) => "DONE",
        Token::DoneProc(_) => "DONEPROC",
        Token::DoneInProc(_) => "DONEINPROC",
        Token::Error(_) => "ERROR",
        Token::Info(_) => "INFO",
        Token::LoginAck(_) => "LOGINACK",
        Token::EnvChange(_) => "ENVCHANGE",
        Token::ReturnStatus(_) => "RETURNSTATUS",
        Token::ReturnValue(_) => "RETURNVALUE",
        Token::Order(_) => "ORDER",
        Token::FeatureExtAck(_) => "FEATUREEXTACK",
        Token::Sspi(_) => "SSPI",
        Token::FedAuthInfo(_) => "FEDAUTHINFO",
        Token::SessionState(_) => "SESSIONSTATE",
        Token::ColInfo(_) => "COLINFO",
        Token::TabName(_) => "TABNAME",
        Token::Offset { .. } => "OFFSET",
    }
}
