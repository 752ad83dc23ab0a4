//! RPC and SQL batch request payloads.
//!
//! ```text
//! RPC request:
//! +-------------------+
//! | ALL_HEADERS       | transaction descriptor
//! +-------------------+
//! | ProcName/ProcID   | 0xFFFF + id, or US_VARCHAR name
//! +-------------------+
//! | Option flags      | u16
//! +-------------------+
//! | Parameters        | name, status, TYPE_INFO, value [, ParamCipherInfo]
//! +-------------------+
//! ```

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{utf16_byte_len, write_b_varchar, write_utf16_string};
use crate::crypto::CryptoMetadata;
use crate::types::{Collation, TypeId, TypeInfo};

/// Well-known system procedure ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_executesql.
    ExecuteSql = 0x000A,
    /// sp_prepare.
    Prepare = 0x000B,
    /// sp_execute.
    Execute = 0x000C,
    /// sp_prepexec.
    PrepExec = 0x000D,
    /// sp_unprepare.
    Unprepare = 0x000F,
}

bitflags! {
    /// RPC option flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RpcOptions: u16 {
        /// Recompile the procedure.
        const WITH_RECOMPILE = 0x0001;
        /// Suppress metadata in the response.
        const NO_METADATA = 0x0002;
        /// Reuse metadata from the previous call.
        const REUSE_METADATA = 0x0004;
    }
}

bitflags! {
    /// Per-parameter status flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ParamStatus: u8 {
        /// Output parameter.
        const BY_REF = 0x01;
        /// Use the parameter's default value.
        const DEFAULT = 0x02;
        /// Value is ciphertext followed by ParamCipherInfo.
        const ENCRYPTED = 0x08;
    }
}

/// Largest non-MAX varbinary/nvarchar byte length.
const MAX_SHORT_LEN: usize = 8000;
/// `max_length` marking a MAX (PLP) type.
const MAX_LEN_MARKER: u32 = 0xFFFF;

/// A parameter ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcParam {
    /// Name including the leading `@`, or empty for positional.
    pub name: String,
    /// Status flags.
    pub status: ParamStatus,
    /// TYPE_INFO written before the value.
    pub type_info: TypeInfo,
    /// Value bytes without framing; `None` is NULL.
    pub value: Option<Bytes>,
    /// Cipher info for encrypted parameters.
    pub cipher: Option<CryptoMetadata>,
}

impl RpcParam {
    /// A plain parameter.
    pub fn new(name: impl Into<String>, type_info: TypeInfo, value: Option<Bytes>) -> Self {
        Self {
            name: name.into(),
            status: ParamStatus::empty(),
            type_info,
            value,
            cipher: None,
        }
    }

    /// An `nvarchar` parameter, switching to `nvarchar(max)` above 4000 characters.
    pub fn nvarchar(name: impl Into<String>, value: &str) -> Self {
        let mut buf = BytesMut::with_capacity(utf16_byte_len(value));
        write_utf16_string(&mut buf, value);
        let max_length = if buf.len() > MAX_SHORT_LEN {
            MAX_LEN_MARKER
        } else {
            MAX_SHORT_LEN as u32
        };
        let type_info = TypeInfo::new(TypeId::NVarChar)
            .with_max_length(max_length)
            .with_collation(Collation::DEFAULT);
        Self::new(name, type_info, Some(buf.freeze()))
    }

    /// An `int` parameter.
    pub fn int(name: impl Into<String>, value: Option<i32>) -> Self {
        Self::new(
            name,
            TypeInfo::new(TypeId::IntN).with_max_length(4),
            value.map(|v| Bytes::copy_from_slice(&v.to_le_bytes())),
        )
    }

    /// An encrypted parameter: the ciphertext travels as varbinary and the
    /// plaintext type moves into the trailing cipher info.
    pub fn encrypted(name: impl Into<String>, ciphertext: Bytes, cipher: CryptoMetadata) -> Self {
        let max_length = if ciphertext.len() > MAX_SHORT_LEN {
            MAX_LEN_MARKER
        } else {
            MAX_SHORT_LEN as u32
        };
        Self {
            name: name.into(),
            status: ParamStatus::ENCRYPTED,
            type_info: TypeInfo::new(TypeId::BigVarBinary).with_max_length(max_length),
            value: Some(ciphertext),
            cipher: Some(cipher),
        }
    }

    /// Mark as an output parameter.
    #[must_use]
    pub fn as_output(mut self) -> Self {
        self.status |= ParamStatus::BY_REF;
        self
    }

    /// Encode name, status, TYPE_INFO, value and cipher info.
    pub fn encode(&self, dst: &mut impl BufMut) {
        write_b_varchar(dst, &self.name);
        dst.put_u8(self.status.bits());
        self.type_info.encode(dst);
        self.type_info.write_value(dst, self.value.as_deref());
        if let Some(cipher) = &self.cipher {
            cipher.encode_param_cipher_info(dst);
        }
    }
}

/// Which procedure an RPC invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcTarget {
    /// A well-known system procedure.
    Id(ProcId),
    /// A procedure by name.
    Name(String),
}

/// An RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    target: ProcTarget,
    options: RpcOptions,
    params: Vec<RpcParam>,
}

impl RpcRequest {
    /// Call a procedure by name.
    pub fn named(proc_name: impl Into<String>) -> Self {
        Self::new(ProcTarget::Name(proc_name.into()))
    }

    /// Call a well-known system procedure.
    #[must_use]
    pub fn by_id(proc_id: ProcId) -> Self {
        Self::new(ProcTarget::Id(proc_id))
    }

    fn new(target: ProcTarget) -> Self {
        Self {
            target,
            options: RpcOptions::empty(),
            params: Vec::new(),
        }
    }

    /// `sp_executesql(@stmt, @params, ...params)`.
    ///
    /// `declarations` is the `@name type, ...` list; it is omitted when empty.
    #[must_use]
    pub fn execute_sql(sql: &str, declarations: &str, params: Vec<RpcParam>) -> Self {
        let mut request = Self::by_id(ProcId::ExecuteSql).param(RpcParam::nvarchar("@stmt", sql));
        if !declarations.is_empty() {
            request = request.param(RpcParam::nvarchar("@params", declarations));
        }
        request.params.extend(params);
        request
    }

    /// `sp_prepare(@handle OUTPUT, @params, @stmt)`.
    #[must_use]
    pub fn prepare(sql: &str, declarations: &str) -> Self {
        Self::by_id(ProcId::Prepare)
            .param(RpcParam::int("@handle", None).as_output())
            .param(RpcParam::nvarchar("@params", declarations))
            .param(RpcParam::nvarchar("@stmt", sql))
    }

    /// `sp_execute(@handle, ...params)`.
    #[must_use]
    pub fn execute(handle: i32, params: Vec<RpcParam>) -> Self {
        let mut request = Self::by_id(ProcId::Execute).param(RpcParam::int("@handle", Some(handle)));
        request.params.extend(params);
        request
    }

    /// `sp_unprepare(@handle)`.
    #[must_use]
    pub fn unprepare(handle: i32) -> Self {
        Self::by_id(ProcId::Unprepare).param(RpcParam::int("@handle", Some(handle)))
    }

    /// Set option flags.
    #[must_use]
    pub fn with_options(mut self, options: RpcOptions) -> Self {
        self.options = options;
        self
    }

    /// Append a parameter.
    #[must_use]
    pub fn param(mut self, param: RpcParam) -> Self {
        self.params.push(param);
        self
    }

    /// The procedure target.
    #[must_use]
    pub fn target(&self) -> &ProcTarget {
        &self.target
    }

    /// Parameters in wire order.
    #[must_use]
    pub fn params(&self) -> &[RpcParam] {
        &self.params
    }

    /// Encode the payload. Use 0 as the descriptor outside explicit transactions.
    #[must_use]
    pub fn encode(&self, transaction_descriptor: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        write_all_headers(&mut buf, transaction_descriptor);

        match &self.target {
            ProcTarget::Id(id) => {
                buf.put_u16_le(0xFFFF);
                buf.put_u16_le(*id as u16);
            }
            ProcTarget::Name(name) => {
                buf.put_u16_le(name.encode_utf16().count() as u16);
                write_utf16_string(&mut buf, name);
            }
        }
        buf.put_u16_le(self.options.bits());

        for param in &self.params {
            param.encode(&mut buf);
        }
        buf.freeze()
    }
}

/// Write ALL_HEADERS with a single transaction descriptor header.
pub fn write_all_headers(dst: &mut impl BufMut, transaction_descriptor: u64) {
    // total length, then HeaderLength(4) HeaderType(2) descriptor(8) outstanding(4)
    dst.put_u32_le(4 + 18);
    dst.put_u32_le(18);
    dst.put_u16_le(0x0002);
    dst.put_u64_le(transaction_descriptor);
    dst.put_u32_le(1);
}

/// Encode a SQL batch payload: ALL_HEADERS then UTF-16LE text.
#[must_use]
pub fn encode_sql_batch(sql: &str, transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(22 + utf16_byte_len(sql));
    write_all_headers(&mut buf, transaction_descriptor);
    write_utf16_string(&mut buf, sql);
    buf.freeze()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionType;

    #[test]
    fn test_all_headers_prefix() {
        let payload = encode_sql_batch("SELECT 1", 0x0102);
        assert_eq!(&payload[0..4], &22u32.to_le_bytes());
        assert_eq!(&payload[4..8], &18u32.to_le_bytes());
        assert_eq!(&payload[8..10], &[0x02, 0x00]);
        assert_eq!(&payload[10..18], &0x0102u64.to_le_bytes());
        assert_eq!(&payload[22..24], &[b'S', 0]);
        assert_eq!(payload.len(), 22 + 16);
    }

    #[test]
    fn test_execute_sql_layout() {
        let request = RpcRequest::execute_sql(
            "SELECT @p1",
            "@p1 int",
            vec![RpcParam::int("@p1", Some(42))],
        );
        let payload = request.encode(0);
        assert_eq!(&payload[22..26], &[0xFF, 0xFF, 0x0A, 0x00]);
        assert_eq!(&payload[26..28], &[0x00, 0x00]);

        let names: Vec<_> = request.params().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["@stmt", "@params", "@p1"]);
        // @p1: intn(4) with value 42 closes the payload
        assert_eq!(&payload[payload.len() - 7..], &[0x26, 0x04, 0x04, 42, 0, 0, 0]);
    }

    #[test]
    fn test_execute_sql_without_params() {
        let request = RpcRequest::execute_sql("SELECT 1", "", Vec::new());
        assert_eq!(request.params().len(), 1);
    }

    #[test]
    fn test_prepare_execute_unprepare() {
        let prepare = RpcRequest::prepare("SELECT @a", "@a int");
        assert_eq!(prepare.target(), &ProcTarget::Id(ProcId::Prepare));
        let handle = &prepare.params()[0];
        assert_eq!(handle.name, "@handle");
        assert!(handle.status.contains(ParamStatus::BY_REF));
        assert!(handle.value.is_none());

        let execute = RpcRequest::execute(7, vec![RpcParam::int("@a", Some(1))]);
        assert_eq!(execute.params()[0].value.as_deref(), Some(&7i32.to_le_bytes()[..]));
        assert_eq!(execute.params().len(), 2);

        let unprepare = RpcRequest::unprepare(7);
        assert_eq!(unprepare.target(), &ProcTarget::Id(ProcId::Unprepare));
    }

    #[test]
    fn test_named_procedure() {
        let payload = RpcRequest::named("dbo.p").encode(0);
        assert_eq!(&payload[22..24], &[5, 0]);
        assert_eq!(&payload[24..34], &[b'd', 0, b'b', 0, b'o', 0, b'.', 0, b'p', 0]);
    }

    #[test]
    fn test_long_nvarchar_uses_max() {
        let param = RpcParam::nvarchar("@s", &"x".repeat(4001));
        assert_eq!(param.type_info.max_length, Some(0xFFFF));
        assert!(param.type_info.is_plp());
    }

    #[test]
    fn test_encrypted_param_appends_cipher_info() {
        let cipher = CryptoMetadata {
            ordinal: 0,
            user_type: 0,
            base_type: TypeInfo::new(TypeId::IntN).with_max_length(4),
            algorithm_id: 2,
            algorithm_name: None,
            encryption_type: EncryptionType::Randomized,
            normalization_version: 1,
            cek: None,
        };
        let param = RpcParam::encrypted("@x", Bytes::from_static(&[0xAB; 3]), cipher);
        let mut buf = BytesMut::new();
        param.encode(&mut buf);

        let mut expected = BytesMut::new();
        write_b_varchar(&mut expected, "@x");
        expected.put_u8(0x08);
        expected.put_slice(&[0xA5, 0x40, 0x1F]);
        expected.put_slice(&[0x03, 0x00, 0xAB, 0xAB, 0xAB]);
        expected.put_slice(&[0x26, 0x04, 0x02, 0x02]);
        expected.put_slice(&[0u8; 4 + 4 + 4 + 8]);
        expected.put_u8(0x01);
        assert_eq!(buf, expected);
    }
}
