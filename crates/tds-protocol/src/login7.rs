//! LOGIN7 message construction.
//!
//! LOGIN7 is a 94-byte fixed header of offset/length pairs followed by a
//! variable section of UTF-16LE strings. When feature extensions are
//! requested, the "unused" slot holds a 4-byte pointer to the extension block
//! at the end of the variable section.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16_string;
use crate::version::TdsVersion;

/// Size of the fixed LOGIN7 header.
pub const LOGIN7_HEADER_SIZE: usize = 94;

bitflags! {
    /// OptionFlags1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags1: u8 {
        /// Big-endian byte order.
        const BYTE_ORDER_BE = 0x01;
        /// EBCDIC character set.
        const CHAR_EBCDIC = 0x02;
        /// Dump/load off.
        const DUMP_LOAD_OFF = 0x10;
        /// Warn on USE database.
        const USE_DB_NOTIFY = 0x20;
        /// Failure to switch database is fatal.
        const DATABASE_FATAL = 0x40;
        /// Warn on language change.
        const SET_LANG_WARN = 0x80;
    }
}

bitflags! {
    /// OptionFlags2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags2: u8 {
        /// Failure to set language is fatal.
        const LANGUAGE_FATAL = 0x01;
        /// ODBC client semantics.
        const ODBC = 0x02;
        /// Integrated security.
        const INTEGRATED_SECURITY = 0x80;
    }
}

bitflags! {
    /// TypeFlags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        /// OLE DB client.
        const OLEDB = 0x10;
        /// Read-only application intent.
        const READ_ONLY_INTENT = 0x20;
    }
}

bitflags! {
    /// OptionFlags3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags3: u8 {
        /// Change password request.
        const CHANGE_PASSWORD = 0x01;
        /// User instance.
        const USER_INSTANCE = 0x02;
        /// Accept unknown collations.
        const UNKNOWN_COLLATION_HANDLING = 0x08;
        /// Feature extension block present.
        const EXTENSION = 0x10;
    }
}

/// Feature extension identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FeatureId {
    /// Session recovery.
    SessionRecovery = 0x01,
    /// Federated authentication.
    FedAuth = 0x02,
    /// Always Encrypted column encryption.
    ColumnEncryption = 0x04,
    /// Global transactions.
    GlobalTransactions = 0x05,
    /// UTF-8 collation support.
    Utf8Support = 0x0A,
    /// Terminator.
    Terminator = 0xFF,
}

/// Highest column encryption version this client speaks.
pub const COLUMN_ENCRYPTION_VERSION: u8 = 1;

/// A feature extension entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureExtension {
    /// Feature ID.
    pub feature_id: FeatureId,
    /// Feature data.
    pub data: Bytes,
}

impl FeatureExtension {
    /// Request Always Encrypted support.
    #[must_use]
    pub fn column_encryption() -> Self {
        Self {
            feature_id: FeatureId::ColumnEncryption,
            data: Bytes::from_static(&[COLUMN_ENCRYPTION_VERSION]),
        }
    }
}

/// LOGIN7 message builder.
#[derive(Debug, Clone)]
pub struct Login7 {
    /// Requested TDS version.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client process ID.
    pub client_pid: u32,
    /// OptionFlags1.
    pub option_flags1: OptionFlags1,
    /// OptionFlags2.
    pub option_flags2: OptionFlags2,
    /// TypeFlags.
    pub type_flags: TypeFlags,
    /// OptionFlags3.
    pub option_flags3: OptionFlags3,
    /// Client LCID.
    pub client_lcid: u32,
    /// Client machine name.
    pub hostname: String,
    /// SQL login name.
    pub username: String,
    /// SQL login password.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as typed by the user.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
    /// Feature extensions.
    pub features: Vec<FeatureExtension>,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: 4096,
            client_pid: std::process::id(),
            option_flags1: OptionFlags1::USE_DB_NOTIFY | OptionFlags1::DATABASE_FATAL,
            option_flags2: OptionFlags2::LANGUAGE_FATAL | OptionFlags2::ODBC,
            type_flags: TypeFlags::empty(),
            option_flags3: OptionFlags3::UNKNOWN_COLLATION_HANDLING,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::from("mssql-client"),
            server_name: String::new(),
            library_name: String::from("mssql-client"),
            language: String::new(),
            database: String::new(),
            features: Vec::new(),
        }
    }
}

impl Login7 {
    /// Create a new builder with default flags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn with_sql_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self.option_flags2.remove(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the client machine name.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Set the initial language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Declare read-only application intent.
    #[must_use]
    pub fn with_read_only_intent(mut self, read_only: bool) -> Self {
        self.type_flags.set(TypeFlags::READ_ONLY_INTENT, read_only);
        self
    }

    /// Add a feature extension.
    #[must_use]
    pub fn with_feature(mut self, feature: FeatureExtension) -> Self {
        self.option_flags3.insert(OptionFlags3::EXTENSION);
        self.features.push(feature);
        self
    }

    /// Encode the LOGIN7 payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let has_extension = self.option_flags3.contains(OptionFlags3::EXTENSION);

        let mut var = VarSection::new();
        var.push_str(&self.hostname);
        var.push_str(&self.username);
        var.push_password(&self.password);
        var.push_str(&self.app_name);
        var.push_str(&self.server_name);

        // extension pointer occupies the unused slot
        let ext_slot_offset = var.offset;
        if has_extension {
            var.data.put_u32_le(0);
            var.offset += 4;
        }

        var.push_str(&self.library_name);
        var.push_str(&self.language);
        var.push_str(&self.database);
        // sspi, attach db file, change password
        var.push_str("");
        var.push_str("");
        var.push_str("");

        if has_extension {
            let ext_offset = u32::from(var.offset);
            let pos = (ext_slot_offset as usize) - LOGIN7_HEADER_SIZE;
            var.data[pos..pos + 4].copy_from_slice(&ext_offset.to_le_bytes());
            for feature in &self.features {
                var.data.put_u8(feature.feature_id as u8);
                var.data.put_u32_le(feature.data.len() as u32);
                var.data.put_slice(&feature.data);
            }
            var.data.put_u8(FeatureId::Terminator as u8);
        }
        let VarSection {
            data: var_data,
            slots,
            ..
        } = var;

        let mut buf = BytesMut::with_capacity(LOGIN7_HEADER_SIZE + var_data.len());
        buf.put_u32_le((LOGIN7_HEADER_SIZE + var_data.len()) as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(0); // client program version
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(0); // connection id
        buf.put_u8(self.option_flags1.bits());
        buf.put_u8(self.option_flags2.bits());
        buf.put_u8(self.type_flags.bits());
        buf.put_u8(self.option_flags3.bits());
        buf.put_i32_le(0); // client timezone
        buf.put_u32_le(self.client_lcid);

        let (strings, trailing) = slots.split_at(5);
        for (off, len) in strings {
            buf.put_u16_le(*off);
            buf.put_u16_le(*len);
        }
        buf.put_u16_le(ext_slot_offset);
        buf.put_u16_le(if has_extension { 4 } else { 0 });
        for (off, len) in &trailing[..3] {
            buf.put_u16_le(*off);
            buf.put_u16_le(*len);
        }
        buf.put_slice(&[0u8; 6]); // client id
        for (off, len) in &trailing[3..] {
            buf.put_u16_le(*off);
            buf.put_u16_le(*len);
        }
        buf.put_u32_le(0); // long SSPI length

        buf.put_slice(&var_data);
        buf.freeze()
    }
}

/// Variable section under construction, tracking each field's slot.
struct VarSection {
    data: BytesMut,
    slots: Vec<(u16, u16)>,
    offset: u16,
}

impl VarSection {
    fn new() -> Self {
        Self {
            data: BytesMut::new(),
            slots: Vec::with_capacity(11),
            offset: LOGIN7_HEADER_SIZE as u16,
        }
    }

    fn push_str(&mut self, s: &str) {
        let chars = s.encode_utf16().count() as u16;
        self.slots.push((self.offset, chars));
        write_utf16_string(&mut self.data, s);
        self.offset += chars * 2;
    }

    fn push_password(&mut self, s: &str) {
        let chars = s.encode_utf16().count() as u16;
        self.slots.push((self.offset, chars));
        write_obfuscated_password(&mut self.data, s);
        self.offset += chars * 2;
    }
}

/// Swap nibbles then XOR with 0xA5, byte by byte over the UTF-16LE password.
fn write_obfuscated_password(dst: &mut impl BufMut, password: &str) {
    for c in password.encode_utf16() {
        for byte in c.to_le_bytes() {
            dst.put_u8(byte.rotate_right(4) ^ 0xA5);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn u16_at(buf: &[u8], pos: usize) -> u16 {
        u16::from_le_bytes([buf[pos], buf[pos + 1]])
    }

    #[test]
    fn test_password_obfuscation() {
        let mut buf = BytesMut::new();
        write_obfuscated_password(&mut buf, "a");
        assert_eq!(&buf[..], &[0xB3, 0xA5]);
    }

    #[test]
    fn test_encode_header_fields() {
        let encoded = Login7::new()
            .with_hostname("HOST")
            .with_sql_auth("sa", "pw")
            .with_database("db")
            .encode();

        let total = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(total as usize, encoded.len());
        assert_eq!(
            u32::from_le_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]),
            TdsVersion::V7_4.raw()
        );
        // hostname slot
        assert_eq!(u16_at(&encoded, 36), 94);
        assert_eq!(u16_at(&encoded, 38), 4);
        assert_eq!(&encoded[94..96], &[b'H', 0]);
        // no extension
        assert_eq!(encoded[27] & 0x10, 0);
    }

    #[test]
    fn test_column_encryption_feature() {
        let encoded = Login7::new()
            .with_feature(FeatureExtension::column_encryption())
            .encode();

        assert_eq!(encoded[27] & 0x10, 0x10);
        let ext_slot = u16_at(&encoded, 56) as usize;
        assert_eq!(u16_at(&encoded, 58), 4);
        let ext_offset = u32::from_le_bytes([
            encoded[ext_slot],
            encoded[ext_slot + 1],
            encoded[ext_slot + 2],
            encoded[ext_slot + 3],
        ]) as usize;
        assert_eq!(
            &encoded[ext_offset..],
            &[0x04, 0x01, 0x00, 0x00, 0x00, 0x01, 0xFF]
        );
    }
}
