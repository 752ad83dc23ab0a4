//! Always Encrypted metadata on the wire.
//!
//! When column encryption was negotiated at login, COLMETADATA starts with a
//! CEK table, and every column whose flags carry [`ColumnFlags::ENCRYPTED`]
//! is followed by a CryptoMetadata block:
//!
//! ```text
//! ordinal       u16
//! user type     u16 before TDS 7.2, u32 after
//! base type     TYPE_INFO
//! algorithm id  u8
//! algorithm     B_VARCHAR, only when the id is 0 (custom)
//! enc. type     u8
//! norm. version u8
//! ```
//!
//! [`ColumnFlags::ENCRYPTED`]: crate::types::ColumnFlags::ENCRYPTED

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};

use crate::codec::{
    ensure, read_b_varchar, read_us_bytes, read_us_varchar, write_b_varchar, write_us_varchar,
};
use crate::error::ProtocolError;
use crate::types::TypeInfo;
use crate::version::TdsVersion;

/// Algorithm id for AEAD_AES_256_CBC_HMAC_SHA256.
pub const ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256: u8 = 2;

/// Name of the only built-in cell encryption algorithm.
pub const AEAD_AES_256_CBC_HMAC_SHA256: &str = "AEAD_AES_256_CBC_HMAC_SHA256";

/// Current normalization rule version.
pub const NORMALIZATION_RULE_VERSION: u8 = 1;

/// One encrypted copy of a column encryption key.
///
/// A CEK has several values while its master key is being rotated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CekValue {
    /// CEK bytes encrypted under the column master key.
    pub encrypted_key: Bytes,
    /// Name of the key store provider holding the master key.
    pub key_store_name: String,
    /// Path of the master key inside that store.
    pub key_path: String,
    /// Asymmetric algorithm protecting the CEK (e.g. `RSA_OAEP`).
    pub algorithm: String,
}

/// A column encryption key as listed in the CEK table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CekTableEntry {
    /// Database the key belongs to.
    pub database_id: u32,
    /// Key id within the database.
    pub cek_id: u32,
    /// Key version.
    pub cek_version: u32,
    /// Metadata version.
    pub cek_md_version: u64,
    /// Encrypted copies of the key.
    pub values: Vec<CekValue>,
}

impl CekTableEntry {
    /// The value to unwrap first.
    #[must_use]
    pub fn primary_value(&self) -> Option<&CekValue> {
        self.values.first()
    }

    fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 21)?;
        let database_id = src.get_u32_le();
        let cek_id = src.get_u32_le();
        let cek_version = src.get_u32_le();
        let cek_md_version = src.get_u64_le();
        let count = src.get_u8();

        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let encrypted_key = read_us_bytes(src)?;
            let key_store_name = read_b_varchar(src)?;
            let key_path = read_us_varchar(src)?;
            let algorithm = read_b_varchar(src)?;
            values.push(CekValue {
                encrypted_key,
                key_store_name,
                key_path,
                algorithm,
            });
        }

        Ok(Self {
            database_id,
            cek_id,
            cek_version,
            cek_md_version,
            values,
        })
    }

    fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.database_id);
        dst.put_u32_le(self.cek_id);
        dst.put_u32_le(self.cek_version);
        dst.put_u64_le(self.cek_md_version);
        dst.put_u8(self.values.len() as u8);
        for value in &self.values {
            dst.put_u16_le(value.encrypted_key.len() as u16);
            dst.put_slice(&value.encrypted_key);
            write_b_varchar(dst, &value.key_store_name);
            write_us_varchar(dst, &value.key_path);
            write_b_varchar(dst, &value.algorithm);
        }
    }
}

/// The CEK table sent at the start of an encrypted COLMETADATA.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CekTable {
    /// Entries indexed by ordinal.
    pub entries: Vec<Arc<CekTableEntry>>,
}

impl CekTable {
    /// Decode the table.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let count = src.get_u16_le();
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(Arc::new(CekTableEntry::decode(src)?));
        }
        Ok(Self { entries })
    }

    /// Encode the table.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(self.entries.len() as u16);
        for entry in &self.entries {
            entry.encode(dst);
        }
    }

    /// Resolve an ordinal.
    pub fn get(&self, ordinal: u16) -> Result<&Arc<CekTableEntry>, ProtocolError> {
        self.entries
            .get(ordinal as usize)
            .ok_or(ProtocolError::CekOrdinalOutOfRange {
                ordinal,
                len: self.entries.len(),
            })
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How a column's ciphertext IV is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptionType {
    /// Not encrypted.
    Plaintext = 0,
    /// IV derived from the plaintext; equal values encrypt equally.
    Deterministic = 1,
    /// Random IV.
    Randomized = 2,
}

impl EncryptionType {
    /// Map a raw byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Plaintext),
            1 => Ok(Self::Deterministic),
            2 => Ok(Self::Randomized),
            other => Err(ProtocolError::InvalidField {
                field: "encryption type",
                value: u32::from(other),
            }),
        }
    }
}

/// Per-column encryption metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoMetadata {
    /// Ordinal into the CEK table.
    pub ordinal: u16,
    /// User type of the plaintext column.
    pub user_type: u32,
    /// TYPE_INFO of the plaintext value.
    pub base_type: TypeInfo,
    /// Cell encryption algorithm id.
    pub algorithm_id: u8,
    /// Custom algorithm name, present only when `algorithm_id` is 0.
    pub algorithm_name: Option<String>,
    /// Deterministic or randomized.
    pub encryption_type: EncryptionType,
    /// Normalization rule version.
    pub normalization_version: u8,
    /// The resolved key, when decoded against a CEK table.
    pub cek: Option<Arc<CekTableEntry>>,
}

impl CryptoMetadata {
    /// Decode a CryptoMetadata block, resolving the key ordinal against `cek_table`.
    pub fn decode(
        src: &mut impl Buf,
        version: TdsVersion,
        cek_table: Option<&CekTable>,
    ) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let ordinal = src.get_u16_le();
        let user_type = read_user_type(src, version)?;
        let base_type = TypeInfo::decode(src)?;

        ensure(src, 1)?;
        let algorithm_id = src.get_u8();
        let algorithm_name = if algorithm_id == 0 {
            Some(read_b_varchar(src)?)
        } else {
            None
        };

        ensure(src, 2)?;
        let encryption_type = EncryptionType::from_u8(src.get_u8())?;
        let normalization_version = src.get_u8();

        let cek = match cek_table {
            Some(table) => Some(Arc::clone(table.get(ordinal)?)),
            None => None,
        };

        Ok(Self {
            ordinal,
            user_type,
            base_type,
            algorithm_id,
            algorithm_name,
            encryption_type,
            normalization_version,
            cek,
        })
    }

    /// Encode in COLMETADATA form.
    pub fn encode(&self, dst: &mut impl BufMut, version: TdsVersion) {
        dst.put_u16_le(self.ordinal);
        write_user_type(dst, version, self.user_type);
        self.base_type.encode(dst);
        dst.put_u8(self.algorithm_id);
        if self.algorithm_id == 0 {
            write_b_varchar(dst, self.algorithm_name.as_deref().unwrap_or_default());
        }
        dst.put_u8(self.encryption_type as u8);
        dst.put_u8(self.normalization_version);
    }

    /// Encode the ParamCipherInfo trailing an encrypted RPC parameter.
    pub fn encode_param_cipher_info(&self, dst: &mut impl BufMut) {
        self.base_type.encode(dst);
        dst.put_u8(self.algorithm_id);
        if self.algorithm_id == 0 {
            write_b_varchar(dst, self.algorithm_name.as_deref().unwrap_or_default());
        }
        dst.put_u8(self.encryption_type as u8);
        let (db, id, ver, md) = self
            .cek
            .as_deref()
            .map(|e| (e.database_id, e.cek_id, e.cek_version, e.cek_md_version))
            .unwrap_or_default();
        dst.put_u32_le(db);
        dst.put_u32_le(id);
        dst.put_u32_le(ver);
        dst.put_u64_le(md);
        dst.put_u8(self.normalization_version);
    }

    /// The algorithm name the cipher is selected by.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        match (&self.algorithm_name, self.algorithm_id) {
            (Some(name), _) => name,
            _ => AEAD_AES_256_CBC_HMAC_SHA256,
        }
    }

    /// Whether values are actually encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encryption_type != EncryptionType::Plaintext
    }
}

/// Read a user type whose width depends on the protocol version.
pub fn read_user_type(src: &mut impl Buf, version: TdsVersion) -> Result<u32, ProtocolError> {
    if version.has_wide_user_type() {
        ensure(src, 4)?;
        Ok(src.get_u32_le())
    } else {
        ensure(src, 2)?;
        Ok(u32::from(src.get_u16_le()))
    }
}

/// Write a user type whose width depends on the protocol version.
pub fn write_user_type(dst: &mut impl BufMut, version: TdsVersion, user_type: u32) {
    if version.has_wide_user_type() {
        dst.put_u32_le(user_type);
    } else {
        dst.put_u16_le(user_type as u16);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::TypeId;
    use bytes::BytesMut;

    fn sample_cek_table() -> CekTable {
        CekTable {
            entries: vec![Arc::new(CekTableEntry {
                database_id: 33,
                cek_id: 3,
                cek_version: 1,
                cek_md_version: 188_119_578_600_049,
                values: vec![CekValue {
                    encrypted_key: Bytes::from_static(&[1, 0, 2]),
                    key_store_name: "MSSQL_CERTIFICATE_STORE".into(),
                    key_path: "CurrentUser/my/6F81B2D94DC933F092400B59660125D39CD89041".into(),
                    algorithm: "RSA_OAEP".into(),
                }],
            })],
        }
    }

    #[test]
    fn test_cek_md_version_bytes() {
        let mut buf = BytesMut::new();
        sample_cek_table().encode(&mut buf);
        // count, db, cek, version, then md version
        assert_eq!(&buf[14..22], &[113, 98, 168, 0, 24, 171, 0, 0]);

        let mut cursor = buf.freeze();
        assert_eq!(CekTable::decode(&mut cursor).unwrap(), sample_cek_table());
    }

    #[test]
    fn test_crypto_metadata_tds_7_4() {
        let table = sample_cek_table();
        let mut cursor: &[u8] = &[0, 0, 0, 0, 0, 0, 0x26, 0x04, 0x02, 0x01, 0x01];
        let meta = CryptoMetadata::decode(&mut cursor, TdsVersion::V7_4, Some(&table)).unwrap();

        assert!(cursor.is_empty());
        assert_eq!(meta.base_type.type_id, TypeId::IntN);
        assert_eq!(meta.algorithm_id, ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256);
        assert_eq!(meta.algorithm(), AEAD_AES_256_CBC_HMAC_SHA256);
        assert_eq!(meta.encryption_type, EncryptionType::Deterministic);
        assert_eq!(meta.normalization_version, 1);
        assert_eq!(meta.cek.as_ref().unwrap().cek_id, 3);
    }

    #[test]
    fn test_crypto_metadata_narrow_user_type() {
        let mut cursor: &[u8] = &[0, 0, 0, 0, 0x26, 0x04, 2, 1, 1];
        let meta = CryptoMetadata::decode(&mut cursor, TdsVersion::V7_1, None).unwrap();
        assert!(cursor.is_empty());
        assert_eq!(meta.base_type.max_length, Some(4));
        assert!(meta.cek.is_none());
    }

    #[test]
    fn test_custom_algorithm_name() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 0, 0, 0, 0, 0x26, 0x04, 0x00]);
        write_b_varchar(&mut buf, "TestName");
        buf.put_slice(&[0x02, 0x01]);

        let mut cursor = buf.freeze();
        let meta = CryptoMetadata::decode(&mut cursor, TdsVersion::V7_4, None).unwrap();
        assert_eq!(meta.algorithm_name.as_deref(), Some("TestName"));
        assert_eq!(meta.algorithm(), "TestName");
        assert_eq!(meta.encryption_type, EncryptionType::Randomized);
    }

    #[test]
    fn test_invalid_base_type() {
        let mut cursor: &[u8] = &[0, 0, 0, 0, 0, 0, 0x01, 0x04, 0x02, 0x01, 0x01];
        assert_eq!(
            CryptoMetadata::decode(&mut cursor, TdsVersion::V7_4, None),
            Err(ProtocolError::InvalidDataType(0x01))
        );
    }

    #[test]
    fn test_ordinal_out_of_range() {
        let table = sample_cek_table();
        let mut cursor: &[u8] = &[5, 0, 0, 0, 0, 0, 0x26, 0x04, 0x02, 0x01, 0x01];
        assert_eq!(
            CryptoMetadata::decode(&mut cursor, TdsVersion::V7_4, Some(&table)),
            Err(ProtocolError::CekOrdinalOutOfRange { ordinal: 5, len: 1 })
        );
    }
}
