//! TDS data type definitions and TYPE_INFO framing.
//!
//! [`TypeInfo`] knows how a value of each type is *framed* on the wire: fixed
//! width, 1-byte length, 2-byte length, PLP chunks, or the legacy text-pointer
//! form. Interpreting the framed bytes as a Rust value is the job of the type
//! registry in `mssql-types`.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};

use crate::codec::{ensure, read_plp, read_us_varchar, write_plp};
use crate::error::ProtocolError;

/// Marker in a 2-byte max length meaning "(max)", i.e. PLP encoded.
pub const MAX_LENGTH_PLP: u32 = 0xFFFF;

/// TDS data type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    /// Null type.
    Null = 0x1F,
    /// 8-bit unsigned integer.
    Int1 = 0x30,
    /// Bit.
    Bit = 0x32,
    /// 16-bit integer.
    Int2 = 0x34,
    /// 32-bit integer.
    Int4 = 0x38,
    /// 64-bit integer.
    Int8 = 0x7F,
    /// 4-byte float.
    Float4 = 0x3B,
    /// 8-byte float.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte smalldatetime.
    DateTime4 = 0x3A,
    /// Nullable datetime.
    DateTimeN = 0x6F,
    /// Uniqueidentifier.
    Guid = 0x24,
    /// Nullable integer (1, 2, 4 or 8 bytes).
    IntN = 0x26,
    /// Legacy decimal.
    Decimal = 0x37,
    /// Legacy numeric.
    Numeric = 0x3F,
    /// Nullable bit.
    BitN = 0x68,
    /// Nullable decimal.
    DecimalN = 0x6A,
    /// Nullable numeric.
    NumericN = 0x6C,
    /// Nullable float (4 or 8 bytes).
    FloatN = 0x6D,
    /// Nullable money.
    MoneyN = 0x6E,
    /// Legacy char.
    Char = 0x2F,
    /// Legacy varchar.
    VarChar = 0x27,
    /// Legacy binary.
    Binary = 0x2D,
    /// Legacy varbinary.
    VarBinary = 0x25,
    /// varchar(n) / varchar(max).
    BigVarChar = 0xA7,
    /// varbinary(n) / varbinary(max).
    BigVarBinary = 0xA5,
    /// char(n).
    BigChar = 0xAF,
    /// binary(n).
    BigBinary = 0xAD,
    /// nchar(n).
    NChar = 0xEF,
    /// nvarchar(n) / nvarchar(max).
    NVarChar = 0xE7,
    /// text.
    Text = 0x23,
    /// image.
    Image = 0x22,
    /// ntext.
    NText = 0x63,
    /// date.
    Date = 0x28,
    /// time(n).
    Time = 0x29,
    /// datetime2(n).
    DateTime2 = 0x2A,
    /// datetimeoffset(n).
    DateTimeOffset = 0x2B,
    /// sql_variant.
    Variant = 0x62,
    /// CLR user-defined type.
    Udt = 0xF0,
    /// xml.
    Xml = 0xF1,
    /// Table-valued parameter.
    Tvp = 0xF3,
}

impl TypeId {
    /// Create a type ID from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x1F => Self::Null,
            0x30 => Self::Int1,
            0x32 => Self::Bit,
            0x34 => Self::Int2,
            0x38 => Self::Int4,
            0x7F => Self::Int8,
            0x3B => Self::Float4,
            0x3E => Self::Float8,
            0x3C => Self::Money,
            0x7A => Self::Money4,
            0x3D => Self::DateTime,
            0x3A => Self::DateTime4,
            0x6F => Self::DateTimeN,
            0x24 => Self::Guid,
            0x26 => Self::IntN,
            0x37 => Self::Decimal,
            0x3F => Self::Numeric,
            0x68 => Self::BitN,
            0x6A => Self::DecimalN,
            0x6C => Self::NumericN,
            0x6D => Self::FloatN,
            0x6E => Self::MoneyN,
            0x2F => Self::Char,
            0x27 => Self::VarChar,
            0x2D => Self::Binary,
            0x25 => Self::VarBinary,
            0xA7 => Self::BigVarChar,
            0xA5 => Self::BigVarBinary,
            0xAF => Self::BigChar,
            0xAD => Self::BigBinary,
            0xEF => Self::NChar,
            0xE7 => Self::NVarChar,
            0x23 => Self::Text,
            0x22 => Self::Image,
            0x63 => Self::NText,
            0x28 => Self::Date,
            0x29 => Self::Time,
            0x2A => Self::DateTime2,
            0x2B => Self::DateTimeOffset,
            0x62 => Self::Variant,
            0xF0 => Self::Udt,
            0xF1 => Self::Xml,
            0xF3 => Self::Tvp,
            _ => return None,
        })
    }

    /// Width of a fixed-length type, `None` for anything length-prefixed.
    #[must_use]
    pub const fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::Int1 | Self::Bit => Some(1),
            Self::Int2 => Some(2),
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => Some(4),
            Self::Int8 | Self::Float8 | Self::Money | Self::DateTime => Some(8),
            _ => None,
        }
    }

    /// Check if this is a Unicode type.
    #[must_use]
    pub const fn is_unicode(&self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText)
    }

    /// Types whose TYPE_INFO carries a 2-byte max length and may be `(max)`.
    #[must_use]
    pub const fn is_ushort_len(&self) -> bool {
        matches!(
            self,
            Self::BigVarChar
                | Self::BigChar
                | Self::BigVarBinary
                | Self::BigBinary
                | Self::NVarChar
                | Self::NChar
        )
    }

    /// Types framed with a 1-byte length where length 0 means NULL.
    #[must_use]
    pub const fn is_byte_len(&self) -> bool {
        matches!(
            self,
            Self::IntN
                | Self::BitN
                | Self::FloatN
                | Self::MoneyN
                | Self::DateTimeN
                | Self::Guid
                | Self::Decimal
                | Self::Numeric
                | Self::DecimalN
                | Self::NumericN
                | Self::Char
                | Self::VarChar
                | Self::Binary
                | Self::VarBinary
                | Self::Date
                | Self::Time
                | Self::DateTime2
                | Self::DateTimeOffset
        )
    }
}

bitflags! {
    /// Column flags from COLMETADATA.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ColumnFlags: u16 {
        /// Column is nullable.
        const NULLABLE = 0x0001;
        /// Case-sensitive comparison.
        const CASE_SENSITIVE = 0x0002;
        /// Column is updateable.
        const UPDATEABLE_READ_WRITE = 0x0004;
        /// Updateability is unknown.
        const UPDATEABLE_UNKNOWN = 0x0008;
        /// Identity column.
        const IDENTITY = 0x0010;
        /// Computed column.
        const COMPUTED = 0x0020;
        /// Fixed-length CLR type.
        const FIXED_LEN_CLR_TYPE = 0x0100;
        /// Sparse column set.
        const SPARSE_COLUMN_SET = 0x0400;
        /// Column is protected by Always Encrypted; CryptoMetadata follows TYPE_INFO.
        const ENCRYPTED = 0x0800;
        /// Hidden column.
        const HIDDEN = 0x2000;
        /// Key column.
        const KEY = 0x4000;
        /// Nullability not known at compile time.
        const NULLABLE_UNKNOWN = 0x8000;
    }
}

/// Update mode for a column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Updateable {
    /// Column is read-only.
    #[default]
    ReadOnly,
    /// Column is read-write.
    ReadWrite,
    /// Updateability unknown.
    Unknown,
}

impl ColumnFlags {
    /// The two-bit updateable field.
    #[must_use]
    pub fn updateable(&self) -> Updateable {
        if self.contains(Self::UPDATEABLE_UNKNOWN) {
            Updateable::Unknown
        } else if self.contains(Self::UPDATEABLE_READ_WRITE) {
            Updateable::ReadWrite
        } else {
            Updateable::ReadOnly
        }
    }
}

/// SQL Server collation (5 bytes on the wire).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Collation {
    /// LCID plus collation flags and version nibble.
    pub info: u32,
    /// Sort ID.
    pub sort_id: u8,
}

impl Collation {
    /// `Latin1_General_CI_AS`, used when a string parameter carries no collation.
    pub const DEFAULT: Self = Self {
        info: 0x00D0_0409,
        sort_id: 0x34,
    };

    /// Decode a collation.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 5)?;
        Ok(Self {
            info: src.get_u32_le(),
            sort_id: src.get_u8(),
        })
    }

    /// Encode a collation.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.info);
        dst.put_u8(self.sort_id);
    }

    /// Locale identifier (low 20 bits).
    #[must_use]
    pub fn lcid(&self) -> u32 {
        self.info & 0x000F_FFFF
    }

    /// Whether this is a `_UTF8` collation.
    #[must_use]
    pub fn is_utf8(&self) -> bool {
        self.info & 0x0400_0000 != 0
    }
}

/// TYPE_INFO: a data type plus the metadata its framing depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Data type.
    pub type_id: TypeId,
    /// Declared max length in bytes (for length-prefixed types).
    pub max_length: Option<u32>,
    /// Precision for decimal/numeric.
    pub precision: Option<u8>,
    /// Scale for decimal/numeric and the time family.
    pub scale: Option<u8>,
    /// Collation for character types.
    pub collation: Option<Collation>,
}

impl TypeInfo {
    /// A type with no extra metadata.
    #[must_use]
    pub const fn new(type_id: TypeId) -> Self {
        Self {
            type_id,
            max_length: None,
            precision: None,
            scale: None,
            collation: None,
        }
    }

    /// Set the max length.
    #[must_use]
    pub const fn with_max_length(mut self, len: u32) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Set precision and scale.
    #[must_use]
    pub const fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// Set the scale only.
    #[must_use]
    pub const fn with_scale(mut self, scale: u8) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Set the collation.
    #[must_use]
    pub const fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Whether values use PLP chunked framing.
    #[must_use]
    pub fn is_plp(&self) -> bool {
        match self.type_id {
            TypeId::Xml => true,
            t if t.is_ushort_len() => self.max_length == Some(MAX_LENGTH_PLP),
            _ => false,
        }
    }

    /// Decode a TYPE_INFO.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 1)?;
        let raw = src.get_u8();
        let type_id = TypeId::from_u8(raw).ok_or(ProtocolError::InvalidDataType(raw))?;
        let mut info = Self::new(type_id);

        match type_id {
            _ if type_id.fixed_size().is_some() => {}
            TypeId::Date => {}
            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                ensure(src, 3)?;
                info.max_length = Some(src.get_u8() as u32);
                info.precision = Some(src.get_u8());
                info.scale = Some(src.get_u8());
            }
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
                ensure(src, 1)?;
                info.scale = Some(src.get_u8());
            }
            t if t.is_byte_len() => {
                ensure(src, 1)?;
                info.max_length = Some(src.get_u8() as u32);
            }
            TypeId::BigVarChar | TypeId::BigChar | TypeId::NVarChar | TypeId::NChar => {
                ensure(src, 2)?;
                info.max_length = Some(src.get_u16_le() as u32);
                info.collation = Some(Collation::decode(src)?);
            }
            TypeId::BigVarBinary | TypeId::BigBinary => {
                ensure(src, 2)?;
                info.max_length = Some(src.get_u16_le() as u32);
            }
            TypeId::Text | TypeId::NText | TypeId::Image => {
                ensure(src, 4)?;
                info.max_length = Some(src.get_u32_le());
                if type_id != TypeId::Image {
                    info.collation = Some(Collation::decode(src)?);
                }
                ensure(src, 1)?;
                let parts = src.get_u8();
                for _ in 0..parts {
                    read_us_varchar(src)?;
                }
            }
            TypeId::Xml => {
                ensure(src, 1)?;
                if src.get_u8() != 0 {
                    // database, owning schema, schema collection
                    crate::codec::read_b_varchar(src)?;
                    crate::codec::read_b_varchar(src)?;
                    read_us_varchar(src)?;
                }
            }
            TypeId::Variant | TypeId::Udt | TypeId::Tvp => {
                return Err(ProtocolError::UnsupportedDataType(raw));
            }
            _ => return Err(ProtocolError::UnsupportedDataType(raw)),
        }

        Ok(info)
    }

    /// Encode this TYPE_INFO.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.type_id as u8);
        match self.type_id {
            t if t.fixed_size().is_some() => {}
            TypeId::Date => {}
            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                dst.put_u8(self.max_length.unwrap_or(17) as u8);
                dst.put_u8(self.precision.unwrap_or(18));
                dst.put_u8(self.scale.unwrap_or(0));
            }
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
                dst.put_u8(self.scale.unwrap_or(7));
            }
            t if t.is_byte_len() => {
                dst.put_u8(self.max_length.unwrap_or(0) as u8);
            }
            t if t.is_ushort_len() => {
                dst.put_u16_le(self.max_length.unwrap_or(0) as u16);
                if !matches!(t, TypeId::BigVarBinary | TypeId::BigBinary) {
                    self.collation.unwrap_or(Collation::DEFAULT).encode(dst);
                }
            }
            TypeId::Text | TypeId::NText | TypeId::Image => {
                dst.put_u32_le(self.max_length.unwrap_or(0x7FFF_FFFF));
                if self.type_id != TypeId::Image {
                    self.collation.unwrap_or(Collation::DEFAULT).encode(dst);
                }
            }
            TypeId::Xml => dst.put_u8(0),
            _ => {}
        }
    }

    /// Read one framed value of this type. `None` is SQL NULL.
    pub fn read_value(&self, src: &mut impl Buf) -> Result<Option<Bytes>, ProtocolError> {
        if let Some(size) = self.type_id.fixed_size() {
            ensure(src, size)?;
            return Ok(Some(src.copy_to_bytes(size)));
        }
        if self.is_plp() {
            return read_plp(src);
        }
        match self.type_id {
            t if t.is_byte_len() => {
                ensure(src, 1)?;
                let len = src.get_u8() as usize;
                if len == 0 {
                    return Ok(None);
                }
                ensure(src, len)?;
                Ok(Some(src.copy_to_bytes(len)))
            }
            t if t.is_ushort_len() => {
                ensure(src, 2)?;
                let len = src.get_u16_le();
                if len == 0xFFFF {
                    return Ok(None);
                }
                ensure(src, len as usize)?;
                Ok(Some(src.copy_to_bytes(len as usize)))
            }
            TypeId::Text | TypeId::NText | TypeId::Image => {
                ensure(src, 1)?;
                let ptr_len = src.get_u8() as usize;
                if ptr_len == 0 {
                    return Ok(None);
                }
                // text pointer + 8-byte timestamp
                ensure(src, ptr_len + 8 + 4)?;
                src.advance(ptr_len + 8);
                let len = src.get_u32_le() as usize;
                ensure(src, len)?;
                Ok(Some(src.copy_to_bytes(len)))
            }
            other => Err(ProtocolError::UnsupportedDataType(other as u8)),
        }
    }

    /// Write one framed value of this type. `None` writes the type's NULL form.
    pub fn write_value(&self, dst: &mut impl BufMut, value: Option<&[u8]>) {
        if self.type_id.fixed_size().is_some() {
            if let Some(v) = value {
                dst.put_slice(v);
            }
            return;
        }
        if self.is_plp() {
            write_plp(dst, value);
            return;
        }
        match (self.type_id, value) {
            (t, None) if t.is_byte_len() => dst.put_u8(0),
            (t, Some(v)) if t.is_byte_len() => {
                dst.put_u8(v.len() as u8);
                dst.put_slice(v);
            }
            (t, None) if t.is_ushort_len() => dst.put_u16_le(0xFFFF),
            (t, Some(v)) if t.is_ushort_len() => {
                dst.put_u16_le(v.len() as u16);
                dst.put_slice(v);
            }
            (_, None) => dst.put_u8(0),
            (_, Some(v)) => {
                // text/ntext/image: dummy 16-byte text pointer and timestamp
                dst.put_u8(16);
                dst.put_slice(&[0u8; 16]);
                dst.put_slice(&[0u8; 8]);
                dst.put_u32_le(v.len() as u32);
                dst.put_slice(v);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_type_id_from_u8() {
        assert_eq!(TypeId::from_u8(0x38), Some(TypeId::Int4));
        assert_eq!(TypeId::from_u8(0xE7), Some(TypeId::NVarChar));
        assert_eq!(TypeId::from_u8(0x01), None);
    }

    #[test]
    fn test_encrypted_flag_is_bit_eleven() {
        let flags = ColumnFlags::from_bits_truncate(0x0809);
        assert!(flags.contains(ColumnFlags::ENCRYPTED));
        assert!(flags.contains(ColumnFlags::NULLABLE));
        assert_eq!(flags.updateable(), Updateable::Unknown);
        assert_eq!(ColumnFlags::ENCRYPTED.bits() & 2048, 2048);
    }

    #[test]
    fn test_intn_type_info() {
        let mut cursor: &[u8] = &[0x26, 0x04];
        let info = TypeInfo::decode(&mut cursor).unwrap();
        assert_eq!(info.type_id, TypeId::IntN);
        assert_eq!(info.max_length, Some(4));

        let mut cursor: &[u8] = &[0x04, 123, 0, 0, 0, 0x00];
        assert_eq!(
            info.read_value(&mut cursor).unwrap().unwrap().as_ref(),
            &[123, 0, 0, 0]
        );
        assert_eq!(info.read_value(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut cursor: &[u8] = &[0x01, 0x04];
        assert_eq!(
            TypeInfo::decode(&mut cursor),
            Err(ProtocolError::InvalidDataType(0x01))
        );
    }

    #[test]
    fn test_nvarchar_max_is_plp() {
        let info = TypeInfo::new(TypeId::NVarChar)
            .with_max_length(MAX_LENGTH_PLP)
            .with_collation(Collation::DEFAULT);
        assert!(info.is_plp());

        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        assert_eq!(&buf[..], &[0xE7, 0xFF, 0xFF, 0x09, 0x04, 0xD0, 0x00, 0x34]);

        let mut cursor: &[u8] = &buf;
        assert_eq!(TypeInfo::decode(&mut cursor).unwrap(), info);
    }

    #[test]
    fn test_varchar_value_framing() {
        let info = TypeInfo::new(TypeId::BigVarChar)
            .with_max_length(10)
            .with_collation(Collation::DEFAULT);
        let mut buf = BytesMut::new();
        info.write_value(&mut buf, Some(b"a"));
        info.write_value(&mut buf, None);
        assert_eq!(&buf[..], &[0x01, 0x00, b'a', 0xFF, 0xFF]);

        let mut cursor: &[u8] = &buf;
        assert_eq!(info.read_value(&mut cursor).unwrap().unwrap().as_ref(), b"a");
        assert_eq!(info.read_value(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_short_value_is_incomplete() {
        let info = TypeInfo::new(TypeId::Int8);
        let mut cursor: &[u8] = &[1, 2, 3];
        assert!(info.read_value(&mut cursor).unwrap_err().is_incomplete());
    }
}
