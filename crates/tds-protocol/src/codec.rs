//! Low-level readers and writers shared by the token, RPC and login encoders.
//!
//! Readers return [`ProtocolError::UnexpectedEof`] when the buffer is short so
//! that callers can suspend and retry once more bytes arrive.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// PLP total-length marker for a NULL value.
pub const PLP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// PLP total-length marker when the sender does not know the length up front.
pub const PLP_UNKNOWN_LEN: u64 = 0xFFFF_FFFF_FFFF_FFFE;

/// Largest chunk written by [`write_plp`].
pub const PLP_CHUNK_SIZE: usize = 8000;

/// Fail with `UnexpectedEof` unless `n` bytes are available.
#[inline]
pub fn ensure(src: &impl Buf, n: usize) -> Result<(), ProtocolError> {
    if src.remaining() < n {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(())
}

/// Read a B_VARCHAR: 1-byte character count followed by UTF-16LE.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(src, 1)?;
    let len = src.get_u8() as usize;
    read_utf16_string(src, len)
}

/// Read a US_VARCHAR: 2-byte character count followed by UTF-16LE.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(src, 2)?;
    let len = src.get_u16_le() as usize;
    read_utf16_string(src, len)
}

/// Read `char_count` UTF-16LE code units.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Result<String, ProtocolError> {
    ensure(src, char_count * 2)?;
    let units: Vec<u16> = (0..char_count).map(|_| src.get_u16_le()).collect();
    String::from_utf16(&units).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Read a byte string with a 2-byte length prefix.
pub fn read_us_bytes(src: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    ensure(src, 2)?;
    let len = src.get_u16_le() as usize;
    ensure(src, len)?;
    Ok(src.copy_to_bytes(len))
}

/// Write a B_VARCHAR (truncated at 255 code units).
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().take(255).collect();
    dst.put_u8(units.len() as u8);
    for unit in units {
        dst.put_u16_le(unit);
    }
}

/// Write a US_VARCHAR (truncated at 65535 code units).
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().take(u16::MAX as usize).collect();
    dst.put_u16_le(units.len() as u16);
    for unit in units {
        dst.put_u16_le(unit);
    }
}

/// Write a UTF-16LE string without length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for unit in s.encode_utf16() {
        dst.put_u16_le(unit);
    }
}

/// Byte length of `s` once UTF-16 encoded.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

/// Read a PLP value, concatenating its chunks. `None` is SQL NULL.
pub fn read_plp(src: &mut impl Buf) -> Result<Option<Bytes>, ProtocolError> {
    ensure(src, 8)?;
    let total = src.get_u64_le();
    if total == PLP_NULL {
        return Ok(None);
    }

    let mut out = if total == PLP_UNKNOWN_LEN {
        BytesMut::new()
    } else {
        BytesMut::with_capacity(total.min(1 << 20) as usize)
    };
    loop {
        ensure(src, 4)?;
        let chunk_len = src.get_u32_le() as usize;
        if chunk_len == 0 {
            break;
        }
        ensure(src, chunk_len)?;
        out.extend_from_slice(&src.copy_to_bytes(chunk_len));
    }
    Ok(Some(out.freeze()))
}

/// Write a PLP value with a known total length, chunked at [`PLP_CHUNK_SIZE`].
pub fn write_plp(dst: &mut impl BufMut, value: Option<&[u8]>) {
    let Some(data) = value else {
        dst.put_u64_le(PLP_NULL);
        return;
    };
    dst.put_u64_le(data.len() as u64);
    for chunk in data.chunks(PLP_CHUNK_SIZE) {
        dst.put_u32_le(chunk.len() as u32);
        dst.put_slice(chunk);
    }
    dst.put_u32_le(0);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_b_varchar_roundtrip() {
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, "Hello, 世界!");
        let mut cursor = buf.freeze();
        assert_eq!(read_b_varchar(&mut cursor).unwrap(), "Hello, 世界!");
    }

    #[test]
    fn test_short_string_is_incomplete() {
        let mut cursor: &[u8] = &[0x03, b'a', 0x00];
        assert_eq!(read_b_varchar(&mut cursor), Err(ProtocolError::UnexpectedEof));
    }

    #[test]
    fn test_invalid_utf16_is_not_incomplete() {
        // lone high surrogate
        let mut cursor: &[u8] = &[0x01, 0x00, 0xD8];
        let err = read_b_varchar(&mut cursor).unwrap_err();
        assert!(!err.is_incomplete());
    }

    #[test]
    fn test_plp_chunks_and_null() {
        let data = vec![7u8; PLP_CHUNK_SIZE + 10];
        let mut buf = BytesMut::new();
        write_plp(&mut buf, Some(&data));
        // total + two chunk headers + terminator
        assert_eq!(buf.len(), 8 + 4 + PLP_CHUNK_SIZE + 4 + 10 + 4);

        let mut cursor = buf.freeze();
        assert_eq!(read_plp(&mut cursor).unwrap().unwrap().as_ref(), &data[..]);

        let mut buf = BytesMut::new();
        write_plp(&mut buf, None);
        let mut cursor = buf.freeze();
        assert_eq!(read_plp(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_utf16_byte_len() {
        assert_eq!(utf16_byte_len("Hello"), 10);
        assert_eq!(utf16_byte_len("世界"), 4);
    }
}
