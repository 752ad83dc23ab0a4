//! Code page selection for non-Unicode character data.
//!
//! `VARCHAR` bytes are interpreted in the code page implied by the column's
//! collation. Only the Windows code pages SQL Server actually uses for its
//! collations are mapped; anything unrecognised falls back to 1252.

use encoding_rs::Encoding;
use tds_protocol::Collation;

/// The encoding for character data under `collation`.
///
/// `None` (no collation on the wire) behaves like the server default,
/// `Latin1_General_CI_AS`.
#[must_use]
pub fn encoding_for(collation: Option<&Collation>) -> &'static Encoding {
    let Some(collation) = collation else {
        return encoding_rs::WINDOWS_1252;
    };
    if collation.is_utf8() {
        return encoding_rs::UTF_8;
    }
    match code_page(collation.lcid()) {
        874 => encoding_rs::WINDOWS_874,
        932 => encoding_rs::SHIFT_JIS,
        936 => encoding_rs::GBK,
        949 => encoding_rs::EUC_KR,
        950 => encoding_rs::BIG5,
        1250 => encoding_rs::WINDOWS_1250,
        1251 => encoding_rs::WINDOWS_1251,
        1253 => encoding_rs::WINDOWS_1253,
        1254 => encoding_rs::WINDOWS_1254,
        1255 => encoding_rs::WINDOWS_1255,
        1256 => encoding_rs::WINDOWS_1256,
        1257 => encoding_rs::WINDOWS_1257,
        1258 => encoding_rs::WINDOWS_1258,
        _ => encoding_rs::WINDOWS_1252,
    }
}

/// Windows code page for a locale id.
fn code_page(lcid: u32) -> u16 {
    // Locales whose code page differs from their primary language's.
    match lcid & 0xFFFF {
        0x0804 | 0x1004 => return 936,
        0x0404 | 0x0C04 | 0x1404 => return 950,
        0x0C1A | 0x1C1A | 0x201A => return 1251,
        _ => {}
    }

    match lcid & 0x3FF {
        0x11 => 932,
        0x12 => 949,
        0x1E => 874,
        0x2A => 1258,
        0x05 | 0x0E | 0x15 | 0x18 | 0x1A | 0x1B | 0x1C | 0x24 => 1250,
        0x02 | 0x19 | 0x22 | 0x23 | 0x2F | 0x3F | 0x40 | 0x44 | 0x50 => 1251,
        0x08 => 1253,
        0x1F | 0x2C => 1254,
        0x0D => 1255,
        0x01 | 0x20 | 0x29 => 1256,
        0x25..=0x27 => 1257,
        _ => 1252,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collation(lcid: u32) -> Collation {
        Collation {
            info: lcid,
            sort_id: 0,
        }
    }

    #[test]
    fn test_default_is_1252() {
        assert_eq!(encoding_for(None), encoding_rs::WINDOWS_1252);
        assert_eq!(
            encoding_for(Some(&Collation::DEFAULT)),
            encoding_rs::WINDOWS_1252
        );
    }

    #[test]
    fn test_known_locales() {
        assert_eq!(encoding_for(Some(&collation(0x0411))), encoding_rs::SHIFT_JIS);
        assert_eq!(encoding_for(Some(&collation(0x0419))), encoding_rs::WINDOWS_1251);
        assert_eq!(encoding_for(Some(&collation(0x0804))), encoding_rs::GBK);
        assert_eq!(encoding_for(Some(&collation(0x0404))), encoding_rs::BIG5);
        assert_eq!(encoding_for(Some(&collation(0x0C1A))), encoding_rs::WINDOWS_1251);
        assert_eq!(encoding_for(Some(&collation(0x081A))), encoding_rs::WINDOWS_1250);
    }

    #[test]
    fn test_utf8_flag_wins() {
        let utf8 = collation(0x0400_0409);
        assert_eq!(encoding_for(Some(&utf8)), encoding_rs::UTF_8);
    }
}
