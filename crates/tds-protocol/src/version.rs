//! TDS protocol version numbers.
//!
//! Several wire fields change width with the negotiated version: user types
//! and DONE row counts widen at 7.2.

use core::fmt;

/// A TDS protocol version as sent in LOGIN7 and LOGINACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.0 (SQL Server 7.0).
    pub const V7_0: Self = Self(0x7000_0000);
    /// TDS 7.1 (SQL Server 2000).
    pub const V7_1: Self = Self(0x7100_0000);
    /// TDS 7.1 revision 1 (SQL Server 2000 SP1).
    pub const V7_1_REV1: Self = Self(0x7100_0001);
    /// TDS 7.2 (SQL Server 2005).
    pub const V7_2: Self = Self(0x7209_0002);
    /// TDS 7.3A (SQL Server 2008).
    pub const V7_3A: Self = Self(0x730A_0003);
    /// TDS 7.3B (SQL Server 2008 R2).
    pub const V7_3B: Self = Self(0x730B_0003);
    /// TDS 7.4 (SQL Server 2012+).
    pub const V7_4: Self = Self(0x7400_0004);
    /// TDS 8.0 (strict encryption).
    pub const V8_0: Self = Self(0x0800_0000);

    /// Wrap a raw version number.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// The raw version number.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// TDS 8.0 encodes its number below 7.x, so it is special-cased in comparisons.
    #[must_use]
    pub const fn is_tds_8(self) -> bool {
        self.0 == Self::V8_0.0
    }

    /// `self >= other`, treating 8.0 as newer than every 7.x.
    #[must_use]
    pub const fn at_least(self, other: Self) -> bool {
        match (self.is_tds_8(), other.is_tds_8()) {
            (true, _) => true,
            (false, true) => false,
            (false, false) => self.0 >= other.0,
        }
    }

    /// User types are 4 bytes from 7.2 on, 2 bytes before.
    #[must_use]
    pub const fn has_wide_user_type(self) -> bool {
        self.at_least(Self::V7_2)
    }

    /// DONE row counts are 8 bytes from 7.2 on, 4 bytes before.
    #[must_use]
    pub const fn has_wide_row_count(self) -> bool {
        self.at_least(Self::V7_2)
    }

    /// Column encryption is a 7.4 feature extension.
    #[must_use]
    pub const fn supports_column_encryption(self) -> bool {
        self.at_least(Self::V7_4)
    }

    /// Parse "7.4", "7.3b", "8.0" and friends.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "7.0" => Some(Self::V7_0),
            "7.1" => Some(Self::V7_1),
            "7.2" => Some(Self::V7_2),
            "7.3" | "7.3a" => Some(Self::V7_3A),
            "7.3b" => Some(Self::V7_3B),
            "7.4" => Some(Self::V7_4),
            "8.0" | "8" => Some(Self::V8_0),
            _ => None,
        }
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0x7000_0000 => write!(f, "TDS 7.0"),
            0x7100_0000 | 0x7100_0001 => write!(f, "TDS 7.1"),
            0x7209_0002 => write!(f, "TDS 7.2"),
            0x730A_0003 => write!(f, "TDS 7.3A"),
            0x730B_0003 => write!(f, "TDS 7.3B"),
            0x7400_0004 => write!(f, "TDS 7.4"),
            0x0800_0000 => write!(f, "TDS 8.0"),
            other => write!(f, "TDS 0x{other:08X}"),
        }
    }
}

impl From<u32> for TdsVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
