//! Type conversion error types.

use thiserror::Error;

/// Errors raised by the type registry.
///
/// Validation failures are reported with a human readable message so the
/// request layer can surface them as parameter errors verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    /// Value is null when non-null was expected.
    #[error("unexpected null value")]
    UnexpectedNull,

    /// Type mismatch during conversion.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type name.
        expected: &'static str,
        /// Actual type name.
        actual: String,
    },

    /// Value is out of range for target type.
    #[error("value out of range for {target_type}")]
    OutOfRange {
        /// Target type name.
        target_type: &'static str,
    },

    /// Invalid encoding in string data.
    #[error("invalid string encoding: {0}")]
    InvalidEncoding(String),

    /// Invalid decimal value.
    #[error("invalid decimal: {0}")]
    InvalidDecimal(String),

    /// A string or binary value exceeds the declared length.
    #[error("value of length {length} exceeds declared length {max}")]
    Truncation {
        /// Length of the value in the type's length unit.
        length: usize,
        /// Declared maximum.
        max: usize,
    },

    /// The wire type has no registry entry.
    #[error("unsupported type 0x{0:02X}")]
    UnsupportedType(u8),

    /// Wire bytes have the wrong width for the type.
    #[error("invalid length {actual} for {type_name}")]
    InvalidLength {
        /// Type being decoded.
        type_name: &'static str,
        /// Width actually received.
        actual: usize,
    },
}
