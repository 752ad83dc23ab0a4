//! Authentication and encryption error types.

use mssql_types::TypeError;
use thiserror::Error;

/// Errors raised while preparing login credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Invalid credentials provided.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Errors raised by the Always Encrypted engine.
///
/// None of these carry key material or plaintext.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// No provider is registered under the key store name in the metadata.
    #[error("key store provider not found: {0}")]
    KeyStoreNotFound(String),

    /// The key store provider failed to decrypt the column encryption key.
    #[error("key store provider {provider} failed: {message}")]
    Provider {
        /// Provider name.
        provider: String,
        /// Provider's error text.
        message: String,
    },

    /// The decrypted root key has the wrong size.
    #[error(
        "the column encryption key was decrypted but its length {actual} does not match the \
         length {expected} required by the algorithm"
    )]
    InvalidKeyLength {
        /// Required length in bytes.
        expected: usize,
        /// Length returned by the provider.
        actual: usize,
    },

    /// A value needs encryption but the connection did not negotiate it.
    #[error("column encryption is not enabled on this connection")]
    NotEnabled,

    /// The column metadata does not reference a usable key.
    #[error("encryption metadata not available: {0}")]
    MetadataNotAvailable(String),

    /// The column uses a cipher other than AEAD_AES_256_CBC_HMAC_SHA256.
    #[error("unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Ciphertext shorter than the fixed fields.
    #[error("ciphertext too short: {actual} bytes, minimum {min}")]
    CiphertextTooShort {
        /// Bytes received.
        actual: usize,
        /// Smallest valid cell.
        min: usize,
    },

    /// Unknown cell format version.
    #[error("invalid version byte: expected 0x01, got {0:#04x}")]
    InvalidVersion(u8),

    /// Authentication tag mismatch.
    #[error("authentication tag mismatch: the cell was tampered with or the wrong key was used")]
    TagMismatch,

    /// AES failed, e.g. bad padding after a valid tag.
    #[error("decryption failed: {0}")]
    Cipher(String),

    /// The plaintext could not be (de)normalized for the column's base type.
    #[error("type error: {0}")]
    Type(#[from] TypeError),
}
