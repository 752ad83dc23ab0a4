//! # mssql-auth
//!
//! Login credentials and Always Encrypted for SQL Server connections.
//!
//! ## Always Encrypted
//!
//! Column values protected with Always Encrypted are encrypted and
//! decrypted on the client. The server only ever sees ciphertext.
//!
//! ```text
//! Column Master Key (external key store)
//!   │ wraps
//!   ▼
//! Column Encryption Key (sent encrypted in column metadata)
//!   │ HMAC-SHA256 derivation
//!   ▼
//! encryption / MAC / IV sub-keys ──► AEAD_AES_256_CBC_HMAC_SHA256 cells
//! ```
//!
//! The [`AlwaysEncryptedEngine`] asks a registered [`KeyStoreProvider`] to
//! unwrap each column encryption key once, caches the derived
//! [`CellKey`], and normalizes values through `mssql-types` before
//! encrypting them.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod aead;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod key_cache;
pub mod provider;

pub use aead::CellKey;
pub use credentials::Credentials;
pub use engine::AlwaysEncryptedEngine;
pub use error::{AuthError, EncryptionError};
pub use key_cache::KeyCache;
pub use provider::{InMemoryKeyStore, KeyStoreProvider, KeyStoreRegistry};
