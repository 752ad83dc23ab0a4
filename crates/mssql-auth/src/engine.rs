//! Transparent column encryption.
//!
//! [`AlwaysEncryptedEngine`] ties the pieces together: it resolves the
//! column encryption key named by a column's [`CryptoMetadata`] through the
//! [`KeyCache`], normalizes values to their canonical byte form and runs
//! the cell cipher over them.

use std::sync::Arc;

use bytes::Bytes;
use mssql_types::{SqlValue, denormalize, normalize};
use tds_protocol::crypto::AEAD_AES_256_CBC_HMAC_SHA256;
use tds_protocol::{CryptoMetadata, EncryptionType};

use crate::aead::CellKey;
use crate::error::EncryptionError;
use crate::key_cache::KeyCache;
use crate::provider::KeyStoreRegistry;

/// Encrypts outgoing parameters and decrypts incoming cells.
#[derive(Debug)]
pub struct AlwaysEncryptedEngine {
    registry: Arc<KeyStoreRegistry>,
    cache: KeyCache,
}

impl AlwaysEncryptedEngine {
    /// Create an engine with an empty key cache.
    pub fn new(registry: Arc<KeyStoreRegistry>) -> Self {
        Self {
            registry,
            cache: KeyCache::new(),
        }
    }

    /// The key cache, mainly for inspection.
    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Encrypt `value` for a column described by `meta`.
    ///
    /// NULL is sent as NULL and yields `None`.
    pub async fn encrypt(
        &self,
        value: &SqlValue,
        meta: &CryptoMetadata,
    ) -> Result<Option<Bytes>, EncryptionError> {
        let Some(plaintext) = normalize(&meta.base_type, value)? else {
            return Ok(None);
        };
        let key = self.resolve(meta).await?;
        let cell = key.encrypt(&plaintext, meta.encryption_type)?;
        Ok(Some(Bytes::from(cell)))
    }

    /// Authenticate and decrypt a cell into the column's base type.
    pub async fn decrypt(
        &self,
        cell: &[u8],
        meta: &CryptoMetadata,
    ) -> Result<SqlValue, EncryptionError> {
        let key = self.resolve(meta).await?;
        let plaintext = key.decrypt(cell)?;
        Ok(denormalize(&meta.base_type, &plaintext)?)
    }

    /// Find the cell key for `meta`, trying each encrypted copy of the CEK
    /// in order until one unwraps.
    async fn resolve(&self, meta: &CryptoMetadata) -> Result<Arc<CellKey>, EncryptionError> {
        if meta.encryption_type == EncryptionType::Plaintext {
            return Err(EncryptionError::MetadataNotAvailable(
                "column is not encrypted".into(),
            ));
        }
        if meta.algorithm() != AEAD_AES_256_CBC_HMAC_SHA256 {
            return Err(EncryptionError::UnsupportedAlgorithm(
                meta.algorithm().to_owned(),
            ));
        }
        let entry = meta.cek.as_deref().ok_or_else(|| {
            EncryptionError::MetadataNotAvailable(format!(
                "no column encryption key for ordinal {}",
                meta.ordinal
            ))
        })?;

        let mut last_error = None;
        for value in &entry.values {
            match self.cache.get_or_load(value, &self.registry).await {
                Ok(key) => return Ok(key),
                Err(e @ EncryptionError::InvalidKeyLength { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        key_store = %value.key_store_name,
                        error = %e,
                        "failed to unwrap column encryption key, trying next value"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            EncryptionError::MetadataNotAvailable(format!(
                "column encryption key {} has no values",
                entry.cek_id
            ))
        }))
    }
}
