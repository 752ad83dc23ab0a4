//! Cache of derived cell keys.
//!
//! Entries are keyed by `(key store name, encrypted key bytes)` and live for
//! as long as the cache does, which is one connection. There is no eviction:
//! a connection only ever sees the handful of keys its columns reference.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tds_protocol::CekValue;

use crate::aead::{CellKey, KEY_SIZE};
use crate::error::EncryptionError;
use crate::provider::KeyStoreRegistry;

type CacheKey = (String, Bytes);

/// Connection-scoped cache of [`CellKey`]s.
///
/// The provider runs at most once per distinct encrypted key as long as the
/// cache has a single owner driving it, which the connection guarantees.
#[derive(Default)]
pub struct KeyCache {
    entries: RwLock<HashMap<CacheKey, Arc<CellKey>>>,
}

impl KeyCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cell key for `value`, asking its provider on a miss.
    ///
    /// A root key of the wrong length is an error and is never cached.
    pub async fn get_or_load(
        &self,
        value: &CekValue,
        registry: &KeyStoreRegistry,
    ) -> Result<Arc<CellKey>, EncryptionError> {
        let cache_key = (value.key_store_name.clone(), value.encrypted_key.clone());
        if let Some(key) = self.entries.read().get(&cache_key) {
            tracing::debug!(key_store = %value.key_store_name, "column key cache hit");
            return Ok(Arc::clone(key));
        }

        tracing::debug!(
            key_store = %value.key_store_name,
            key_path = %value.key_path,
            "column key cache miss"
        );
        let provider = registry.get(&value.key_store_name)?;
        let root_key = provider
            .decrypt_cek(&value.key_path, &value.algorithm, &value.encrypted_key)
            .await?;
        if root_key.len() != KEY_SIZE {
            return Err(EncryptionError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: root_key.len(),
            });
        }
        let derived = Arc::new(CellKey::derive(&root_key)?);

        let mut entries = self.entries.write();
        let entry = entries.entry(cache_key).or_insert(derived);
        Ok(Arc::clone(entry))
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every cached key.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::InMemoryKeyStore;

    fn cek_value(store: &str, encrypted: &'static [u8]) -> CekValue {
        CekValue {
            encrypted_key: Bytes::from_static(encrypted),
            key_store_name: store.into(),
            key_path: "cmk/1".into(),
            algorithm: "RSA_OAEP".into(),
        }
    }

    #[tokio::test]
    async fn test_provider_called_once_per_encrypted_key() {
        let store = Arc::new(
            InMemoryKeyStore::new("TEST")
                .with_key(vec![1], vec![0u8; 32])
                .with_key(vec![2], vec![1u8; 32]),
        );
        let registry = KeyStoreRegistry::new().with_provider(Arc::clone(&store));
        let cache = KeyCache::new();

        cache.get_or_load(&cek_value("TEST", &[1]), &registry).await.unwrap();
        cache.get_or_load(&cek_value("TEST", &[1]), &registry).await.unwrap();
        assert_eq!(store.calls(), 1);

        cache.get_or_load(&cek_value("TEST", &[2]), &registry).await.unwrap();
        assert_eq!(store.calls(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_short_root_key_not_cached() {
        let store = Arc::new(InMemoryKeyStore::new("TEST").with_key(vec![1], vec![0u8; 16]));
        let registry = KeyStoreRegistry::new().with_provider(Arc::clone(&store));
        let cache = KeyCache::new();

        for _ in 0..2 {
            let err = cache
                .get_or_load(&cek_value("TEST", &[1]), &registry)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                EncryptionError::InvalidKeyLength {
                    expected: 32,
                    actual: 16
                }
            ));
        }
        assert!(cache.is_empty());
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_store() {
        let cache = KeyCache::new();
        let err = cache
            .get_or_load(&cek_value("MISSING", &[1]), &KeyStoreRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::KeyStoreNotFound(_)));
    }
}
