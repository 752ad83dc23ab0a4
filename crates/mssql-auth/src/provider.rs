//! Key store providers.
//!
//! A column encryption key travels in the column metadata encrypted under a
//! column master key that lives in an external key store (Azure Key Vault,
//! a certificate store, an HSM). The driver never talks to those stores
//! itself: callers register a [`KeyStoreProvider`] per store name and the
//! engine hands it the encrypted key when it first needs the plaintext.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::EncryptionError;

/// A source of decrypted column encryption keys.
///
/// # Example
///
/// ```rust,ignore
/// struct VaultProvider { client: VaultClient }
///
/// #[async_trait::async_trait]
/// impl KeyStoreProvider for VaultProvider {
///     fn provider_name(&self) -> &str {
///         "AZURE_KEY_VAULT"
///     }
///
///     async fn decrypt_cek(
///         &self,
///         cmk_path: &str,
///         algorithm: &str,
///         encrypted_cek: &[u8],
///     ) -> Result<Vec<u8>, EncryptionError> {
///         self.client.unwrap_key(cmk_path, algorithm, encrypted_cek).await
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait KeyStoreProvider: Send + Sync {
    /// The key store name as it appears in the CEK metadata.
    fn provider_name(&self) -> &str;

    /// Decrypt a column encryption key with the master key at `cmk_path`.
    ///
    /// `algorithm` is the asymmetric algorithm named in the metadata
    /// (usually `RSA_OAEP`). The returned bytes are the root key of the
    /// cell cipher.
    async fn decrypt_cek(
        &self,
        cmk_path: &str,
        algorithm: &str,
        encrypted_cek: &[u8],
    ) -> Result<Vec<u8>, EncryptionError>;
}

/// Named key store providers configured for a connection.
#[derive(Clone, Default)]
pub struct KeyStoreRegistry {
    providers: HashMap<String, Arc<dyn KeyStoreProvider>>,
}

impl KeyStoreRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous one.
    pub fn register(&mut self, provider: impl KeyStoreProvider + 'static) {
        let provider: Arc<dyn KeyStoreProvider> = Arc::new(provider);
        self.providers
            .insert(provider.provider_name().to_owned(), provider);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_provider(mut self, provider: impl KeyStoreProvider + 'static) -> Self {
        self.register(provider);
        self
    }

    /// Look up a provider by key store name.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn KeyStoreProvider>, EncryptionError> {
        self.providers
            .get(name)
            .ok_or_else(|| EncryptionError::KeyStoreNotFound(name.to_owned()))
    }

    /// Whether no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for KeyStoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.providers.keys().collect();
        names.sort();
        f.debug_struct("KeyStoreRegistry")
            .field("providers", &names)
            .finish()
    }
}

/// Key store that holds plaintext keys in memory.
///
/// Keys are registered against the encrypted bytes the server will send,
/// so no master key cryptography takes place. Intended for tests and local
/// development only.
pub struct InMemoryKeyStore {
    name: String,
    keys: HashMap<Vec<u8>, Vec<u8>>,
    calls: AtomicUsize,
}

impl InMemoryKeyStore {
    /// Create an empty store reporting `name` as its provider name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Map `encrypted_cek` to the root key `root_key`.
    #[must_use]
    pub fn with_key(mut self, encrypted_cek: impl Into<Vec<u8>>, root_key: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(encrypted_cek.into(), root_key.into());
        self
    }

    /// How many times [`decrypt_cek`](KeyStoreProvider::decrypt_cek) has run.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for InMemoryKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryKeyStore")
            .field("name", &self.name)
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl KeyStoreProvider for InMemoryKeyStore {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn decrypt_cek(
        &self,
        cmk_path: &str,
        _algorithm: &str,
        encrypted_cek: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.keys
            .get(encrypted_cek)
            .cloned()
            .ok_or_else(|| EncryptionError::Provider {
                provider: self.name.clone(),
                message: format!("no key registered for master key {cmk_path}"),
            })
    }
}

/// Shared handle so a test can keep counting calls after registering.
#[async_trait::async_trait]
impl<P: KeyStoreProvider + ?Sized> KeyStoreProvider for Arc<P> {
    fn provider_name(&self) -> &str {
        (**self).provider_name()
    }

    async fn decrypt_cek(
        &self,
        cmk_path: &str,
        algorithm: &str,
        encrypted_cek: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        (**self).decrypt_cek(cmk_path, algorithm, encrypted_cek).await
    }
}
