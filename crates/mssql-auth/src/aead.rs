//! AEAD_AES_256_CBC_HMAC_SHA256, the Always Encrypted cell cipher.
//!
//! Encrypt-then-MAC over AES-256-CBC with PKCS#7 padding:
//!
//! 1. Derive encryption, MAC and IV sub-keys from the 32-byte root key.
//! 2. Pick the IV: random for randomized encryption, or the first 16 bytes
//!    of `HMAC(iv_key, plaintext)` for deterministic encryption.
//! 3. Encrypt, then authenticate `version ‖ IV ‖ ciphertext ‖ version_len`.
//!
//! ## Cell Format
//!
//! ```text
//! ┌──────────┬────────────┬────────────┬─────────────────────────┐
//! │ Version  │    Tag     │     IV     │   AES-256-CBC Cipher    │
//! │ (1 byte) │ (32 bytes) │ (16 bytes) │   (variable, min 16)    │
//! └──────────┴────────────┴────────────┴─────────────────────────┘
//! ```

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tds_protocol::EncryptionType;
use tds_protocol::crypto::AEAD_AES_256_CBC_HMAC_SHA256;

use crate::error::EncryptionError;

/// Cell format version.
const VERSION_BYTE: u8 = 0x01;

/// Length of the version field, appended to the MAC input.
const VERSION_LEN: u8 = 0x01;

/// AES block size in bytes.
const BLOCK_SIZE: usize = 16;

/// Root and sub-key size in bytes.
pub const KEY_SIZE: usize = 32;

/// HMAC-SHA256 output size in bytes.
const TAG_SIZE: usize = 32;

const IV_SIZE: usize = BLOCK_SIZE;

/// version + tag + IV + one block.
pub const MIN_CELL_SIZE: usize = 1 + TAG_SIZE + IV_SIZE + BLOCK_SIZE;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// The three sub-keys derived from one column encryption key.
///
/// Built once per distinct key and shared through the key cache.
#[derive(Clone)]
pub struct CellKey {
    enc_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
    iv_key: [u8; KEY_SIZE],
}

impl CellKey {
    /// Derive the sub-keys from a decrypted root key.
    ///
    /// Each sub-key is `HMAC-SHA256(root, salt)` where the salt is the
    /// UTF-16LE text
    /// `Microsoft SQL Server cell <purpose> key with encryption algorithm:<name> and key length:256`.
    pub fn derive(root_key: &[u8]) -> Result<Self, EncryptionError> {
        if root_key.len() != KEY_SIZE {
            return Err(EncryptionError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: root_key.len(),
            });
        }

        Ok(Self {
            enc_key: derive_sub_key(root_key, "encryption")?,
            mac_key: derive_sub_key(root_key, "MAC")?,
            iv_key: derive_sub_key(root_key, "IV")?,
        })
    }

    /// Encrypt `plaintext` into a cell.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        encryption_type: EncryptionType,
    ) -> Result<Vec<u8>, EncryptionError> {
        let iv = match encryption_type {
            EncryptionType::Randomized => {
                let mut iv = [0u8; IV_SIZE];
                rand::thread_rng().fill_bytes(&mut iv);
                iv
            }
            EncryptionType::Deterministic => {
                let digest = hmac(&self.iv_key, &[plaintext])?;
                let mut iv = [0u8; IV_SIZE];
                iv.copy_from_slice(&digest[..IV_SIZE]);
                iv
            }
            EncryptionType::Plaintext => {
                return Err(EncryptionError::UnsupportedAlgorithm(
                    "column is not encrypted".into(),
                ));
            }
        };

        let ciphertext = Aes256CbcEnc::new_from_slices(&self.enc_key, &iv)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let tag = self.tag(&iv, &ciphertext)?;

        let mut cell = Vec::with_capacity(1 + TAG_SIZE + IV_SIZE + ciphertext.len());
        cell.push(VERSION_BYTE);
        cell.extend_from_slice(&tag);
        cell.extend_from_slice(&iv);
        cell.extend_from_slice(&ciphertext);
        Ok(cell)
    }

    /// Authenticate and decrypt a cell.
    ///
    /// The tag is checked before any decryption is attempted.
    pub fn decrypt(&self, cell: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if cell.len() < MIN_CELL_SIZE {
            return Err(EncryptionError::CiphertextTooShort {
                actual: cell.len(),
                min: MIN_CELL_SIZE,
            });
        }
        if cell[0] != VERSION_BYTE {
            return Err(EncryptionError::InvalidVersion(cell[0]));
        }

        let stored_tag = &cell[1..1 + TAG_SIZE];
        let iv = &cell[1 + TAG_SIZE..1 + TAG_SIZE + IV_SIZE];
        let ciphertext = &cell[1 + TAG_SIZE + IV_SIZE..];
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(EncryptionError::Cipher(
                "ciphertext is not a whole number of blocks".into(),
            ));
        }

        let expected = self.tag(iv, ciphertext)?;
        if !constant_time_eq(stored_tag, &expected) {
            return Err(EncryptionError::TagMismatch);
        }

        Aes256CbcDec::new_from_slices(&self.enc_key, iv)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))
    }

    fn tag(&self, iv: &[u8], ciphertext: &[u8]) -> Result<[u8; TAG_SIZE], EncryptionError> {
        hmac(
            &self.mac_key,
            &[&[VERSION_BYTE], iv, ciphertext, &[VERSION_LEN]],
        )
    }
}

impl Drop for CellKey {
    fn drop(&mut self) {
        self.enc_key.fill(0);
        self.mac_key.fill(0);
        self.iv_key.fill(0);
    }
}

impl std::fmt::Debug for CellKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellKey").finish_non_exhaustive()
    }
}

fn derive_sub_key(root_key: &[u8], purpose: &str) -> Result<[u8; KEY_SIZE], EncryptionError> {
    let salt = format!(
        "Microsoft SQL Server cell {purpose} key with encryption algorithm:\
         {AEAD_AES_256_CBC_HMAC_SHA256} and key length:{}",
        KEY_SIZE * 8
    );
    let salt: Vec<u8> = salt.encode_utf16().flat_map(u16::to_le_bytes).collect();
    hmac(root_key, &[&salt])
}

fn hmac(key: &[u8], parts: &[&[u8]]) -> Result<[u8; TAG_SIZE], EncryptionError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| EncryptionError::Cipher(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_sub_key_derivation_vectors() {
        let key = CellKey::derive(&[0u8; 32]).unwrap();
        assert_eq!(
            key.enc_key.to_vec(),
            hex("02c735a87529f1d1eb3853852c2a45cf667331dda269c18feac9aec29675b349")
        );
        assert_eq!(
            key.mac_key.to_vec(),
            hex("9d1f2295e509519ed0f1bff77659713280a3651fa2d7a7023abd1ba519012573")
        );
        assert_eq!(
            key.iv_key.to_vec(),
            hex("e45dfdea81075d68ef80e4eee4cee69f55b5dd96c8d1d9afbcc895f0c17e2bcb")
        );
    }

    #[test]
    fn test_deterministic_cell_vector() {
        let key = CellKey::derive(&[0u8; 32]).unwrap();
        let cell = key
            .encrypt(&123i64.to_le_bytes(), EncryptionType::Deterministic)
            .unwrap();
        assert_eq!(
            cell,
            hex(concat!(
                "011c88e4afa31aa2187da905fd0ee71d94edfd03c1054fcf9d8e3bd545719fae00",
                "2ea5647a8a60cc7eb1af52421bed15cdddf858dca027ae2b7a4eb9d5c02d1d19"
            ))
        );
        assert_eq!(key.decrypt(&cell).unwrap(), 123i64.to_le_bytes());
    }

    #[test]
    fn test_wrong_root_key_length() {
        assert!(matches!(
            CellKey::derive(&[0u8; 16]),
            Err(EncryptionError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_randomized_roundtrip_differs() {
        let key = CellKey::derive(&[7u8; 32]).unwrap();
        let a = key.encrypt(b"same", EncryptionType::Randomized).unwrap();
        let b = key.encrypt(b"same", EncryptionType::Randomized).unwrap();
        assert_ne!(a, b);
        assert_eq!(key.decrypt(&a).unwrap(), b"same");
        assert_eq!(key.decrypt(&b).unwrap(), b"same");
    }

    #[test]
    fn test_any_tag_byte_flip_fails() {
        let key = CellKey::derive(&[0u8; 32]).unwrap();
        let cell = key.encrypt(b"secret", EncryptionType::Randomized).unwrap();
        for i in 1..=TAG_SIZE {
            let mut tampered = cell.clone();
            tampered[i] ^= 0x01;
            assert!(matches!(
                key.decrypt(&tampered),
                Err(EncryptionError::TagMismatch)
            ));
        }
    }

    #[test]
    fn test_ciphertext_flip_fails() {
        let key = CellKey::derive(&[0u8; 32]).unwrap();
        let mut cell = key.encrypt(b"secret", EncryptionType::Randomized).unwrap();
        let last = cell.len() - 1;
        cell[last] ^= 0xFF;
        assert!(matches!(key.decrypt(&cell), Err(EncryptionError::TagMismatch)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let cell = CellKey::derive(&[1u8; 32])
            .unwrap()
            .encrypt(b"secret", EncryptionType::Deterministic)
            .unwrap();
        let other = CellKey::derive(&[2u8; 32]).unwrap();
        assert!(other.decrypt(&cell).is_err());
    }

    #[test]
    fn test_malformed_cells() {
        let key = CellKey::derive(&[0u8; 32]).unwrap();
        assert!(matches!(
            key.decrypt(&[0u8; 10]),
            Err(EncryptionError::CiphertextTooShort { actual: 10, .. })
        ));

        let mut cell = key.encrypt(b"x", EncryptionType::Randomized).unwrap();
        cell[0] = 0x02;
        assert!(matches!(
            key.decrypt(&cell),
            Err(EncryptionError::InvalidVersion(0x02))
        ));
    }

    #[test]
    fn test_empty_and_large_plaintext() {
        let key = CellKey::derive(&[9u8; 32]).unwrap();
        let empty = key.encrypt(b"", EncryptionType::Randomized).unwrap();
        assert_eq!(empty.len(), MIN_CELL_SIZE);
        assert!(key.decrypt(&empty).unwrap().is_empty());

        let large: Vec<u8> = (0..10_240).map(|i| (i % 251) as u8).collect();
        let cell = key.encrypt(&large, EncryptionType::Randomized).unwrap();
        assert_eq!(key.decrypt(&cell).unwrap(), large);
    }

    #[test]
    fn test_plaintext_type_refused() {
        let key = CellKey::derive(&[0u8; 32]).unwrap();
        assert!(key.encrypt(b"x", EncryptionType::Plaintext).is_err());
    }
}
