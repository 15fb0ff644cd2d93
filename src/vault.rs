// =============================================================================
// CREDENTIAL VAULT
// =============================================================================
// Authenticated encryption of credential plaintext at rest.
//
// - Cipher: AES-256-GCM, 96-bit IV drawn from the OS RNG on every call,
//   128-bit tag stored separately from the ciphertext
// - Every stored payload carries the id of the key it was sealed with, so
//   keys can be rotated without a flag day (see rotation.rs)
// - Key material is injected as a `KeyRing`; nothing in here reads the
//   environment
//
// Nothing in this module logs plaintext, ciphertext or key bytes.
// =============================================================================

use std::collections::HashMap;
use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// GCM nonce length recommended by NIST SP 800-38D.
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("no key material configured for key id {0}")]
    KeyNotFound(String),

    #[error("key {key_id} must be {KEY_LEN} bytes, got {length}")]
    InvalidKeyLength { key_id: String, length: usize },

    /// Tag mismatch, wrong key, truncated IV/tag or garbage plaintext. The
    /// variants are collapsed on purpose so callers learn nothing about which.
    #[error("decryption failed")]
    AuthenticationFailed,

    #[error("encryption failed")]
    EncryptionFailed,
}

// =============================================================================
// KEY RING
// =============================================================================

/// Key id → key bytes. Ids are case-insensitive and stored lower-cased.
#[derive(Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, Zeroizing<Vec<u8>>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_id: &str, key: Vec<u8>) {
        self.keys.insert(key_id.to_lowercase(), Zeroizing::new(key));
    }

    /// Adds a key given as a hex string (64 hex chars for AES-256).
    pub fn insert_hex(&mut self, key_id: &str, hex_key: &str) -> Result<(), hex::FromHexError> {
        let bytes = hex::decode(hex_key.trim())?;
        self.insert(key_id, bytes);
        Ok(())
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.contains_key(&key_id.to_lowercase())
    }

    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn cipher(&self, key_id: &str) -> Result<Aes256Gcm, VaultError> {
        let key = self
            .keys
            .get(&key_id.to_lowercase())
            .ok_or_else(|| VaultError::KeyNotFound(key_id.to_string()))?;

        if key.len() != KEY_LEN {
            return Err(VaultError::InvalidKeyLength {
                key_id: key_id.to_string(),
                length: key.len(),
            });
        }

        Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::InvalidKeyLength {
            key_id: key_id.to_string(),
            length: key.len(),
        })
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("key_ids", &self.key_ids())
            .finish()
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Everything needed to decrypt one credential, as stored per inventory item.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub key_id: String,
}

impl fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field("ciphertext", &format_args!("<{} bytes>", self.ciphertext.len()))
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// A decrypted credential. Wiped from memory on drop; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    pub fn new(plaintext: impl Into<String>) -> Self {
        Self(Zeroizing::new(plaintext.into()))
    }

    /// The plaintext. Only the reveal handler and key rotation should call this.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

// =============================================================================
// VAULT
// =============================================================================

#[derive(Debug, Clone)]
pub struct Vault {
    keys: KeyRing,
    active_key_id: String,
}

impl Vault {
    /// Fails if the active key is missing or has the wrong length, so a
    /// misconfigured deployment refuses to start instead of failing on import.
    pub fn new(keys: KeyRing, active_key_id: &str) -> Result<Self, VaultError> {
        keys.cipher(active_key_id)?;
        Ok(Self {
            keys,
            active_key_id: active_key_id.to_lowercase(),
        })
    }

    /// Key id new credentials are sealed under.
    pub fn active_key_id(&self) -> &str {
        &self.active_key_id
    }

    pub fn has_key(&self, key_id: &str) -> bool {
        self.keys.contains(key_id)
    }

    pub fn encrypt(&self, plaintext: &str, key_id: &str) -> Result<EncryptedPayload, VaultError> {
        let cipher = self.keys.cipher(key_id)?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| VaultError::EncryptionFailed)?;

        Ok(EncryptedPayload {
            ciphertext: buffer,
            iv: iv.to_vec(),
            tag: tag.to_vec(),
            key_id: key_id.to_lowercase(),
        })
    }

    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Credential, VaultError> {
        let cipher = self.keys.cipher(&payload.key_id)?;

        // from_slice panics on a length mismatch, so check first.
        if payload.iv.len() != IV_LEN || payload.tag.len() != TAG_LEN {
            return Err(VaultError::AuthenticationFailed);
        }

        let mut buffer = Zeroizing::new(payload.ciphertext.clone());
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&payload.iv),
                b"",
                buffer.as_mut_slice(),
                GenericArray::from_slice(&payload.tag),
            )
            .map_err(|_| VaultError::AuthenticationFailed)?;

        let text = std::str::from_utf8(&buffer).map_err(|_| VaultError::AuthenticationFailed)?;
        Ok(Credential::new(text))
    }
}

// =============================================================================
// TEST FIXTURES
// =============================================================================

#[cfg(test)]
pub mod fixtures {
    use super::*;

    pub const KEY_V1: [u8; KEY_LEN] = [7u8; KEY_LEN];
    pub const KEY_V2: [u8; KEY_LEN] = [42u8; KEY_LEN];

    /// Vault with keys `v1` (active) and `v2`.
    pub fn test_vault() -> Vault {
        let mut keys = KeyRing::new();
        keys.insert("v1", KEY_V1.to_vec());
        keys.insert("v2", KEY_V2.to_vec());
        Vault::new(keys, "v1").expect("fixture keys are valid")
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_round_trip_for_varied_plaintexts() {
        let vault = test_vault();
        let samples = [
            "",
            "user@example.com:hunter2",
            "XXXX-YYYY-ZZZZ-0000",
            "ünïcødé ключ 鍵 🔑",
            &"a".repeat(5000),
        ];

        for key_id in ["v1", "v2"] {
            for plaintext in samples {
                let sealed = vault.encrypt(plaintext, key_id).unwrap();
                assert_eq!(sealed.key_id, key_id);
                assert_eq!(sealed.iv.len(), IV_LEN);
                assert_eq!(sealed.tag.len(), TAG_LEN);
                assert_eq!(vault.decrypt(&sealed).unwrap().expose(), plaintext);
            }
        }
    }

    #[test]
    fn test_iv_is_fresh_per_call() {
        let vault = test_vault();
        let a = vault.encrypt("same secret", "v1").unwrap();
        let b = vault.encrypt("same secret", "v1").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let vault = test_vault();
        let mut sealed = vault.encrypt("license-key-123", "v1").unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert_eq!(vault.decrypt(&sealed), Err(VaultError::AuthenticationFailed));
    }

    #[test]
    fn test_tampered_tag_fails_authentication() {
        let vault = test_vault();
        let mut sealed = vault.encrypt("license-key-123", "v1").unwrap();
        sealed.tag[15] ^= 0x80;
        assert_eq!(vault.decrypt(&sealed), Err(VaultError::AuthenticationFailed));

        sealed.tag.truncate(8);
        assert_eq!(vault.decrypt(&sealed), Err(VaultError::AuthenticationFailed));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let vault = test_vault();
        let mut sealed = vault.encrypt("license-key-123", "v1").unwrap();
        sealed.key_id = "v2".to_string();
        assert_eq!(vault.decrypt(&sealed), Err(VaultError::AuthenticationFailed));
    }

    #[test]
    fn test_unknown_key_id() {
        let vault = test_vault();
        assert_eq!(
            vault.encrypt("x", "v9").unwrap_err(),
            VaultError::KeyNotFound("v9".to_string())
        );
    }

    #[test]
    fn test_invalid_key_length() {
        let mut keys = KeyRing::new();
        keys.insert("short", vec![1u8; 16]);
        let err = Vault::new(keys, "short").unwrap_err();
        assert_eq!(
            err,
            VaultError::InvalidKeyLength {
                key_id: "short".to_string(),
                length: 16
            }
        );
    }

    #[test]
    fn test_key_ids_are_case_insensitive() {
        let mut keys = KeyRing::new();
        keys.insert_hex("V1", &hex::encode(KEY_V1)).unwrap();
        let vault = Vault::new(keys, "V1").unwrap();
        assert_eq!(vault.active_key_id(), "v1");
        let sealed = vault.encrypt("abc", "V1").unwrap();
        assert_eq!(vault.decrypt(&sealed).unwrap().expose(), "abc");
    }

    #[test]
    fn test_error_and_debug_output_leak_nothing() {
        let vault = test_vault();
        let sealed = vault.encrypt("top-secret-value", "v1").unwrap();
        let credential = vault.decrypt(&sealed).unwrap();

        assert_eq!(VaultError::AuthenticationFailed.to_string(), "decryption failed");
        assert!(!format!("{credential:?}").contains("top-secret"));
        assert!(!format!("{sealed:?}").contains(&hex::encode(&sealed.ciphertext)));
        assert!(!format!("{:?}", test_vault()).contains(&hex::encode(KEY_V1)));
    }
}
