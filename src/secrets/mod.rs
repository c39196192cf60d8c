//! Symmetric envelope for stored credentials
//!
//! Router passwords, API tokens and WireGuard private keys are stored as
//! opaque ciphertext strings. The envelope key is derived once at startup
//! from the configured key and salt; a ciphertext produced under a
//! different key fails to decrypt with a distinguished error that callers
//! surface as "re-enter credentials".

use crate::config::Settings;
use crate::error::{Result, WirewanError};
use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// PBKDF2 iteration count for envelope key derivation
const KDF_ITERATIONS: u32 = 100_000;

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// Encrypts and decrypts credential strings with a key derived from the
/// configured key material.
pub struct SecretEnvelope {
    cipher: Aes256Gcm,
}

impl SecretEnvelope {
    /// Build the envelope from validated settings.
    ///
    /// Fails when the encryption key or salt is absent; `main` treats this
    /// as fatal at boot.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let key = settings.encryption_key.as_deref().unwrap_or_default();
        let salt = settings.encryption_salt.as_deref().unwrap_or_default();
        Ok(Self::derive(key, salt))
    }

    /// Derive the envelope directly from key material.
    pub fn derive(key: &str, salt: &str) -> Self {
        let mut derived = [0u8; 32];
        pbkdf2_hmac::<Sha256>(key.as_bytes(), salt.as_bytes(), KDF_ITERATIONS, &mut derived);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived));
        Self { cipher }
    }

    /// Encrypt a UTF-8 string to an opaque ciphertext string.
    ///
    /// The empty string round-trips unchanged so that unset credentials
    /// stay unset.
    pub fn encrypt(&self, value: &str) -> Result<String> {
        if value.is_empty() {
            return Ok(String::new());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, value.as_bytes())
            .map_err(|_| WirewanError::Serialization("Encryption failed".to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypt a ciphertext string produced by [`encrypt`](Self::encrypt).
    ///
    /// Returns [`WirewanError::SecretUnreadable`] for ciphertext produced
    /// under a different key or salt, or for malformed input.
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        if encrypted.is_empty() {
            return Ok(String::new());
        }
        let combined = BASE64.decode(encrypted).map_err(|_| {
            WirewanError::SecretUnreadable("stored value is not valid ciphertext".to_string())
        })?;
        if combined.len() <= NONCE_LEN {
            return Err(WirewanError::SecretUnreadable(
                "stored value is truncated".to_string(),
            ));
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                WirewanError::SecretUnreadable(
                    "decryption failed; the encryption key may have changed".to_string(),
                )
            })?;
        String::from_utf8(plaintext).map_err(|_| {
            WirewanError::SecretUnreadable("decrypted value is not UTF-8".to_string())
        })
    }
}
