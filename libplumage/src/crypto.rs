//! At-rest encryption for tokens and DPoP private keys
//!
//! AES-256-GCM with a key derived from the configured secret by a
//! single SHA-256 pass. Every encryption draws a fresh 96-bit nonce, so
//! identical plaintexts never produce identical ciphertexts. The stored
//! form is `b64(iv).b64(tag).b64(ciphertext)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::MIN_ENCRYPTION_KEY_BYTES;
use crate::error::{CryptoError, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Symmetric cipher for everything the token store persists.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Derive the AES key from the configured secret.
    ///
    /// # Errors
    ///
    /// Fails when the secret is shorter than the 32-byte minimum. The
    /// secret itself never appears in logs or error messages.
    pub fn new(secret: &str) -> Result<Self> {
        if secret.len() < MIN_ENCRYPTION_KEY_BYTES {
            return Err(CryptoError::KeyTooShort {
                min: MIN_ENCRYPTION_KEY_BYTES,
                got: secret.len(),
            }
            .into());
        }

        let key_bytes = Sha256::digest(secret.as_bytes());
        let key = aes_gcm::Key::<Aes256Gcm>::from_slice(&key_bytes);

        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt a secret value for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // aes-gcm appends the 16-byte tag to the ciphertext
        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let split = sealed.len() - TAG_LEN;
        let (ciphertext, tag) = sealed.split_at(split);

        Ok(format!(
            "{}.{}.{}",
            STANDARD.encode(nonce_bytes),
            STANDARD.encode(tag),
            STANDARD.encode(ciphertext)
        ))
    }

    /// Decrypt a value previously produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let parts: Vec<&str> = stored.split('.').collect();
        if parts.len() != 3 {
            return Err(CryptoError::Malformed(format!(
                "expected 3 segments, got {}",
                parts.len()
            ))
            .into());
        }

        let iv = STANDARD
            .decode(parts[0])
            .map_err(|e| CryptoError::Malformed(format!("iv: {}", e)))?;
        let tag = STANDARD
            .decode(parts[1])
            .map_err(|e| CryptoError::Malformed(format!("tag: {}", e)))?;
        let ciphertext = STANDARD
            .decode(parts[2])
            .map_err(|e| CryptoError::Malformed(format!("ciphertext: {}", e)))?;

        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(CryptoError::Malformed("bad iv or tag length".to_string()).into());
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let nonce = Nonce::from_slice(&iv);
        let plaintext = self
            .cipher
            .decrypt(nonce, sealed.as_ref())
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Decrypt(format!("invalid UTF-8: {}", e)).into())
    }
}
