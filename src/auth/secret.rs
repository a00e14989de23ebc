//! Shared-secret encryption
//!
//! Device shared secrets are persisted as AES-256-GCM ciphertext
//! (nonce ‖ ciphertext, base64) under a master key from configuration.
//! The plaintext only exists transiently during password derivation.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    #[error("Failed to encrypt secret")]
    EncryptionFailed,
    #[error("Failed to decrypt secret")]
    DecryptionFailed,
}

/// AES-256-GCM cipher for stored device secrets.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Build a cipher from the configured master key. Keys shorter than
    /// 32 bytes are stretched with a single SHA-256 digest so any
    /// configured string yields a usable key.
    pub fn new(master_key: &[u8]) -> Self {
        let key: [u8; 32] = if master_key.len() >= 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&master_key[..32]);
            key
        } else {
            Sha256::digest(master_key).into()
        };
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Encrypt a plaintext secret to `base64(nonce ‖ ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SecretError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        self.cipher
            .encrypt(&nonce, plaintext)
            .map(|ciphertext| {
                let mut combined = nonce.to_vec();
                combined.extend_from_slice(&ciphertext);
                base64::engine::general_purpose::STANDARD.encode(combined)
            })
            .map_err(|_| SecretError::EncryptionFailed)
    }

    /// Decrypt a `base64(nonce ‖ ciphertext)` value.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, SecretError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| SecretError::DecryptionFailed)?;

        if combined.len() < NONCE_LEN {
            return Err(SecretError::DecryptionFailed);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| SecretError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = SecretCipher::new(b"0123456789abcdef0123456789abcdef");
        let encrypted = cipher.encrypt(b"device-secret").unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), b"device-secret");
        // Fresh nonce per call
        assert_ne!(cipher.encrypt(b"device-secret").unwrap(), encrypted);
    }

    #[test]
    fn short_key_is_stretched() {
        let cipher = SecretCipher::new(b"short");
        let encrypted = cipher.encrypt(b"x").unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), b"x");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let a = SecretCipher::new(b"0123456789abcdef0123456789abcdef");
        let b = SecretCipher::new(b"fedcba9876543210fedcba9876543210");
        let encrypted = a.encrypt(b"secret").unwrap();
        assert_eq!(b.decrypt(&encrypted), Err(SecretError::DecryptionFailed));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let cipher = SecretCipher::new(b"0123456789abcdef0123456789abcdef");
        assert!(cipher.decrypt("AAAA").is_err());
        assert!(cipher.decrypt("!!not-base64!!").is_err());
    }
}
