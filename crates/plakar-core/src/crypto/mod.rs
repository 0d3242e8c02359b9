pub mod key;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::error::{PlakarError, Result};

/// Authenticated encryption for every persisted blob.
/// The algorithm is fixed at repository creation; `aad` binds the blob type
/// tag so ciphertexts cannot be replayed under a different type.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt plaintext. Returns `[12-byte nonce][ciphertext + 16-byte tag]`.
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt`. `aad` must match.
    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Whether this engine actually encrypts data.
    fn is_encrypting(&self) -> bool;
}

/// No-encryption engine for unencrypted repositories.
pub struct PlaintextEngine;

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_encrypting(&self) -> bool {
        false
    }
}

/// AES-256-GCM engine keyed with the repository's master encryption key.
pub struct Aes256GcmEngine {
    cipher: Aes256Gcm,
}

impl Aes256GcmEngine {
    pub fn new(encryption_key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(encryption_key).expect("32-byte AES-256 key");
        Self { cipher }
    }
}

impl CryptoEngine for Aes256GcmEngine {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| PlakarError::Integrity(format!("encrypt: {e}")))?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 12 + 16 {
            return Err(PlakarError::Integrity("ciphertext too short".into()));
        }
        let nonce = Nonce::from_slice(&data[..12]);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &data[12..],
                    aad,
                },
            )
            .map_err(|_| PlakarError::Integrity("decryption failed".into()))
    }

    fn is_encrypting(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_roundtrip() {
        let engine = Aes256GcmEngine::new(&[0x42; 32]);
        let ciphertext = engine.encrypt(b"secret payload", b"aad").unwrap();
        assert_ne!(&ciphertext[12..], b"secret payload");
        let plaintext = engine.decrypt(&ciphertext, b"aad").unwrap();
        assert_eq!(plaintext, b"secret payload");
    }

    #[test]
    fn aes_rejects_wrong_aad() {
        let engine = Aes256GcmEngine::new(&[0x42; 32]);
        let ciphertext = engine.encrypt(b"payload", b"type-1").unwrap();
        assert!(engine.decrypt(&ciphertext, b"type-2").is_err());
    }

    #[test]
    fn aes_rejects_flipped_byte() {
        let engine = Aes256GcmEngine::new(&[0x42; 32]);
        let mut ciphertext = engine.encrypt(b"payload", b"").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(engine.decrypt(&ciphertext, b"").is_err());
    }

    #[test]
    fn plaintext_engine_is_identity() {
        let engine = PlaintextEngine;
        let out = engine.encrypt(b"data", b"aad").unwrap();
        assert_eq!(out, b"data");
        assert!(!engine.is_encrypting());
    }
}
