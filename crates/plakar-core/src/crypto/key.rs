use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{PlakarError, Result};

/// The repository master key material — never stored in plaintext on disk.
/// Zeroized on drop so key material does not linger in memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    pub encryption_key: [u8; 32],
    pub mac_key: [u8; 32],
}

/// Serialized payload inside the sealed key blob.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct MasterKeyPayload {
    encryption_key: Vec<u8>,
    mac_key: Vec<u8>,
}

/// KDF parameters stored alongside the sealed key in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

/// Sealed master key, embedded in the repository configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedKey {
    pub kdf: KdfParams,
    pub nonce: Vec<u8>,
    pub payload: Vec<u8>,
}

// KDF parameter bounds to reject maliciously crafted configuration documents.
const MAX_TIME_COST: u32 = 10;
const MAX_PARALLELISM: u32 = 16;
const MAX_MEMORY_KIB: u32 = 524_288; // 512 MiB
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

fn validate_kdf_params(kdf: &KdfParams) -> Result<()> {
    if kdf.algorithm != "argon2id" {
        return Err(PlakarError::Auth);
    }
    if kdf.time_cost == 0 || kdf.time_cost > MAX_TIME_COST {
        return Err(PlakarError::Auth);
    }
    if kdf.parallelism == 0 || kdf.parallelism > MAX_PARALLELISM {
        return Err(PlakarError::Auth);
    }
    if kdf.memory_cost == 0 || kdf.memory_cost > MAX_MEMORY_KIB {
        return Err(PlakarError::Auth);
    }
    if kdf.salt.len() < MIN_SALT_LEN || kdf.salt.len() > MAX_SALT_LEN {
        return Err(PlakarError::Auth);
    }
    Ok(())
}

impl MasterKey {
    /// Generate a new random master key from OS entropy.
    pub fn generate() -> Self {
        let mut encryption_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut encryption_key);
        rand::rngs::OsRng.fill_bytes(&mut mac_key);
        Self {
            encryption_key,
            mac_key,
        }
    }

    /// Seal the master key with a passphrase using Argon2id + AES-256-GCM.
    pub fn seal(&self, passphrase: &str) -> Result<SealedKey> {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let kdf = KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: 3,
            memory_cost: 65536, // 64 MiB
            parallelism: 4,
            salt,
        };
        let wrapping_key = derive_key_from_passphrase(passphrase, &kdf)?;

        let payload = MasterKeyPayload {
            encryption_key: self.encryption_key.to_vec(),
            mac_key: self.mac_key.to_vec(),
        };
        let plaintext = Zeroizing::new(rmp_serde::to_vec(&payload)?);

        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|e| PlakarError::Config(format!("cipher init: {e}")))?;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| PlakarError::Config(format!("seal: {e}")))?;

        Ok(SealedKey {
            kdf,
            nonce: nonce_bytes.to_vec(),
            payload: ciphertext,
        })
    }

    /// Unseal the master key with the given passphrase.
    /// A wrong passphrase is indistinguishable from a corrupted blob and
    /// surfaces as `Auth`.
    pub fn unseal(sealed: &SealedKey, passphrase: &str) -> Result<Self> {
        if sealed.nonce.len() != 12 {
            return Err(PlakarError::Auth);
        }
        validate_kdf_params(&sealed.kdf)?;

        let wrapping_key = derive_key_from_passphrase(passphrase, &sealed.kdf)?;
        let cipher =
            Aes256Gcm::new_from_slice(wrapping_key.as_ref()).map_err(|_| PlakarError::Auth)?;
        let nonce = Nonce::from_slice(&sealed.nonce);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(nonce, sealed.payload.as_slice())
                .map_err(|_| PlakarError::Auth)?,
        );

        let payload: MasterKeyPayload =
            rmp_serde::from_slice(&plaintext).map_err(|_| PlakarError::Auth)?;
        if payload.encryption_key.len() != 32 || payload.mac_key.len() != 32 {
            return Err(PlakarError::Auth);
        }

        let mut encryption_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        encryption_key.copy_from_slice(&payload.encryption_key);
        mac_key.copy_from_slice(&payload.mac_key);
        Ok(Self {
            encryption_key,
            mac_key,
        })
    }
}

/// Derive a 32-byte wrapping key from a passphrase using Argon2id.
fn derive_key_from_passphrase(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| PlakarError::Config(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| PlakarError::Config(format!("argon2 hash: {e}")))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PASSPHRASE: &str = "test-passphrase-123";

    #[test]
    fn seal_unseal_roundtrip() {
        let key = MasterKey::generate();
        let sealed = key.seal(TEST_PASSPHRASE).unwrap();
        let unsealed = MasterKey::unseal(&sealed, TEST_PASSPHRASE).unwrap();
        assert_eq!(key.encryption_key, unsealed.encryption_key);
        assert_eq!(key.mac_key, unsealed.mac_key);
    }

    #[test]
    fn wrong_passphrase_rejected() {
        let key = MasterKey::generate();
        let sealed = key.seal(TEST_PASSPHRASE).unwrap();
        assert!(matches!(
            MasterKey::unseal(&sealed, "not-the-passphrase"),
            Err(PlakarError::Auth)
        ));
    }

    #[test]
    fn bad_nonce_length_rejected() {
        let key = MasterKey::generate();
        let mut sealed = key.seal(TEST_PASSPHRASE).unwrap();
        sealed.nonce = vec![0u8; 8];
        assert!(matches!(
            MasterKey::unseal(&sealed, TEST_PASSPHRASE),
            Err(PlakarError::Auth)
        ));
    }

    #[test]
    fn excessive_kdf_memory_rejected() {
        let key = MasterKey::generate();
        let mut sealed = key.seal(TEST_PASSPHRASE).unwrap();
        sealed.kdf.memory_cost = u32::MAX;
        assert!(matches!(
            MasterKey::unseal(&sealed, TEST_PASSPHRASE),
            Err(PlakarError::Auth)
        ));
    }

    #[test]
    fn unknown_kdf_algorithm_rejected() {
        let key = MasterKey::generate();
        let mut sealed = key.seal(TEST_PASSPHRASE).unwrap();
        sealed.kdf.algorithm = "scrypt".into();
        assert!(matches!(
            MasterKey::unseal(&sealed, TEST_PASSPHRASE),
            Err(PlakarError::Auth)
        ));
    }
}
