use std::sync::Arc;

use crate::compress::{self, CompressionAlgorithm};
use crate::crypto::CryptoEngine;
use crate::error::{PlakarError, Result};
use crate::objects::{Checksum, Hasher, HashingAlgorithm};
use crate::packfile::BlobType;

/// The uniform envelope every persisted byte string traverses:
/// `plaintext → compress → authenticated-encrypt → ciphertext` on write,
/// the inverse on read. The blob type tag is bound as AAD so a ciphertext
/// cannot be replayed under a different type.
#[derive(Clone)]
pub struct BlobCodec {
    compression: CompressionAlgorithm,
    hashing: HashingAlgorithm,
    mac_key: [u8; 32],
    crypto: Arc<dyn CryptoEngine>,
}

impl BlobCodec {
    pub fn new(
        compression: CompressionAlgorithm,
        hashing: HashingAlgorithm,
        mac_key: [u8; 32],
        crypto: Arc<dyn CryptoEngine>,
    ) -> Self {
        Self {
            compression,
            hashing,
            mac_key,
            crypto,
        }
    }

    pub fn compression(&self) -> CompressionAlgorithm {
        self.compression
    }

    /// Keyed MAC over plaintext: the content address of a blob.
    pub fn checksum(&self, data: &[u8]) -> Checksum {
        Hasher::digest(self.hashing, &self.mac_key, data)
    }

    /// Incremental hasher keyed with the repository MAC key.
    pub fn hasher(&self) -> Hasher {
        Hasher::new(self.hashing, &self.mac_key)
    }

    pub fn encode(&self, blob_type: BlobType, plaintext: &[u8]) -> Result<Vec<u8>> {
        let compressed = compress::compress(self.compression, plaintext)?;
        self.crypto.encrypt(&compressed, &[blob_type as u8])
    }

    pub fn decode(&self, blob_type: BlobType, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.crypto.decrypt(data, &[blob_type as u8])?;
        compress::decompress(&compressed)
    }

    /// Encode a state file: same compress+encrypt envelope as blobs, with a
    /// dedicated AAD since state files live outside packfiles.
    pub fn encode_state(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let compressed = compress::compress(self.compression, plaintext)?;
        self.crypto.encrypt(&compressed, b"state")
    }

    pub fn decode_state(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.crypto.decrypt(data, b"state")?;
        compress::decompress(&compressed)
    }

    /// Decode and verify that the plaintext hashes to `expected`.
    pub fn decode_verified(
        &self,
        blob_type: BlobType,
        expected: &Checksum,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let plaintext = self.decode(blob_type, data)?;
        let actual = self.checksum(&plaintext);
        if actual != *expected {
            return Err(PlakarError::Integrity(format!(
                "checksum mismatch for {} blob {expected}",
                blob_type.as_str()
            )));
        }
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Aes256GcmEngine, PlaintextEngine};

    fn plaintext_codec() -> BlobCodec {
        BlobCodec::new(
            CompressionAlgorithm::Lz4,
            HashingAlgorithm::Sha256,
            [0xAA; 32],
            Arc::new(PlaintextEngine),
        )
    }

    fn encrypted_codec() -> BlobCodec {
        BlobCodec::new(
            CompressionAlgorithm::Lz4,
            HashingAlgorithm::Sha256,
            [0xAA; 32],
            Arc::new(Aes256GcmEngine::new(&[0x42; 32])),
        )
    }

    #[test]
    fn encode_decode_roundtrip() {
        for codec in [plaintext_codec(), encrypted_codec()] {
            let data = b"some chunk contents";
            let encoded = codec.encode(BlobType::Chunk, data).unwrap();
            let decoded = codec.decode(BlobType::Chunk, &encoded).unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn type_tag_is_authenticated() {
        let codec = encrypted_codec();
        let encoded = codec.encode(BlobType::Chunk, b"data").unwrap();
        assert!(codec.decode(BlobType::Object, &encoded).is_err());
    }

    #[test]
    fn decode_verified_detects_mismatch() {
        let codec = plaintext_codec();
        let encoded = codec.encode(BlobType::Chunk, b"data").unwrap();
        let wrong = codec.checksum(b"other data");
        assert!(matches!(
            codec.decode_verified(BlobType::Chunk, &wrong, &encoded),
            Err(PlakarError::Integrity(_))
        ));
    }
}
