use std::fmt;

use blake2::digest::consts::U32;
use blake2::digest::Mac as _;
use blake2::Blake2bMac;
use hmac::{Hmac, Mac as _};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{PlakarError, Result};

type HmacSha256 = Hmac<Sha256>;
type KeyedBlake2b256 = Blake2bMac<U32>;

/// A 32-byte content address: the keyed MAC of a blob's plaintext.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    pub const SIZE: usize = 32;

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a checksum from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| PlakarError::Usage(format!("invalid checksum '{s}': {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PlakarError::Usage(format!("checksum '{s}' is not 32 bytes")))?;
        Ok(Checksum(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// MAC algorithm recorded in the repository configuration.
/// Fixed at creation time; there is no unkeyed mode for stored blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HashingAlgorithm {
    #[default]
    Sha256,
    Blake2b,
}

impl HashingAlgorithm {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "sha256" => Ok(HashingAlgorithm::Sha256),
            "blake2b" => Ok(HashingAlgorithm::Blake2b),
            other => Err(PlakarError::Config(format!(
                "unsupported hashing algorithm: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashingAlgorithm::Sha256 => "sha256",
            HashingAlgorithm::Blake2b => "blake2b",
        }
    }
}

enum MacState {
    Sha256(HmacSha256),
    Blake2b(Box<KeyedBlake2b256>),
}

/// Incremental keyed MAC producing a [`Checksum`].
pub struct Hasher {
    state: MacState,
}

impl Hasher {
    pub fn new(algorithm: HashingAlgorithm, key: &[u8; 32]) -> Self {
        let state = match algorithm {
            HashingAlgorithm::Sha256 => MacState::Sha256(
                HmacSha256::new_from_slice(key).expect("HMAC accepts any key length"),
            ),
            HashingAlgorithm::Blake2b => MacState::Blake2b(Box::new(
                KeyedBlake2b256::new_from_slice(key).expect("valid 32-byte key for BLAKE2b"),
            )),
        };
        Hasher { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            MacState::Sha256(mac) => mac.update(data),
            MacState::Blake2b(mac) => mac.update(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        let bytes = match self.state {
            MacState::Sha256(mac) => mac.finalize().into_bytes(),
            MacState::Blake2b(mac) => mac.finalize().into_bytes(),
        };
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Checksum(out)
    }

    /// One-shot MAC over a byte slice.
    pub fn digest(algorithm: HashingAlgorithm, key: &[u8; 32], data: &[u8]) -> Checksum {
        let mut hasher = Hasher::new(algorithm, key);
        hasher.update(data);
        hasher.finalize()
    }
}

impl std::io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
