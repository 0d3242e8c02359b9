use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{PlakarError, Result};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Maximum decompressed output size. Prevents decompression bombs from
/// consuming unbounded memory on corrupted or hostile packfiles.
const MAX_DECOMPRESS_SIZE: u64 = 64 * 1024 * 1024;

/// Compression algorithm recorded in the repository configuration.
/// Fixed at creation time; never negotiated per blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    None,
    #[default]
    Lz4,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(CompressionAlgorithm::None),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            other => Err(PlakarError::Config(format!(
                "unsupported compression algorithm: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }
}

/// Compress data and prepend a 1-byte tag identifying the codec.
pub fn compress(algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(out)
        }
        CompressionAlgorithm::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        CompressionAlgorithm::Zstd => {
            let compressed = zstd::bulk::compress(data, 3)
                .map_err(|e| PlakarError::Integrity(format!("zstd compress: {e}")))?;
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_ZSTD);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(PlakarError::Integrity("empty compressed payload".into()));
    }
    let tag = data[0];
    let payload = &data[1..];
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            if payload.len() < 4 {
                return Err(PlakarError::Integrity("lz4: payload too short".into()));
            }
            let uncompressed_size =
                u32::from_le_bytes(payload[..4].try_into().expect("4-byte slice")) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(PlakarError::Integrity(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| PlakarError::Integrity(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| PlakarError::Integrity(format!("zstd init: {e}")))?;
            let mut output = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| PlakarError::Integrity(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(PlakarError::Integrity(
                    "zstd: decompressed size exceeds limit".into(),
                ));
            }
            Ok(output)
        }
        other => Err(PlakarError::Integrity(format!(
            "unknown compression tag: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_codecs() {
        let payload = b"hello world, a payload long enough to actually compress somewhat";
        for algo in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
        ] {
            let encoded = compress(algo, payload).unwrap();
            assert_eq!(decompress(&encoded).unwrap(), payload);
        }
    }

    #[test]
    fn rejects_lz4_bomb() {
        let mut data = vec![TAG_LZ4];
        data.extend_from_slice(&(1u32 << 30).to_le_bytes());
        data.extend_from_slice(&[0u8; 10]);
        assert!(decompress(&data).is_err());
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(decompress(&[0x7F, 1, 2, 3]).is_err());
    }

    #[test]
    fn rejects_empty_payload() {
        assert!(decompress(&[]).is_err());
    }
}
