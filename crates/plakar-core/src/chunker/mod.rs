use std::io::Read;

use fastcdc::v2020::StreamCDC;
use serde::{Deserialize, Serialize};

use crate::error::{PlakarError, Result};

/// Content-defined chunking parameters, fixed at repository creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerOptions {
    pub min_size: u32,
    pub normal_size: u32,
    pub max_size: u32,
    pub window_size: u32,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            min_size: 64 * 1024,
            normal_size: 1024 * 1024,
            max_size: 4 * 1024 * 1024,
            window_size: 64,
        }
    }
}

impl ChunkerOptions {
    /// Validate `min ≤ normal ≤ max` and `window > 0`.
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.min_size > self.normal_size || self.normal_size > self.max_size
        {
            return Err(PlakarError::Config(format!(
                "invalid chunker parameters: min ({}) <= normal ({}) <= max ({}) violated",
                self.min_size, self.normal_size, self.max_size
            )));
        }
        if self.window_size == 0 {
            return Err(PlakarError::Config(
                "invalid chunker parameters: window must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// One chunk cut out of an input stream.
pub struct Chunk {
    pub offset: u64,
    pub length: u32,
    pub data: Vec<u8>,
}

/// Lazily chunk a byte stream with FastCDC. Boundaries are deterministic
/// for a given configuration; the sum of chunk lengths equals the stream
/// length.
pub fn chunk_stream<R: Read>(
    reader: R,
    options: &ChunkerOptions,
) -> Result<impl Iterator<Item = Result<Chunk>>> {
    options.validate()?;
    let cdc = StreamCDC::new(
        reader,
        options.min_size,
        options.normal_size,
        options.max_size,
    );
    Ok(cdc.map(|res| match res {
        Ok(chunk) => Ok(Chunk {
            offset: chunk.offset,
            length: chunk.length as u32,
            data: chunk.data,
        }),
        Err(e) => Err(PlakarError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            e,
        ))),
    }))
}
