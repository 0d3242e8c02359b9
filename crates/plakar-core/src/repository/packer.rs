use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::caching::StateCache;
use crate::codec::BlobCodec;
use crate::error::Result;
use crate::objects::Checksum;
use crate::packfile::{BlobType, PackfileWriter};
use crate::state::{DeltaEntry, Location};
use crate::storage::Store;

/// Default packfile target size before a flush.
pub const DEFAULT_TARGET_SIZE: usize = 20 * 1024 * 1024;

/// Bounded retries for transient backend failures during a flush.
const MAX_FLUSH_RETRIES: usize = 3;

/// Single-writer accumulator of encoded blobs. When the buffered body
/// reaches the target size, the packfile is finalized, uploaded, and each
/// blob's delta entry is recorded in the local cache.
pub struct Packer {
    store: Arc<dyn Store>,
    codec: BlobCodec,
    cache: Arc<StateCache>,
    target_size: usize,
    writer: PackfileWriter,
    /// Blobs appended by this packer, across flushes. Guards against a
    /// duplicate append when two identical files assemble the same object.
    seen: HashSet<(BlobType, Checksum)>,
    /// Delta entries recorded by this packer, for the snapshot state file.
    deltas: Vec<DeltaEntry>,
}

impl Packer {
    pub fn new(store: Arc<dyn Store>, codec: BlobCodec, cache: Arc<StateCache>) -> Self {
        let writer = PackfileWriter::new(codec.clone());
        Self {
            store,
            codec,
            cache,
            target_size: DEFAULT_TARGET_SIZE,
            writer,
            seen: HashSet::new(),
            deltas: Vec::new(),
        }
    }

    pub fn set_target_size(&mut self, target_size: usize) {
        self.target_size = target_size.max(1);
    }

    /// Append a plaintext blob. Duplicate checksums within this packer's
    /// lifetime are skipped.
    pub fn put_blob(&mut self, blob_type: BlobType, csum: Checksum, plaintext: &[u8]) -> Result<()> {
        if !self.seen.insert((blob_type, csum)) {
            return Ok(());
        }
        self.writer.append(blob_type, csum, plaintext)?;
        if self.writer.size() >= self.target_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Finalize the current packfile, upload it, and record delta entries.
    fn flush(&mut self) -> Result<()> {
        if self.writer.is_empty() {
            return Ok(());
        }
        let writer = std::mem::replace(&mut self.writer, PackfileWriter::new(self.codec.clone()));
        let entries = writer.entries().to_vec();
        let bytes = writer.finalize()?;
        let packfile_id = self.codec.checksum(&bytes);

        let mut attempt = 0;
        let mut delay = Duration::from_millis(100);
        loop {
            match self.store.put_packfile(&packfile_id, &bytes) {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < MAX_FLUSH_RETRIES => {
                    warn!(packfile = %packfile_id, attempt, "transient error uploading packfile, retrying: {e}");
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        for entry in entries {
            let delta = DeltaEntry {
                blob_type: entry.blob_type,
                blob: entry.checksum,
                location: Location {
                    packfile: packfile_id,
                    offset: entry.offset,
                    length: entry.length,
                },
            };
            self.cache
                .put_delta(delta.blob_type, &delta.blob, &delta.to_bytes())?;
            self.deltas.push(delta);
        }
        debug!(packfile = %packfile_id, size = bytes.len(), "flushed packfile");
        Ok(())
    }

    /// Flush any buffered blobs and return every delta entry this packer
    /// produced. The packfiles referenced by those entries are durable.
    pub fn finish(mut self) -> Result<Vec<DeltaEntry>> {
        self.flush()?;
        Ok(self.deltas)
    }
}
