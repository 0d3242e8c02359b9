pub mod backup;
pub mod check;
pub mod exporter;
pub mod importer;
pub mod restore;
pub mod vfs;

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PlakarError, Result};
use crate::objects::Checksum;
use crate::packfile::BlobType;
use crate::repository::Repository;

use self::vfs::{EntryKind, Vfs, XattrIndex};

/// Metadata for a single logical file content: the ordered chunks that
/// comprise it, plus a content-type sniff and total length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub content_type: String,
    pub length: u64,
    pub chunks: Vec<ChunkRef>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkRef {
    pub checksum: Checksum,
    pub length: u32,
}

impl Object {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Record describing one backup run. The snapshot's identity is the
/// checksum of this header's serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub identifier: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Root node of the VFS B+tree.
    pub root: Checksum,
    pub hostname: String,
    pub username: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub importer_type: String,
    pub importer_origin: String,
    pub files_count: u64,
    pub directories_count: u64,
    /// Total logical size of the backed-up files.
    pub size: u64,
    /// Number of per-file soft errors recorded during the run.
    pub errors: u64,
    /// ERROR blob listing the failed paths, when any.
    #[serde(default)]
    pub errors_blob: Option<Checksum>,
    /// Root of the xattr index B+tree, when any entry carries xattrs.
    #[serde(default)]
    pub xattr_root: Option<Checksum>,
}

impl Header {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// One recorded per-file failure, aggregated into an ERROR blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub path: String,
    pub message: String,
}

/// A committed snapshot opened for reading.
pub struct Snapshot {
    repo: Arc<Repository>,
    pub id: Checksum,
    pub header: Header,
}

impl Snapshot {
    /// Read the SNAPSHOT blob and open the snapshot.
    pub fn load(repo: Arc<Repository>, id: Checksum) -> Result<Self> {
        let header = Header::from_bytes(&repo.get_blob(BlobType::Snapshot, &id)?)?;
        Ok(Self { repo, id, header })
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// The snapshot's filesystem view, rooted at the header's VFS pointer.
    pub fn vfs(&self) -> Vfs<'_> {
        Vfs::open(&self.repo, self.header.root)
    }

    /// The snapshot's xattr index, when any entry carries xattrs.
    pub fn xattr_index(&self) -> Option<XattrIndex<'_>> {
        self.header
            .xattr_root
            .map(|root| XattrIndex::open(&self.repo, root))
    }

    pub fn get_object(&self, csum: &Checksum) -> Result<Object> {
        Object::from_bytes(&self.repo.get_blob(BlobType::Object, csum)?)
    }

    /// Stream a file's content, concatenating chunk plaintexts in order.
    pub fn read_file_to(&self, path: &str, w: &mut dyn Write) -> Result<u64> {
        let vfs = self.vfs();
        let entry = vfs
            .get(path)?
            .ok_or_else(|| PlakarError::NotFound(format!("path: {path}")))?;
        let object_csum = match (entry.kind, entry.object) {
            (EntryKind::File, Some(csum)) => csum,
            _ => {
                return Err(PlakarError::Usage(format!(
                    "not a regular file: {path}"
                )))
            }
        };
        let object = self.get_object(&object_csum)?;
        let mut written = 0u64;
        for chunk in &object.chunks {
            let data = self.repo.get_blob(BlobType::Chunk, &chunk.checksum)?;
            w.write_all(&data)?;
            written += data.len() as u64;
        }
        Ok(written)
    }

    /// Read a whole file into memory.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_file_to(path, &mut out)?;
        Ok(out)
    }

    /// Distinct OBJECT checksums referenced by this snapshot's entries.
    pub fn list_objects(&self) -> Result<Vec<Checksum>> {
        let vfs = self.vfs();
        let mut objects = BTreeSet::new();
        for (_, entry_csum) in vfs.entries()? {
            let entry = vfs.load_entry(&entry_csum)?;
            if let Some(object) = entry.object {
                objects.insert(object);
            }
        }
        Ok(objects.into_iter().collect())
    }

    /// Distinct CHUNK checksums referenced by this snapshot's objects.
    pub fn list_chunks(&self) -> Result<Vec<Checksum>> {
        let mut chunks = BTreeSet::new();
        for object_csum in self.list_objects()? {
            let object = self.get_object(&object_csum)?;
            for chunk in object.chunks {
                chunks.insert(chunk.checksum);
            }
        }
        Ok(chunks.into_iter().collect())
    }

    /// Distinct DATA checksums referenced by this snapshot's xattr records.
    pub fn list_datas(&self) -> Result<Vec<Checksum>> {
        let Some(index) = self.xattr_index() else {
            return Ok(Vec::new());
        };
        let mut datas = BTreeSet::new();
        for (_, record_csum) in index.entries()? {
            let record = index.load_record(&record_csum)?;
            datas.insert(record.data);
        }
        Ok(datas.into_iter().collect())
    }
}
