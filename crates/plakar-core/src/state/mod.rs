use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::caching::StateCache;
use crate::error::{PlakarError, Result};
use crate::objects::Checksum;
use crate::packfile::BlobType;

pub const STATE_VERSION: u32 = 100;

const ET_METADATA: u8 = 1;
const ET_LOCATIONS: u8 = 2;

/// Serialized sizes of the fixed-width wire records. Keep in sync with the
/// on-disk format.
pub const LOCATION_SERIALIZED_SIZE: usize = 32 + 4 + 4;
pub const DELTA_ENTRY_SERIALIZED_SIZE: usize = 1 + 32 + LOCATION_SERIALIZED_SIZE;

/// Where a blob lives: a ciphertext region inside a packfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub packfile: Checksum,
    pub offset: u32,
    pub length: u32,
}

/// One persisted mapping {type, blob} → location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaEntry {
    pub blob_type: BlobType,
    pub blob: Checksum,
    pub location: Location,
}

impl DeltaEntry {
    pub fn to_bytes(&self) -> [u8; DELTA_ENTRY_SERIALIZED_SIZE] {
        let mut buf = [0u8; DELTA_ENTRY_SERIALIZED_SIZE];
        buf[0] = self.blob_type as u8;
        buf[1..33].copy_from_slice(&self.blob.0);
        buf[33..65].copy_from_slice(&self.location.packfile.0);
        buf[65..69].copy_from_slice(&self.location.offset.to_le_bytes());
        buf[69..73].copy_from_slice(&self.location.length.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < DELTA_ENTRY_SERIALIZED_SIZE {
            return Err(PlakarError::Integrity("short delta entry".into()));
        }
        let blob_type = BlobType::from_u8(buf[0])?;
        let mut blob = [0u8; 32];
        blob.copy_from_slice(&buf[1..33]);
        let mut packfile = [0u8; 32];
        packfile.copy_from_slice(&buf[33..65]);
        let offset = u32::from_le_bytes(buf[65..69].try_into().expect("4-byte slice"));
        let length = u32::from_le_bytes(buf[69..73].try_into().expect("4-byte slice"));
        Ok(DeltaEntry {
            blob_type,
            blob: Checksum(blob),
            location: Location {
                packfile: Checksum(packfile),
                offset,
                length,
            },
        })
    }
}

/// State file metadata, serialized at the tail of the stream so writers can
/// append delta entries without knowing the final count up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub aggregate: bool,
    pub extends: Vec<Checksum>,
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            timestamp: Utc::now(),
            aggregate: false,
            extends: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize delta entries and metadata to a state stream:
/// `(ET_LOCATIONS entry)* ET_METADATA {version, timestamp-ns, aggregate,
/// extends-count, extends...}`, all integers little-endian.
pub fn serialize_to_stream<'a, W, I>(w: &mut W, entries: I, metadata: &Metadata) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a DeltaEntry>,
{
    for entry in entries {
        w.write_all(&[ET_LOCATIONS])?;
        w.write_all(&entry.to_bytes())?;
    }

    w.write_all(&[ET_METADATA])?;
    w.write_all(&metadata.version.to_le_bytes())?;
    let timestamp_ns = metadata.timestamp.timestamp_nanos_opt().unwrap_or(0) as u64;
    w.write_all(&timestamp_ns.to_le_bytes())?;
    w.write_all(&[u8::from(metadata.aggregate)])?;
    w.write_all(&(metadata.extends.len() as u64).to_le_bytes())?;
    for checksum in &metadata.extends {
        w.write_all(&checksum.0)?;
    }
    Ok(())
}

/// Parse a state stream into its delta entries and tail metadata.
pub fn deserialize_from_stream<R: Read>(r: &mut R) -> Result<(Vec<DeltaEntry>, Metadata)> {
    let mut entries = Vec::new();
    let mut tag = [0u8; 1];
    loop {
        r.read_exact(&mut tag)
            .map_err(|e| PlakarError::Integrity(format!("state stream: entry tag: {e}")))?;
        match tag[0] {
            ET_METADATA => break,
            ET_LOCATIONS => {
                let mut buf = [0u8; DELTA_ENTRY_SERIALIZED_SIZE];
                r.read_exact(&mut buf)
                    .map_err(|e| PlakarError::Integrity(format!("state stream: entry: {e}")))?;
                entries.push(DeltaEntry::from_bytes(&buf)?);
            }
            other => {
                return Err(PlakarError::Integrity(format!(
                    "state stream: unknown entry kind {other}"
                )))
            }
        }
    }

    let mut u32buf = [0u8; 4];
    r.read_exact(&mut u32buf)
        .map_err(|e| PlakarError::Integrity(format!("state stream: version: {e}")))?;
    let version = u32::from_le_bytes(u32buf);

    let mut u64buf = [0u8; 8];
    r.read_exact(&mut u64buf)
        .map_err(|e| PlakarError::Integrity(format!("state stream: timestamp: {e}")))?;
    let timestamp_ns = u64::from_le_bytes(u64buf);
    let timestamp = Utc.timestamp_nanos(timestamp_ns as i64);

    let mut flag = [0u8; 1];
    r.read_exact(&mut flag)
        .map_err(|e| PlakarError::Integrity(format!("state stream: aggregate flag: {e}")))?;
    let aggregate = flag[0] == 1;

    r.read_exact(&mut u64buf)
        .map_err(|e| PlakarError::Integrity(format!("state stream: extends count: {e}")))?;
    let extends_len = u64::from_le_bytes(u64buf);
    let mut extends = Vec::with_capacity(extends_len.min(1 << 16) as usize);
    for _ in 0..extends_len {
        let mut checksum = [0u8; 32];
        r.read_exact(&mut checksum)
            .map_err(|e| PlakarError::Integrity(format!("state stream: extends: {e}")))?;
        extends.push(Checksum(checksum));
    }

    Ok((
        entries,
        Metadata {
            version,
            timestamp,
            aggregate,
            extends,
        },
    ))
}

/// The local, possibly aggregated, view of every known delta entry,
/// backed by the on-disk key/value cache.
pub struct LocalState {
    pub metadata: Metadata,
    cache: Arc<StateCache>,
}

impl LocalState {
    pub fn new(cache: Arc<StateCache>) -> Self {
        Self {
            metadata: Metadata::new(),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    /// Merge the state identified by `state_id` from its serialized stream.
    /// Idempotent: already-known states are skipped.
    pub fn insert_state<R: Read>(&self, state_id: Checksum, r: &mut R) -> Result<()> {
        if self.cache.has_state(&state_id)? {
            return Ok(());
        }

        let (entries, metadata) = deserialize_from_stream(r)?;
        for entry in &entries {
            self.put_delta(entry)?;
        }

        self.cache.put_state(&state_id, &metadata.to_bytes()?)?;
        Ok(())
    }

    pub fn has_state(&self, state_id: &Checksum) -> Result<bool> {
        self.cache.has_state(state_id)
    }

    pub fn del_state(&self, state_id: &Checksum) -> Result<()> {
        self.cache.del_state(state_id)
    }

    pub fn states(&self) -> Result<Vec<Checksum>> {
        self.cache.get_states()
    }

    pub fn state_metadata(&self, state_id: &Checksum) -> Result<Option<Metadata>> {
        match self.cache.get_state(state_id)? {
            Some(data) => Ok(Some(Metadata::from_bytes(&data)?)),
            None => Ok(None),
        }
    }

    /// Idempotent insert of a delta entry.
    pub fn put_delta(&self, entry: &DeltaEntry) -> Result<()> {
        self.cache
            .put_delta(entry.blob_type, &entry.blob, &entry.to_bytes())
    }

    pub fn blob_exists(&self, blob_type: BlobType, blob: &Checksum) -> bool {
        self.cache.has_delta(blob_type, blob).unwrap_or(false)
    }

    /// Locate a blob within the set of packfiles.
    pub fn get_location(&self, blob_type: BlobType, blob: &Checksum) -> Result<Option<Location>> {
        match self.cache.get_delta(blob_type, blob)? {
            Some(data) => Ok(Some(DeltaEntry::from_bytes(&data)?.location)),
            None => Ok(None),
        }
    }

    pub fn del_delta(&self, blob_type: BlobType, blob: &Checksum) -> Result<()> {
        self.cache.del_delta(blob_type, blob)
    }

    /// All known entries of one type, ordered by blob checksum.
    pub fn list_by_type(&self, blob_type: BlobType) -> Result<Vec<DeltaEntry>> {
        self.cache
            .get_deltas_by_type(blob_type)?
            .into_iter()
            .map(|(_, data)| DeltaEntry::from_bytes(&data))
            .collect()
    }

    /// Committed snapshot ids.
    pub fn list_snapshots(&self) -> Result<Vec<Checksum>> {
        Ok(self
            .cache
            .get_deltas_by_type(BlobType::Snapshot)?
            .into_iter()
            .map(|(csum, _)| csum)
            .collect())
    }

    /// Serialize every known delta entry plus the given metadata.
    pub fn serialize_all<W: Write>(&self, w: &mut W, metadata: &Metadata) -> Result<()> {
        let mut entries = Vec::new();
        for (_, data) in self.cache.get_deltas()? {
            entries.push(DeltaEntry::from_bytes(&data)?);
        }
        serialize_to_stream(w, entries.iter(), metadata)
    }
}
