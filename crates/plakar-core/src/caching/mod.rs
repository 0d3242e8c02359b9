use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{cache_err, Result};
use crate::objects::Checksum;
use crate::packfile::BlobType;

const STATES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("__state__");
const DELTAS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("__delta__");

/// Owns the local cache directory and hands out per-repository caches.
pub struct Manager {
    cache_dir: PathBuf,
}

impl Manager {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Default cache root: `$XDG_CACHE_HOME/plakar` or `$HOME/.cache/plakar`.
    pub fn default_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("XDG_CACHE_HOME") {
            return PathBuf::from(dir).join("plakar");
        }
        match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(".cache").join("plakar"),
            Err(_) => std::env::temp_dir().join("plakar-cache"),
        }
    }

    pub fn repository_cache(&self, repository_id: Uuid) -> Result<StateCache> {
        let dir = self.cache_dir.join("repository").join(repository_id.to_string());
        std::fs::create_dir_all(&dir)?;
        StateCache::open(&dir.join("state.redb"))
    }
}

/// Persistent key/value cache backing the local state.
///
/// Delta entries are keyed `type_tag || blob_checksum` so iterating a type's
/// key range yields entries ordered by checksum; state metadata is keyed by
/// state id. Reads are lock-free; writes are atomic at the key level.
pub struct StateCache {
    db: Database,
}

impl StateCache {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(cache_err)?;
        // Make sure both tables exist so read transactions never race
        // table creation.
        let wtx = db.begin_write().map_err(cache_err)?;
        {
            wtx.open_table(STATES).map_err(cache_err)?;
            wtx.open_table(DELTAS).map_err(cache_err)?;
        }
        wtx.commit().map_err(cache_err)?;
        Ok(Self { db })
    }

    fn delta_key(blob_type: BlobType, csum: &Checksum) -> [u8; 33] {
        let mut key = [0u8; 33];
        key[0] = blob_type as u8;
        key[1..].copy_from_slice(&csum.0);
        key
    }

    /// Idempotent insert of a serialized delta entry.
    pub fn put_delta(&self, blob_type: BlobType, csum: &Checksum, data: &[u8]) -> Result<()> {
        let key = Self::delta_key(blob_type, csum);
        let wtx = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = wtx.open_table(DELTAS).map_err(cache_err)?;
            table.insert(key.as_slice(), data).map_err(cache_err)?;
        }
        wtx.commit().map_err(cache_err)?;
        Ok(())
    }

    pub fn has_delta(&self, blob_type: BlobType, csum: &Checksum) -> Result<bool> {
        let key = Self::delta_key(blob_type, csum);
        let rtx = self.db.begin_read().map_err(cache_err)?;
        let table = rtx.open_table(DELTAS).map_err(cache_err)?;
        Ok(table.get(key.as_slice()).map_err(cache_err)?.is_some())
    }

    pub fn get_delta(&self, blob_type: BlobType, csum: &Checksum) -> Result<Option<Vec<u8>>> {
        let key = Self::delta_key(blob_type, csum);
        let rtx = self.db.begin_read().map_err(cache_err)?;
        let table = rtx.open_table(DELTAS).map_err(cache_err)?;
        Ok(table
            .get(key.as_slice())
            .map_err(cache_err)?
            .map(|guard| guard.value().to_vec()))
    }

    /// Probe every blob type for a checksum. Sequential by design; callers
    /// on hot paths always know the type.
    pub fn get_delta_by_csum(&self, csum: &Checksum) -> Result<Option<Vec<u8>>> {
        for blob_type in BlobType::ALL {
            if let Some(data) = self.get_delta(blob_type, csum)? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    pub fn del_delta(&self, blob_type: BlobType, csum: &Checksum) -> Result<()> {
        let key = Self::delta_key(blob_type, csum);
        let wtx = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = wtx.open_table(DELTAS).map_err(cache_err)?;
            table.remove(key.as_slice()).map_err(cache_err)?;
        }
        wtx.commit().map_err(cache_err)?;
        Ok(())
    }

    /// All deltas of one type, ordered by blob checksum.
    pub fn get_deltas_by_type(&self, blob_type: BlobType) -> Result<Vec<(Checksum, Vec<u8>)>> {
        let lo = [blob_type as u8];
        let hi = [blob_type as u8 + 1];
        let rtx = self.db.begin_read().map_err(cache_err)?;
        let table = rtx.open_table(DELTAS).map_err(cache_err)?;
        let mut out = Vec::new();
        for item in table
            .range(lo.as_slice()..hi.as_slice())
            .map_err(cache_err)?
        {
            let (key, value) = item.map_err(cache_err)?;
            let mut csum = [0u8; 32];
            csum.copy_from_slice(&key.value()[1..33]);
            out.push((Checksum(csum), value.value().to_vec()));
        }
        Ok(out)
    }

    /// All deltas, ordered by type then checksum.
    pub fn get_deltas(&self) -> Result<Vec<(Checksum, Vec<u8>)>> {
        let rtx = self.db.begin_read().map_err(cache_err)?;
        let table = rtx.open_table(DELTAS).map_err(cache_err)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(cache_err)? {
            let (key, value) = item.map_err(cache_err)?;
            let mut csum = [0u8; 32];
            csum.copy_from_slice(&key.value()[1..33]);
            out.push((Checksum(csum), value.value().to_vec()));
        }
        Ok(out)
    }

    pub fn put_state(&self, state_id: &Checksum, metadata: &[u8]) -> Result<()> {
        let wtx = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = wtx.open_table(STATES).map_err(cache_err)?;
            table
                .insert(state_id.0.as_slice(), metadata)
                .map_err(cache_err)?;
        }
        wtx.commit().map_err(cache_err)?;
        Ok(())
    }

    pub fn has_state(&self, state_id: &Checksum) -> Result<bool> {
        let rtx = self.db.begin_read().map_err(cache_err)?;
        let table = rtx.open_table(STATES).map_err(cache_err)?;
        Ok(table
            .get(state_id.0.as_slice())
            .map_err(cache_err)?
            .is_some())
    }

    pub fn get_state(&self, state_id: &Checksum) -> Result<Option<Vec<u8>>> {
        let rtx = self.db.begin_read().map_err(cache_err)?;
        let table = rtx.open_table(STATES).map_err(cache_err)?;
        Ok(table
            .get(state_id.0.as_slice())
            .map_err(cache_err)?
            .map(|guard| guard.value().to_vec()))
    }

    pub fn del_state(&self, state_id: &Checksum) -> Result<()> {
        let wtx = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = wtx.open_table(STATES).map_err(cache_err)?;
            table
                .remove(state_id.0.as_slice())
                .map_err(cache_err)?;
        }
        wtx.commit().map_err(cache_err)?;
        Ok(())
    }

    pub fn get_states(&self) -> Result<Vec<Checksum>> {
        let rtx = self.db.begin_read().map_err(cache_err)?;
        let table = rtx.open_table(STATES).map_err(cache_err)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(cache_err)? {
            let (key, _) = item.map_err(cache_err)?;
            let mut id = [0u8; 32];
            id.copy_from_slice(key.value());
            out.push(Checksum(id));
        }
        Ok(out)
    }
}
