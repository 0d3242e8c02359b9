use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::caching::Manager;
use crate::error::{PlakarError, Result};
use crate::objects::Checksum;
use crate::repository::{CreateOptions, Repository};
use crate::storage::{Store, StoreMode};

/// In-memory storage backend for engine tests. Thread-safe via Mutex.
pub struct MemoryStore {
    mode: StoreMode,
    config: Mutex<Option<Vec<u8>>>,
    packfiles: Mutex<HashMap<Checksum, Vec<u8>>>,
    states: Mutex<HashMap<Checksum, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_mode(StoreMode::ReadWrite)
    }

    pub fn new_no_delete() -> Self {
        Self::with_mode(StoreMode::NoDelete)
    }

    fn with_mode(mode: StoreMode) -> Self {
        Self {
            mode,
            config: Mutex::new(None),
            packfiles: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn packfile_count(&self) -> usize {
        self.packfiles.lock().unwrap().len()
    }

    pub fn state_count(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    /// Flip one byte inside an arbitrary packfile (corruption testing).
    pub fn corrupt_some_packfile(&self, byte_index: usize) -> Checksum {
        let mut packfiles = self.packfiles.lock().unwrap();
        let (id, data) = packfiles.iter_mut().next().expect("a packfile to corrupt");
        let idx = byte_index % data.len();
        data[idx] ^= 0x01;
        *id
    }
}

impl Store for MemoryStore {
    fn location(&self) -> &str {
        "memory://"
    }

    fn mode(&self) -> StoreMode {
        self.mode
    }

    fn put_configuration(&self, data: &[u8]) -> Result<()> {
        let mut config = self.config.lock().unwrap();
        if config.is_some() {
            return Err(PlakarError::Conflict("repository already exists".into()));
        }
        *config = Some(data.to_vec());
        Ok(())
    }

    fn get_configuration(&self) -> Result<Vec<u8>> {
        self.config
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PlakarError::NotFound("no repository".into()))
    }

    fn put_packfile(&self, checksum: &Checksum, data: &[u8]) -> Result<()> {
        self.packfiles
            .lock()
            .unwrap()
            .insert(*checksum, data.to_vec());
        Ok(())
    }

    fn get_packfile(&self, checksum: &Checksum) -> Result<Vec<u8>> {
        self.packfiles
            .lock()
            .unwrap()
            .get(checksum)
            .cloned()
            .ok_or_else(|| PlakarError::NotFound(format!("packfile: {checksum}")))
    }

    fn get_packfile_range(&self, checksum: &Checksum, offset: u32, length: u32) -> Result<Vec<u8>> {
        let packfiles = self.packfiles.lock().unwrap();
        let data = packfiles
            .get(checksum)
            .ok_or_else(|| PlakarError::NotFound(format!("packfile: {checksum}")))?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Err(PlakarError::Integrity(format!(
                "short read from packfile {checksum}"
            )));
        }
        Ok(data[start..end].to_vec())
    }

    fn list_packfiles(&self) -> Result<Vec<Checksum>> {
        Ok(self.packfiles.lock().unwrap().keys().copied().collect())
    }

    fn delete_packfile(&self, checksum: &Checksum) -> Result<()> {
        self.packfiles.lock().unwrap().remove(checksum);
        Ok(())
    }

    fn put_state(&self, checksum: &Checksum, data: &[u8]) -> Result<()> {
        self.states.lock().unwrap().insert(*checksum, data.to_vec());
        Ok(())
    }

    fn get_state(&self, checksum: &Checksum) -> Result<Vec<u8>> {
        self.states
            .lock()
            .unwrap()
            .get(checksum)
            .cloned()
            .ok_or_else(|| PlakarError::NotFound(format!("state: {checksum}")))
    }

    fn list_states(&self) -> Result<Vec<Checksum>> {
        Ok(self.states.lock().unwrap().keys().copied().collect())
    }

    fn delete_state(&self, checksum: &Checksum) -> Result<()> {
        if self.mode == StoreMode::NoDelete {
            return Err(PlakarError::backend("store rejects deletes"));
        }
        self.states.lock().unwrap().remove(checksum);
        Ok(())
    }
}

/// A repository plus the scratch directory holding its local cache.
pub struct TestRepo {
    pub repo: Arc<Repository>,
    pub store: Arc<MemoryStore>,
    _cache_dir: tempfile::TempDir,
}

/// Create an unencrypted in-memory repository with a scratch cache.
pub fn memory_repo() -> TestRepo {
    memory_repo_with(None)
}

/// Create an in-memory repository, optionally passphrase-encrypted.
pub fn memory_repo_with(passphrase: Option<&str>) -> TestRepo {
    let cache_dir = tempfile::tempdir().expect("cache dir");
    let manager = Manager::new(cache_dir.path());
    let store = Arc::new(MemoryStore::new());
    let repo = Repository::create(
        Box::new(SharedStore(Arc::clone(&store))),
        CreateOptions::default(),
        passphrase,
        &manager,
    )
    .expect("create test repository");
    TestRepo {
        repo: Arc::new(repo),
        store,
        _cache_dir: cache_dir,
    }
}

/// Reopen the store of an existing test repository with a fresh cache,
/// as another process would.
pub fn reopen(test_repo: &TestRepo, passphrase: Option<&str>) -> TestRepo {
    let cache_dir = tempfile::tempdir().expect("cache dir");
    let manager = Manager::new(cache_dir.path());
    let store = Arc::clone(&test_repo.store);
    let repo = Repository::open(
        Box::new(SharedStore(Arc::clone(&store))),
        passphrase,
        &manager,
    )
    .expect("open test repository");
    TestRepo {
        repo: Arc::new(repo),
        store,
        _cache_dir: cache_dir,
    }
}

/// Adapter so several `Repository` handles can share one `MemoryStore`.
pub struct SharedStore(pub Arc<MemoryStore>);

impl Store for SharedStore {
    fn location(&self) -> &str {
        self.0.location()
    }
    fn mode(&self) -> StoreMode {
        self.0.mode()
    }
    fn put_configuration(&self, data: &[u8]) -> Result<()> {
        self.0.put_configuration(data)
    }
    fn get_configuration(&self) -> Result<Vec<u8>> {
        self.0.get_configuration()
    }
    fn put_packfile(&self, checksum: &Checksum, data: &[u8]) -> Result<()> {
        self.0.put_packfile(checksum, data)
    }
    fn get_packfile(&self, checksum: &Checksum) -> Result<Vec<u8>> {
        self.0.get_packfile(checksum)
    }
    fn get_packfile_range(&self, checksum: &Checksum, offset: u32, length: u32) -> Result<Vec<u8>> {
        self.0.get_packfile_range(checksum, offset, length)
    }
    fn list_packfiles(&self) -> Result<Vec<Checksum>> {
        self.0.list_packfiles()
    }
    fn delete_packfile(&self, checksum: &Checksum) -> Result<()> {
        self.0.delete_packfile(checksum)
    }
    fn put_state(&self, checksum: &Checksum, data: &[u8]) -> Result<()> {
        self.0.put_state(checksum, data)
    }
    fn get_state(&self, checksum: &Checksum) -> Result<Vec<u8>> {
        self.0.get_state(checksum)
    }
    fn list_states(&self) -> Result<Vec<Checksum>> {
        self.0.list_states()
    }
    fn delete_state(&self, checksum: &Checksum) -> Result<()> {
        self.0.delete_state(checksum)
    }
}
