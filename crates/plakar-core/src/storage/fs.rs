use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{PlakarError, Result};
use crate::objects::Checksum;
use crate::storage::{Store, StoreMode};

const CONFIG_FILE: &str = "CONFIG";
const PACKFILES_DIR: &str = "packfiles";
const STATES_DIR: &str = "states";
const LOCKS_DIR: &str = "locks";

/// Filesystem store. Packfiles and states are sharded by the first four
/// hex characters of their checksum:
/// `<root>/packfiles/<aa>/<bb>/<hex>`, `<root>/states/<aa>/<bb>/<hex>`.
pub struct FsStore {
    root: PathBuf,
    location: String,
}

impl FsStore {
    pub fn new(path: &str) -> Self {
        Self {
            root: PathBuf::from(path),
            location: path.to_string(),
        }
    }

    fn object_path(&self, kind: &str, checksum: &Checksum) -> PathBuf {
        let hex = checksum.to_hex();
        self.root
            .join(kind)
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex)
    }

    /// Atomic write: temp file in the repository root, then rename.
    fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_backend)?;
        }
        let tmp = self.root.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            dest.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        let mut file = fs::File::create(&tmp).map_err(io_backend)?;
        file.write_all(data).map_err(io_backend)?;
        file.sync_all().map_err(io_backend)?;
        fs::rename(&tmp, dest).map_err(io_backend)?;
        Ok(())
    }

    fn read_object(&self, kind: &str, checksum: &Checksum) -> Result<Vec<u8>> {
        match fs::read(self.object_path(kind, checksum)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PlakarError::NotFound(
                format!("{}: {checksum}", kind.trim_end_matches('s'))
            )),
            Err(e) => Err(io_backend(e)),
        }
    }

    fn delete_object(&self, kind: &str, checksum: &Checksum) -> Result<()> {
        match fs::remove_file(self.object_path(kind, checksum)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_backend(e)),
        }
    }

    /// Walk the two shard levels and parse leaf file names as checksums.
    fn list_objects(&self, kind: &str) -> Result<Vec<Checksum>> {
        let dir = self.root.join(kind);
        let mut out = Vec::new();
        let top = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(io_backend(e)),
        };
        for shard1 in top {
            let shard1 = shard1.map_err(io_backend)?;
            if !shard1.file_type().map_err(io_backend)?.is_dir() {
                continue;
            }
            for shard2 in fs::read_dir(shard1.path()).map_err(io_backend)? {
                let shard2 = shard2.map_err(io_backend)?;
                if !shard2.file_type().map_err(io_backend)?.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(shard2.path()).map_err(io_backend)? {
                    let entry = entry.map_err(io_backend)?;
                    let name = entry.file_name();
                    if let Ok(checksum) = Checksum::from_hex(&name.to_string_lossy()) {
                        out.push(checksum);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn io_backend(e: std::io::Error) -> PlakarError {
    let retryable = matches!(
        e.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock
    );
    PlakarError::Backend {
        message: e.to_string(),
        retryable,
    }
}

impl Store for FsStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn mode(&self) -> StoreMode {
        StoreMode::ReadWrite
    }

    fn put_configuration(&self, data: &[u8]) -> Result<()> {
        let config = self.root.join(CONFIG_FILE);
        if config.exists() {
            return Err(PlakarError::Conflict(format!(
                "repository already exists at '{}'",
                self.location
            )));
        }
        fs::create_dir_all(&self.root).map_err(io_backend)?;
        fs::create_dir_all(self.root.join(PACKFILES_DIR)).map_err(io_backend)?;
        fs::create_dir_all(self.root.join(STATES_DIR)).map_err(io_backend)?;
        fs::create_dir_all(self.root.join(LOCKS_DIR)).map_err(io_backend)?;
        self.write_atomic(&config, data)
    }

    fn get_configuration(&self) -> Result<Vec<u8>> {
        match fs::read(self.root.join(CONFIG_FILE)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PlakarError::NotFound(
                format!("no repository at '{}'", self.location),
            )),
            Err(e) => Err(io_backend(e)),
        }
    }

    fn put_packfile(&self, checksum: &Checksum, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.object_path(PACKFILES_DIR, checksum), data)
    }

    fn get_packfile(&self, checksum: &Checksum) -> Result<Vec<u8>> {
        self.read_object(PACKFILES_DIR, checksum)
    }

    fn get_packfile_range(&self, checksum: &Checksum, offset: u32, length: u32) -> Result<Vec<u8>> {
        let path = self.object_path(PACKFILES_DIR, checksum);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PlakarError::NotFound(format!("packfile: {checksum}")))
            }
            Err(e) => return Err(io_backend(e)),
        };
        file.seek(SeekFrom::Start(offset as u64)).map_err(io_backend)?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).map_err(|e| {
            PlakarError::Integrity(format!("short read from packfile {checksum}: {e}"))
        })?;
        Ok(buf)
    }

    fn list_packfiles(&self) -> Result<Vec<Checksum>> {
        self.list_objects(PACKFILES_DIR)
    }

    fn delete_packfile(&self, checksum: &Checksum) -> Result<()> {
        self.delete_object(PACKFILES_DIR, checksum)
    }

    fn put_state(&self, checksum: &Checksum, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.object_path(STATES_DIR, checksum), data)
    }

    fn get_state(&self, checksum: &Checksum) -> Result<Vec<u8>> {
        self.read_object(STATES_DIR, checksum)
    }

    fn list_states(&self) -> Result<Vec<Checksum>> {
        self.list_objects(STATES_DIR)
    }

    fn delete_state(&self, checksum: &Checksum) -> Result<()> {
        self.delete_object(STATES_DIR, checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_checksum(byte: u8) -> Checksum {
        Checksum([byte; 32])
    }

    #[test]
    fn packfile_roundtrip_and_sharding() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().to_str().unwrap());
        store.put_configuration(b"cfg").unwrap();

        let id = test_checksum(0xAB);
        store.put_packfile(&id, b"pack bytes").unwrap();
        assert_eq!(store.get_packfile(&id).unwrap(), b"pack bytes");

        let sharded = dir
            .path()
            .join("packfiles")
            .join("ab")
            .join("ab")
            .join(id.to_hex());
        assert!(sharded.is_file());
    }

    #[test]
    fn ranged_read_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().to_str().unwrap());
        let id = test_checksum(0x01);
        store.put_packfile(&id, b"0123456789").unwrap();
        assert_eq!(store.get_packfile_range(&id, 2, 4).unwrap(), b"2345");
        assert!(store.get_packfile_range(&id, 8, 4).is_err());
    }

    #[test]
    fn missing_objects_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().to_str().unwrap());
        assert!(matches!(
            store.get_packfile(&test_checksum(0x02)),
            Err(PlakarError::NotFound(_))
        ));
        assert!(matches!(
            store.get_configuration(),
            Err(PlakarError::NotFound(_))
        ));
    }

    #[test]
    fn create_twice_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().to_str().unwrap());
        store.put_configuration(b"cfg").unwrap();
        assert!(matches!(
            store.put_configuration(b"cfg"),
            Err(PlakarError::Conflict(_))
        ));
    }

    #[test]
    fn list_states_sees_all_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().to_str().unwrap());
        let a = test_checksum(0x11);
        let b = test_checksum(0xFE);
        store.put_state(&a, b"a").unwrap();
        store.put_state(&b, b"b").unwrap();
        let mut listed = store.list_states().unwrap();
        listed.sort();
        assert_eq!(listed, vec![a, b]);
    }
}
