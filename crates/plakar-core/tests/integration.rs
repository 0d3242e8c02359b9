use std::sync::Arc;

use plakar_core::caching::Manager;
use plakar_core::chunker::ChunkerOptions;
use plakar_core::compress::CompressionAlgorithm;
use plakar_core::objects::HashingAlgorithm;
use plakar_core::packfile::BlobType;
use plakar_core::repository::{CreateOptions, Repository};
use plakar_core::snapshot::backup::{backup, BackupOptions};
use plakar_core::snapshot::check::check;
use plakar_core::snapshot::exporter::FsExporter;
use plakar_core::snapshot::importer::FsImporter;
use plakar_core::snapshot::restore::{restore, RestoreOptions};
use plakar_core::snapshot::Snapshot;
use plakar_core::storage;
use plakar_core::sync::{sync, Direction};

struct Env {
    root: tempfile::TempDir,
    cache: tempfile::TempDir,
}

impl Env {
    fn new() -> Self {
        storage::register_default_backends();
        Self {
            root: tempfile::tempdir().unwrap(),
            cache: tempfile::tempdir().unwrap(),
        }
    }

    fn repo_path(&self, name: &str) -> String {
        self.root
            .path()
            .join(name)
            .to_string_lossy()
            .into_owned()
    }

    fn manager(&self) -> Manager {
        Manager::new(self.cache.path().join(format!("c{}", rand_suffix())))
    }

    fn create(&self, name: &str, passphrase: Option<&str>) -> Arc<Repository> {
        let store = storage::open_store(&self.repo_path(name)).unwrap();
        let options = CreateOptions {
            chunking: ChunkerOptions::default(),
            compression: CompressionAlgorithm::Lz4,
            hashing: HashingAlgorithm::Sha256,
        };
        Arc::new(Repository::create(store, options, passphrase, &self.manager()).unwrap())
    }

    fn open(&self, name: &str, passphrase: Option<&str>) -> Arc<Repository> {
        let store = storage::open_store(&self.repo_path(name)).unwrap();
        Arc::new(Repository::open(store, passphrase, &self.manager()).unwrap())
    }
}

fn rand_suffix() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn backup_dir(repo: &Arc<Repository>, dir: &std::path::Path) -> plakar_core::objects::Checksum {
    let importer = FsImporter::new(dir.to_str().unwrap()).unwrap();
    backup(repo, &importer, &BackupOptions::default()).unwrap()
}

#[test]
fn create_backup_list_restore_on_disk() {
    let env = Env::new();
    let repo = env.create("store", None);

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"hi").unwrap();
    std::fs::write(src.path().join("b.txt"), b"hi").unwrap();

    let id = backup_dir(&repo, src.path());

    // Identical contents dedup into a single chunk delta.
    assert_eq!(repo.state().list_by_type(BlobType::Chunk).unwrap().len(), 1);

    // Repository layout on disk.
    let root = std::path::Path::new(&env.repo_path("store")).to_path_buf();
    assert!(root.join("CONFIG").is_file());
    assert!(root.join("packfiles").is_dir());
    assert!(root.join("states").is_dir());

    // Listing is lexicographic with correct sizes.
    let reopened = env.open("store", None);
    let snapshot = Snapshot::load(Arc::clone(&reopened), id).unwrap();
    let vfs = snapshot.vfs();
    let names: Vec<String> = vfs
        .entries_under("/")
        .unwrap()
        .into_iter()
        .map(|(p, _)| p)
        .collect();
    assert_eq!(names, vec!["/", "/a.txt", "/b.txt"]);
    assert_eq!(vfs.get("/a.txt").unwrap().unwrap().info.size, 2);

    // Restore reproduces the bytes.
    let out = tempfile::tempdir().unwrap();
    let mut exporter = FsExporter::new(out.path().to_str().unwrap());
    restore(&snapshot, &mut exporter, &RestoreOptions::default()).unwrap();
    assert_eq!(std::fs::read(out.path().join("a.txt")).unwrap(), b"hi");
    assert_eq!(std::fs::read(out.path().join("b.txt")).unwrap(), b"hi");
}

#[test]
fn second_backup_reuses_all_data() {
    let env = Env::new();
    let repo = env.create("store", None);

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f.txt"), b"stable content").unwrap();

    backup_dir(&repo, src.path());
    let chunks_before = repo.state().list_by_type(BlobType::Chunk).unwrap();

    backup_dir(&repo, src.path());
    let chunks_after = repo.state().list_by_type(BlobType::Chunk).unwrap();

    assert_eq!(chunks_before, chunks_after);
    assert_eq!(repo.snapshots().unwrap().len(), 2);
}

#[test]
fn encrypted_repository_end_to_end() {
    let env = Env::new();
    let repo = env.create("sealed", Some("hunter2"));

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("secret.txt"), b"confidential").unwrap();
    let id = backup_dir(&repo, src.path());

    // Reopen with the passphrase and read back.
    let reopened = env.open("sealed", Some("hunter2"));
    let snapshot = Snapshot::load(Arc::clone(&reopened), id).unwrap();
    assert_eq!(snapshot.read_file("/secret.txt").unwrap(), b"confidential");

    // Wrong passphrase is refused.
    let store = storage::open_store(&env.repo_path("sealed")).unwrap();
    assert!(Repository::open(store, Some("wrong"), &env.manager()).is_err());
}

#[test]
fn sync_between_disk_repositories() {
    let env = Env::new();
    let src_repo = env.create("src", None);
    let dst_repo = env.create("dst", None);

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("shared.txt"), b"payload").unwrap();
    let id = backup_dir(&src_repo, src.path());

    let stats = sync(&src_repo, &dst_repo, None, Direction::To).unwrap();
    assert_eq!(stats.snapshots_synced, 1);
    assert_eq!(dst_repo.snapshots().unwrap(), vec![id]);

    let report = check(&dst_repo, None, false).unwrap();
    assert!(report.is_ok(), "check errors: {:?}", report.errors);

    let snapshot = Snapshot::load(Arc::clone(&dst_repo), id).unwrap();
    assert_eq!(snapshot.read_file("/shared.txt").unwrap(), b"payload");
}

#[test]
fn corrupting_one_byte_fails_check() {
    let env = Env::new();
    let repo = env.create("store", None);

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f.txt"), b"bytes that will be damaged").unwrap();
    backup_dir(&repo, src.path());

    assert!(check(&repo, None, false).unwrap().is_ok());

    // Flip one byte in one packfile on disk.
    let packfiles_dir = std::path::Path::new(&env.repo_path("store")).join("packfiles");
    let mut corrupted = false;
    for entry in walk_files(&packfiles_dir) {
        let mut data = std::fs::read(&entry).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0x01;
        std::fs::write(&entry, data).unwrap();
        corrupted = true;
        break;
    }
    assert!(corrupted, "expected at least one packfile on disk");

    let report = check(&repo, None, false).unwrap();
    assert!(!report.is_ok());
}

fn walk_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}
