use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::RngCore;

use crate::error::PlakarError;
use crate::packfile::BlobType;
use crate::snapshot::backup::{backup, BackupOptions};
use crate::snapshot::exporter::FsExporter;
use crate::snapshot::importer::FsImporter;
use crate::snapshot::restore::{restore, RestoreOptions};
use crate::snapshot::vfs::EntryKind;
use crate::snapshot::Snapshot;
use crate::testutil::memory_repo;

fn write_tree(dir: &std::path::Path) {
    std::fs::write(dir.join("a.txt"), b"hi").unwrap();
    std::fs::write(dir.join("b.txt"), b"hi").unwrap();
    std::fs::create_dir(dir.join("sub")).unwrap();
    std::fs::write(dir.join("sub/nested.txt"), b"nested content").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("a.txt", dir.join("link")).unwrap();
}

fn backup_dir(
    repo: &Arc<crate::repository::Repository>,
    dir: &std::path::Path,
    options: &BackupOptions,
) -> crate::objects::Checksum {
    let importer = FsImporter::new(dir.to_str().unwrap()).unwrap();
    backup(repo, &importer, options).unwrap()
}

#[test]
fn identical_files_share_one_chunk() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"hi").unwrap();
    std::fs::write(src.path().join("b.txt"), b"hi").unwrap();

    let id = backup_dir(&t.repo, src.path(), &BackupOptions::default());

    let chunks = t.repo.state().list_by_type(BlobType::Chunk).unwrap();
    assert_eq!(chunks.len(), 1, "identical contents must dedup to one chunk");

    let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();
    let vfs = snapshot.vfs();
    let a = vfs.get("/a.txt").unwrap().unwrap();
    let b = vfs.get("/b.txt").unwrap().unwrap();
    assert_eq!(a.object, b.object, "identical files share one object");
    assert_eq!(snapshot.read_file("/a.txt").unwrap(), b"hi");
}

#[test]
fn second_backup_of_unchanged_tree_writes_no_data() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path());

    let first = backup_dir(&t.repo, src.path(), &BackupOptions::default());
    let chunks_before = t.repo.state().list_by_type(BlobType::Chunk).unwrap().len();
    let objects_before = t.repo.state().list_by_type(BlobType::Object).unwrap().len();
    let packfiles_before = t.store.packfile_count();

    let second = backup_dir(&t.repo, src.path(), &BackupOptions::default());
    assert_ne!(first, second, "snapshot identities differ per run");

    // No new data blobs; the only new packfile carries the new header.
    assert_eq!(
        t.repo.state().list_by_type(BlobType::Chunk).unwrap().len(),
        chunks_before
    );
    assert_eq!(
        t.repo.state().list_by_type(BlobType::Object).unwrap().len(),
        objects_before
    );
    assert_eq!(t.store.packfile_count(), packfiles_before + 1);
    assert_eq!(t.repo.snapshots().unwrap().len(), 2);
    assert_eq!(t.store.state_count(), 2);
}

#[test]
fn listing_is_lexicographic_with_sizes() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path());

    let id = backup_dir(&t.repo, src.path(), &BackupOptions::default());
    let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();
    let vfs = snapshot.vfs();

    let paths: Vec<String> = vfs.entries().unwrap().into_iter().map(|(p, _)| p).collect();
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
    assert!(paths.contains(&"/a.txt".to_string()));
    assert!(paths.contains(&"/sub/nested.txt".to_string()));

    let nested = vfs.get("/sub/nested.txt").unwrap().unwrap();
    assert_eq!(nested.info.size, b"nested content".len() as u64);
}

#[cfg(unix)]
#[test]
fn restore_reproduces_tree_with_mode_and_mtime() {
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::fs::PermissionsExt;

    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path());

    // A large random file spanning several chunks.
    let mut big = vec![0u8; 10 * 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut big);
    std::fs::write(src.path().join("big.bin"), &big).unwrap();

    std::fs::set_permissions(
        src.path().join("a.txt"),
        std::fs::Permissions::from_mode(0o640),
    )
    .unwrap();
    crate::platform::set_file_mtime(&src.path().join("a.txt"), 1_650_000_000_000_000_000)
        .unwrap();

    let id = backup_dir(&t.repo, src.path(), &BackupOptions::default());

    let out = tempfile::tempdir().unwrap();
    let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();
    let mut exporter = FsExporter::new(out.path().to_str().unwrap());
    let summary = restore(&snapshot, &mut exporter, &RestoreOptions::default()).unwrap();
    assert_eq!(summary.files, 4);
    assert_eq!(summary.symlinks, 1);

    assert_eq!(std::fs::read(out.path().join("a.txt")).unwrap(), b"hi");
    assert_eq!(std::fs::read(out.path().join("big.bin")).unwrap(), big);
    assert_eq!(
        std::fs::read(out.path().join("sub/nested.txt")).unwrap(),
        b"nested content"
    );
    assert_eq!(
        std::fs::read_link(out.path().join("link")).unwrap(),
        std::path::PathBuf::from("a.txt")
    );

    let meta = std::fs::metadata(out.path().join("a.txt")).unwrap();
    assert_eq!(meta.mode() & 0o7777, 0o640);
    assert_eq!(meta.mtime(), 1_650_000_000);
}

#[test]
fn restore_subtree_with_rebase() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path());

    let id = backup_dir(&t.repo, src.path(), &BackupOptions::default());
    let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();

    let out = tempfile::tempdir().unwrap();
    let mut exporter = FsExporter::new(out.path().to_str().unwrap());
    restore(
        &snapshot,
        &mut exporter,
        &RestoreOptions {
            subtree: "/sub".into(),
            rebase: true,
        },
    )
    .unwrap();

    assert_eq!(
        std::fs::read(out.path().join("nested.txt")).unwrap(),
        b"nested content"
    );
    assert!(!out.path().join("a.txt").exists());
}

#[cfg(unix)]
#[test]
fn xattrs_roundtrip_through_backup_and_restore() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    let file = src.path().join("tagged.txt");
    std::fs::write(&file, b"content").unwrap();
    if xattr::set(&file, "user.comment", b"hello xattr").is_err() {
        // Filesystem without user xattr support; nothing to exercise.
        return;
    }

    let id = backup_dir(&t.repo, src.path(), &BackupOptions::default());
    let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();

    // An XATTR_ENTRY record pointing at a DATA value blob. Systems with
    // mandatory labeling may add their own attributes, so look ours up.
    let index = snapshot.xattr_index().expect("snapshot has an xattr index");
    let record = index
        .entries()
        .unwrap()
        .into_iter()
        .map(|(_, csum)| index.load_record(&csum).unwrap())
        .find(|r| r.path == "/tagged.txt" && r.name == "user.comment")
        .expect("captured xattr record");
    assert_eq!(record.size, b"hello xattr".len() as u64);
    assert!(!snapshot.list_datas().unwrap().is_empty());
    let value = t.repo.get_blob(BlobType::Data, &record.data).unwrap();
    assert_eq!(value, b"hello xattr");

    // Restore writes the attribute back onto the exported file.
    let out = tempfile::tempdir().unwrap();
    let mut exporter = FsExporter::new(out.path().to_str().unwrap());
    let summary = restore(&snapshot, &mut exporter, &RestoreOptions::default()).unwrap();
    assert!(summary.xattrs >= 1);
    let restored = xattr::get(out.path().join("tagged.txt"), "user.comment").unwrap();
    assert_eq!(restored.as_deref(), Some(&b"hello xattr"[..]));
}

#[test]
fn snapshot_without_xattrs_has_no_index() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    let path = src.path().join("plain.txt");
    std::fs::write(&path, b"plain").unwrap();

    #[cfg(unix)]
    {
        let ambient = |p: &std::path::Path| {
            xattr::list(p)
                .map(|mut names| names.next().is_some())
                .unwrap_or(false)
        };
        if ambient(&path) || ambient(src.path()) {
            // Labeled system: every node carries attributes already.
            return;
        }
    }

    let id = backup_dir(&t.repo, src.path(), &BackupOptions::default());
    let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();
    assert!(snapshot.header.xattr_root.is_none());
    assert!(snapshot.list_datas().unwrap().is_empty());
}

#[test]
fn subtree_listing_skips_lookalike_siblings() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir(src.path().join("sub")).unwrap();
    std::fs::write(src.path().join("sub/inner.txt"), b"inner").unwrap();
    // `.` sorts before `/`, so this sibling lands between the directory
    // key and its children in the tree.
    std::fs::write(src.path().join("sub.txt"), b"sibling").unwrap();

    let id = backup_dir(&t.repo, src.path(), &BackupOptions::default());
    let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();

    let paths: Vec<String> = snapshot
        .vfs()
        .entries_under("/sub")
        .unwrap()
        .into_iter()
        .map(|(p, _)| p)
        .collect();
    assert_eq!(paths, vec!["/sub", "/sub/inner.txt"]);
}

#[test]
fn excludes_skip_matching_records() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path());

    let id = backup_dir(
        &t.repo,
        src.path(),
        &BackupOptions {
            excludes: vec!["*.txt".into()],
            ..Default::default()
        },
    );

    let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();
    let vfs = snapshot.vfs();
    assert!(vfs.get("/a.txt").unwrap().is_none());
    assert!(vfs.get("/sub/nested.txt").unwrap().is_none());
    assert!(vfs.get("/sub").unwrap().is_some());
}

#[test]
fn referential_closure_resolves_through_state() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path());

    let id = backup_dir(&t.repo, src.path(), &BackupOptions::default());
    let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();

    // Every transitively referenced blob must resolve and verify.
    let vfs = snapshot.vfs();
    vfs.visit_nodes(|node_csum, _| {
        t.repo.get_blob(BlobType::Vfs, node_csum).map(|_| ())
    })
    .unwrap();
    for (_, entry_csum) in vfs.entries().unwrap() {
        t.repo.get_blob(BlobType::VfsEntry, &entry_csum).unwrap();
    }
    for object_csum in snapshot.list_objects().unwrap() {
        t.repo.get_blob(BlobType::Object, &object_csum).unwrap();
    }
    for chunk_csum in snapshot.list_chunks().unwrap() {
        t.repo.get_blob(BlobType::Chunk, &chunk_csum).unwrap();
    }
}

#[test]
fn soft_errors_count_without_failing_the_snapshot() {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if unsafe { libc::geteuid() } == 0 {
            // Permission bits do not apply to root; nothing to exercise.
            return;
        }

        let t = memory_repo();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("ok.txt"), b"fine").unwrap();
        std::fs::write(src.path().join("denied.txt"), b"secret").unwrap();
        std::fs::set_permissions(
            src.path().join("denied.txt"),
            std::fs::Permissions::from_mode(0o000),
        )
        .unwrap();

        let id = backup_dir(&t.repo, src.path(), &BackupOptions::default());
        let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();
        assert_eq!(snapshot.header.errors, 1);
        assert!(snapshot.header.errors_blob.is_some());
        assert_eq!(snapshot.read_file("/ok.txt").unwrap(), b"fine");
        assert!(snapshot.vfs().get("/denied.txt").unwrap().is_none());
    }
}

#[test]
fn cancelled_backup_commits_nothing() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path());

    let options = BackupOptions::default();
    options.cancel.store(true, Ordering::Relaxed);

    let importer = FsImporter::new(src.path().to_str().unwrap()).unwrap();
    let result = backup(&t.repo, &importer, &options);
    assert!(matches!(result, Err(PlakarError::Cancelled)));
    assert!(t.repo.snapshots().unwrap().is_empty());
}

#[test]
fn header_counters_match_the_tree() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    write_tree(src.path());

    let id = backup_dir(&t.repo, src.path(), &BackupOptions::default());
    let snapshot = Snapshot::load(Arc::clone(&t.repo), id).unwrap();

    assert_eq!(snapshot.header.files_count, 3);
    // The backup root plus `sub`.
    assert_eq!(snapshot.header.directories_count, 2);
    assert_eq!(
        snapshot.header.size,
        (b"hi".len() * 2 + b"nested content".len()) as u64
    );
    assert_eq!(snapshot.header.importer_type, "fs");

    let root_entry = snapshot.vfs().get("/").unwrap().unwrap();
    assert_eq!(root_entry.kind, EntryKind::Directory);
}
