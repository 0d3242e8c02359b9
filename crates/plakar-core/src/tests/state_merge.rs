use std::sync::Arc;

use crate::caching::Manager;
use crate::packfile::BlobType;
use crate::repository::{CreateOptions, Repository};
use crate::snapshot::backup::{backup, BackupOptions};
use crate::snapshot::importer::FsImporter;
use crate::state::Metadata;
use crate::storage::{Store, StoreMode};
use crate::testutil::{memory_repo, reopen, MemoryStore, SharedStore, TestRepo};

fn two_snapshot_repo() -> (TestRepo, tempfile::TempDir) {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("one.txt"), b"one").unwrap();
    let importer = FsImporter::new(src.path().to_str().unwrap()).unwrap();
    backup(&t.repo, &importer, &BackupOptions::default()).unwrap();
    std::fs::write(src.path().join("two.txt"), b"two").unwrap();
    backup(&t.repo, &importer, &BackupOptions::default()).unwrap();
    (t, src)
}

#[test]
fn reopen_publishes_an_aggregate_and_prunes_absorbed_states() {
    let (t, _src) = two_snapshot_repo();
    let absorbed: Vec<_> = t.store.list_states().unwrap();
    assert_eq!(absorbed.len(), 2);

    let merged = reopen(&t, None);

    // One aggregate remains; it extends exactly the absorbed states.
    let remaining = merged.store.list_states().unwrap();
    assert_eq!(remaining.len(), 1);
    let aggregate_id = remaining[0];
    assert!(!absorbed.contains(&aggregate_id));

    let metadata = merged
        .repo
        .state()
        .state_metadata(&aggregate_id)
        .unwrap()
        .unwrap();
    assert!(metadata.aggregate);
    let mut extends = metadata.extends.clone();
    let mut expected = absorbed.clone();
    extends.sort();
    expected.sort();
    assert_eq!(extends, expected);

    // Nothing reachable was lost.
    assert_eq!(merged.repo.snapshots().unwrap().len(), 2);

    // A third opener sees a single state and does not aggregate again.
    let again = reopen(&merged, None);
    assert_eq!(again.store.list_states().unwrap().len(), 1);
    assert_eq!(again.repo.snapshots().unwrap().len(), 2);
}

#[test]
fn merge_is_idempotent_across_reopens() {
    let (t, _src) = two_snapshot_repo();
    let merged = reopen(&t, None);
    let chunks = merged.repo.state().list_by_type(BlobType::Chunk).unwrap();

    let merged_again = reopen(&merged, None);
    let chunks_again = merged_again
        .repo
        .state()
        .list_by_type(BlobType::Chunk)
        .unwrap();
    assert_eq!(chunks, chunks_again);
}

#[test]
fn no_delete_store_keeps_superseded_states() {
    let cache_dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(cache_dir.path());
    let store = Arc::new(MemoryStore::new_no_delete());
    let repo = Arc::new(
        Repository::create(
            Box::new(SharedStore(Arc::clone(&store))),
            CreateOptions::default(),
            None,
            &manager,
        )
        .unwrap(),
    );

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f.txt"), b"data").unwrap();
    let importer = FsImporter::new(src.path().to_str().unwrap()).unwrap();
    backup(&repo, &importer, &BackupOptions::default()).unwrap();
    std::fs::write(src.path().join("g.txt"), b"more").unwrap();
    backup(&repo, &importer, &BackupOptions::default()).unwrap();
    assert_eq!(store.list_states().unwrap().len(), 2);
    assert_eq!(store.mode(), StoreMode::NoDelete);

    // Reopen merges and publishes the aggregate but must not delete.
    let cache_dir2 = tempfile::tempdir().unwrap();
    let manager2 = Manager::new(cache_dir2.path());
    let reopened = Repository::open(
        Box::new(SharedStore(Arc::clone(&store))),
        None,
        &manager2,
    )
    .unwrap();
    assert_eq!(store.list_states().unwrap().len(), 3);
    assert_eq!(reopened.snapshots().unwrap().len(), 2);
}

#[test]
fn remove_snapshot_drops_the_reference() {
    let (t, _src) = two_snapshot_repo();
    let snapshots = t.repo.snapshots().unwrap();
    assert_eq!(snapshots.len(), 2);

    t.repo.remove_snapshot(&snapshots[0]).unwrap();
    let remaining = t.repo.snapshots().unwrap();
    assert_eq!(remaining, vec![snapshots[1]]);

    // A fresh opener agrees.
    let other = reopen(&t, None);
    assert_eq!(other.repo.snapshots().unwrap(), vec![snapshots[1]]);
}

#[test]
fn snapshot_state_contains_its_snapshot_entry() {
    let t = memory_repo();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f.txt"), b"data").unwrap();
    let importer = FsImporter::new(src.path().to_str().unwrap()).unwrap();
    let id = backup(&t.repo, &importer, &BackupOptions::default()).unwrap();

    // Decode the single state file on the store and look for the
    // SNAPSHOT delta naming the new snapshot.
    let states = t.store.list_states().unwrap();
    assert_eq!(states.len(), 1);
    let raw = t.store.get_state(&states[0]).unwrap();
    let plaintext = t.repo.codec().decode_state(&raw).unwrap();
    let (entries, metadata) =
        crate::state::deserialize_from_stream(&mut &plaintext[..]).unwrap();
    assert!(!metadata.aggregate);
    assert!(entries
        .iter()
        .any(|e| e.blob_type == BlobType::Snapshot && e.blob == id));
    // The state file is named by the checksum of its plaintext.
    assert_eq!(t.repo.checksum(&plaintext), states[0]);
}

#[test]
fn write_state_roundtrips_by_content_id() {
    let t = memory_repo();
    let metadata = Metadata::new();
    let id = t.repo.write_state(&[], &metadata).unwrap();
    let raw = t.store.get_state(&id).unwrap();
    let plaintext = t.repo.codec().decode_state(&raw).unwrap();
    assert_eq!(t.repo.checksum(&plaintext), id);
}
