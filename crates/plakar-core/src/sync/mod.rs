use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::objects::Checksum;
use crate::packfile::BlobType;
use crate::repository::Repository;
use crate::snapshot::Snapshot;
use crate::state::Metadata;

/// Transfer direction relative to the local repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    To,
    From,
    With,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "to" => Some(Direction::To),
            "from" => Some(Direction::From),
            "with" => Some(Direction::With),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncStats {
    pub snapshots_synced: usize,
    pub snapshots_failed: usize,
}

/// Snapshots present on `src` but missing on `dst`, optionally filtered by
/// a hex id prefix.
fn missing_on(src: &Repository, dst: &Repository, prefix: Option<&str>) -> Result<Vec<Checksum>> {
    let dst_ids: BTreeSet<Checksum> = dst.snapshots()?.into_iter().collect();
    Ok(src
        .snapshots()?
        .into_iter()
        .filter(|id| match prefix {
            Some(prefix) => id.to_hex().starts_with(prefix),
            None => true,
        })
        .filter(|id| !dst_ids.contains(id))
        .collect())
}

/// Copy one snapshot's transitive closure to `dst`, then its header, then
/// commit a state file on `dst`. Only blobs `dst` lacks are transferred.
fn synchronize(src: &Arc<Repository>, dst: &Arc<Repository>, snapshot_id: Checksum) -> Result<()> {
    let snapshot = Snapshot::load(Arc::clone(src), snapshot_id)?;
    let mut packer = dst.new_packer();

    for chunk_csum in snapshot.list_chunks()? {
        if !dst.blob_exists(BlobType::Chunk, &chunk_csum) {
            let data = src.get_blob(BlobType::Chunk, &chunk_csum)?;
            packer.put_blob(BlobType::Chunk, chunk_csum, &data)?;
        }
    }

    for object_csum in snapshot.list_objects()? {
        if !dst.blob_exists(BlobType::Object, &object_csum) {
            let data = src.get_blob(BlobType::Object, &object_csum)?;
            packer.put_blob(BlobType::Object, object_csum, &data)?;
        }
    }

    let vfs = snapshot.vfs();
    for (_, entry_csum) in vfs.entries()? {
        if !dst.blob_exists(BlobType::VfsEntry, &entry_csum) {
            let data = src.get_blob(BlobType::VfsEntry, &entry_csum)?;
            packer.put_blob(BlobType::VfsEntry, entry_csum, &data)?;
        }
    }

    vfs.visit_nodes(|node_csum, _| {
        if !dst.blob_exists(BlobType::Vfs, node_csum) {
            let data = src.get_blob(BlobType::Vfs, node_csum)?;
            packer.put_blob(BlobType::Vfs, *node_csum, &data)?;
        }
        Ok(())
    })?;

    for data_csum in snapshot.list_datas()? {
        if !dst.blob_exists(BlobType::Data, &data_csum) {
            let data = src.get_blob(BlobType::Data, &data_csum)?;
            packer.put_blob(BlobType::Data, data_csum, &data)?;
        }
    }

    if let Some(index) = snapshot.xattr_index() {
        for (_, record_csum) in index.entries()? {
            if !dst.blob_exists(BlobType::XattrEntry, &record_csum) {
                let data = src.get_blob(BlobType::XattrEntry, &record_csum)?;
                packer.put_blob(BlobType::XattrEntry, record_csum, &data)?;
            }
        }
        index.visit_nodes(|node_csum, _| {
            if !dst.blob_exists(BlobType::Xattr, node_csum) {
                let data = src.get_blob(BlobType::Xattr, node_csum)?;
                packer.put_blob(BlobType::Xattr, *node_csum, &data)?;
            }
            Ok(())
        })?;
    }

    if let Some(errors_blob) = snapshot.header.errors_blob {
        if !dst.blob_exists(BlobType::Error, &errors_blob) {
            let data = src.get_blob(BlobType::Error, &errors_blob)?;
            packer.put_blob(BlobType::Error, errors_blob, &data)?;
        }
    }

    // The header is copied byte-for-byte so the snapshot keeps its
    // identity on the destination.
    let header_bytes = src.get_blob(BlobType::Snapshot, &snapshot_id)?;
    packer.put_blob(BlobType::Snapshot, snapshot_id, &header_bytes)?;

    let deltas = packer.finish()?;
    dst.write_state(&deltas, &Metadata::new())?;
    Ok(())
}

/// Copy every missing snapshot in one direction. Per-snapshot failures are
/// logged and do not abort the batch.
fn sync_one_way(
    src: &Arc<Repository>,
    dst: &Arc<Repository>,
    prefix: Option<&str>,
    stats: &mut SyncStats,
) -> Result<()> {
    let missing = missing_on(src, dst, prefix)?;
    info!(
        count = missing.len(),
        src = src.location(),
        dst = dst.location(),
        "synchronizing snapshots"
    );
    for snapshot_id in missing {
        match synchronize(src, dst, snapshot_id) {
            Ok(()) => stats.snapshots_synced += 1,
            Err(e) => {
                warn!(snapshot = %snapshot_id, "could not synchronize snapshot: {e}");
                stats.snapshots_failed += 1;
            }
        }
    }
    Ok(())
}

/// Synchronize two repositories. `To` copies local→peer, `From` copies
/// peer→local, `With` runs both directions symmetrically.
pub fn sync(
    local: &Arc<Repository>,
    peer: &Arc<Repository>,
    prefix: Option<&str>,
    direction: Direction,
) -> Result<SyncStats> {
    let mut stats = SyncStats::default();
    match direction {
        Direction::To => sync_one_way(local, peer, prefix, &mut stats)?,
        Direction::From => sync_one_way(peer, local, prefix, &mut stats)?,
        Direction::With => {
            sync_one_way(local, peer, prefix, &mut stats)?;
            sync_one_way(peer, local, prefix, &mut stats)?;
        }
    }
    Ok(stats)
}
