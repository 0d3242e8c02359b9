use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{PlakarError, Result};
use crate::objects::Checksum;
use crate::packfile::BlobType;
use crate::repository::Repository;
use crate::snapshot::Snapshot;

/// One integrity issue found during a check.
#[derive(Debug)]
pub struct CheckError {
    pub context: String,
    pub message: String,
}

/// Summary of a check run. `is_ok()` decides the exit code.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub snapshots_checked: usize,
    pub blobs_checked: usize,
    pub errors: Vec<CheckError>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Verify one snapshot's transitive closure: every VFS node, entry,
/// object, and chunk must resolve through the state and, unless `fast`,
/// decode and hash back to its recorded checksum.
///
/// `fast` only checks resolution and packfile presence; it is meant for
/// administrative sweeps, not as a substitute for verified reads.
pub fn check_snapshot(
    repo: &Arc<Repository>,
    snapshot_id: &Checksum,
    fast: bool,
    report: &mut CheckReport,
) -> Result<()> {
    let snapshot = match Snapshot::load(Arc::clone(repo), *snapshot_id) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            report.errors.push(CheckError {
                context: format!("snapshot {snapshot_id}"),
                message: e.to_string(),
            });
            return Ok(());
        }
    };
    report.snapshots_checked += 1;

    let mut blobs: Vec<(BlobType, Checksum)> = Vec::new();

    // VFS nodes and entries.
    let vfs = snapshot.vfs();
    let mut entry_csums: BTreeSet<Checksum> = BTreeSet::new();
    let visit_result = vfs.visit_nodes(|node_csum, node| {
        blobs.push((BlobType::Vfs, *node_csum));
        for value in &node.values {
            entry_csums.insert(*value);
        }
        Ok(())
    });
    if let Err(e) = visit_result {
        report.errors.push(CheckError {
            context: format!("snapshot {snapshot_id}: vfs walk"),
            message: e.to_string(),
        });
    }
    for entry_csum in &entry_csums {
        blobs.push((BlobType::VfsEntry, *entry_csum));
    }

    // Objects and chunks, resolved through entries where readable.
    let mut object_csums: BTreeSet<Checksum> = BTreeSet::new();
    let mut chunk_csums: BTreeSet<Checksum> = BTreeSet::new();
    for entry_csum in &entry_csums {
        let entry = match vfs.load_entry(entry_csum) {
            Ok(entry) => entry,
            Err(e) => {
                report.errors.push(CheckError {
                    context: format!("vfs entry {entry_csum}"),
                    message: e.to_string(),
                });
                continue;
            }
        };
        if let Some(object_csum) = entry.object {
            if object_csums.insert(object_csum) {
                match snapshot.get_object(&object_csum) {
                    Ok(object) => {
                        for chunk in object.chunks {
                            chunk_csums.insert(chunk.checksum);
                        }
                    }
                    Err(e) => {
                        report.errors.push(CheckError {
                            context: format!("object {object_csum}"),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }
    for object_csum in &object_csums {
        blobs.push((BlobType::Object, *object_csum));
    }
    for chunk_csum in &chunk_csums {
        blobs.push((BlobType::Chunk, *chunk_csum));
    }
    // Xattr index nodes, records, and their value blobs.
    if let Some(index) = snapshot.xattr_index() {
        let mut record_csums: BTreeSet<Checksum> = BTreeSet::new();
        let visit_result = index.visit_nodes(|node_csum, node| {
            blobs.push((BlobType::Xattr, *node_csum));
            for value in &node.values {
                record_csums.insert(*value);
            }
            Ok(())
        });
        if let Err(e) = visit_result {
            report.errors.push(CheckError {
                context: format!("snapshot {snapshot_id}: xattr walk"),
                message: e.to_string(),
            });
        }
        for record_csum in &record_csums {
            blobs.push((BlobType::XattrEntry, *record_csum));
            match index.load_record(record_csum) {
                Ok(record) => blobs.push((BlobType::Data, record.data)),
                Err(e) => {
                    report.errors.push(CheckError {
                        context: format!("xattr record {record_csum}"),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    if let Some(errors_blob) = snapshot.header.errors_blob {
        blobs.push((BlobType::Error, errors_blob));
    }
    blobs.push((BlobType::Snapshot, *snapshot_id));

    for (blob_type, csum) in blobs {
        match verify_blob(repo, blob_type, &csum, fast) {
            Ok(()) => report.blobs_checked += 1,
            Err(e) => report.errors.push(CheckError {
                context: format!("{} {csum}", blob_type.as_str()),
                message: e.to_string(),
            }),
        }
    }
    Ok(())
}

fn verify_blob(
    repo: &Repository,
    blob_type: BlobType,
    csum: &Checksum,
    fast: bool,
) -> Result<()> {
    if fast {
        let location = repo
            .state()
            .get_location(blob_type, csum)?
            .ok_or_else(|| {
                PlakarError::NotFound(format!("{} blob {csum}", blob_type.as_str()))
            })?;
        // Presence only; contents are not decoded on the fast path.
        repo.store()
            .get_packfile_range(&location.packfile, location.offset, 1)?;
        Ok(())
    } else {
        repo.get_blob(blob_type, csum).map(|_| ())
    }
}

/// Check every snapshot, or a single one.
pub fn check(repo: &Arc<Repository>, snapshot_id: Option<&Checksum>, fast: bool) -> Result<CheckReport> {
    let ids = match snapshot_id {
        Some(id) => vec![*id],
        None => repo.snapshots()?,
    };

    let mut report = CheckReport::default();
    for id in &ids {
        debug!(snapshot = %id, "checking");
        check_snapshot(repo, id, fast, &mut report)?;
    }

    // Container-level pass: every packfile must hash to its name and carry
    // a valid footer. Catches corruption in regions no snapshot references.
    for packfile_id in repo.store().list_packfiles()? {
        let data = match repo.store().get_packfile(&packfile_id) {
            Ok(data) => data,
            Err(e) => {
                report.errors.push(CheckError {
                    context: format!("packfile {packfile_id}"),
                    message: e.to_string(),
                });
                continue;
            }
        };
        if repo.checksum(&data) != packfile_id {
            report.errors.push(CheckError {
                context: format!("packfile {packfile_id}"),
                message: "packfile contents do not hash to its identity".into(),
            });
            continue;
        }
        if let Err(e) = crate::packfile::parse_footer(repo.codec(), &data, !fast) {
            report.errors.push(CheckError {
                context: format!("packfile {packfile_id}"),
                message: e.to_string(),
            });
        }
    }
    info!(
        snapshots = report.snapshots_checked,
        blobs = report.blobs_checked,
        errors = report.errors.len(),
        "check finished"
    );
    Ok(report)
}
