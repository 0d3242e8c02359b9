use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use crossbeam_channel::{bounded, Sender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::btree::{BTree, MemoryNodeStore, DEFAULT_ORDER};
use crate::chunker;
use crate::error::{PlakarError, Result};
use crate::objects::Checksum;
use crate::packfile::BlobType;
use crate::platform;
use crate::repository::packer::Packer;
use crate::repository::Repository;
use crate::snapshot::importer::{Importer, ScanRecord};
use crate::snapshot::vfs::{self, EntryKind, VfsEntry, XattrRecord};
use crate::snapshot::{ChunkRef, ErrorRecord, Header, Object};
use crate::state::Metadata;

/// Options for one backup run.
pub struct BackupOptions {
    pub tags: Vec<String>,
    /// Gitignore-style path patterns; matching records are skipped.
    pub excludes: Vec<String>,
    /// Worker pool size; 0 means `8 × CPUs + 1`.
    pub concurrency: usize,
    /// Cooperative cancellation token.
    pub cancel: Arc<AtomicBool>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            excludes: Vec::new(),
            concurrency: 0,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Default worker pool size. I/O-bound stages oversubscribe CPU count.
pub fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    8 * cpus + 1
}

/// A blob submitted to the single packer writer.
struct PackerMsg {
    blob_type: BlobType,
    csum: Checksum,
    data: Vec<u8>,
}

/// Result of processing one scan record in a worker.
enum WorkerOutput {
    Entry {
        path: String,
        entry: VfsEntry,
        kind: EntryKind,
        size: u64,
        xattrs: Vec<(String, Vec<u8>)>,
    },
    SoftError {
        path: String,
        message: String,
    },
}

/// The content-addressed in-flight set: at most one producer per
/// `(type, checksum)` across concurrent workers. The state cache is
/// consulted first; the second caller skips.
type InflightSet = Arc<Mutex<HashSet<(u8, Checksum)>>>;

fn submit_blob(
    repo: &Repository,
    packer_tx: &Sender<PackerMsg>,
    inflight: &InflightSet,
    blob_type: BlobType,
    csum: Checksum,
    data: Vec<u8>,
) -> Result<()> {
    if repo.blob_exists(blob_type, &csum) {
        return Ok(());
    }
    {
        let mut set = inflight.lock().expect("in-flight set lock");
        if !set.insert((blob_type as u8, csum)) {
            return Ok(());
        }
    }
    packer_tx
        .send(PackerMsg {
            blob_type,
            csum,
            data,
        })
        .map_err(|_| PlakarError::Cancelled)?;
    Ok(())
}

fn build_excludes(patterns: &[String]) -> Result<Option<ignore::gitignore::Gitignore>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = ignore::gitignore::GitignoreBuilder::new("/");
    for pattern in patterns {
        builder.add_line(None, pattern).map_err(|e| {
            PlakarError::Config(format!("invalid exclude pattern '{pattern}': {e}"))
        })?;
    }
    let matcher = builder
        .build()
        .map_err(|e| PlakarError::Config(format!("exclude matcher build failed: {e}")))?;
    Ok(Some(matcher))
}

fn is_excluded(matcher: &Option<ignore::gitignore::Gitignore>, record: &ScanRecord) -> bool {
    let Some(matcher) = matcher else {
        return false;
    };
    if record.pathname == "/" {
        return false;
    }
    matcher
        .matched_path_or_any_parents(
            Path::new(&record.pathname),
            record.kind == EntryKind::Directory,
        )
        .is_ignore()
}

/// Minimal content-type sniff over the head of the first chunk.
fn sniff_content_type(head: &[u8]) -> String {
    const MAGICS: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF8", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"\x1f\x8b", "application/gzip"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x7fELF", "application/x-executable"),
    ];
    for (magic, mime) in MAGICS {
        if head.starts_with(magic) {
            return (*mime).to_string();
        }
    }
    if head.is_empty() || std::str::from_utf8(head).is_ok() {
        "text/plain; charset=utf-8".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

/// Chunk, hash, and submit one regular file; assemble its OBJECT record
/// and VFS entry.
fn process_file(
    repo: &Repository,
    importer: &dyn Importer,
    packer_tx: &Sender<PackerMsg>,
    inflight: &InflightSet,
    record: &ScanRecord,
) -> Result<(VfsEntry, u64)> {
    let reader = importer.open(&record.pathname)?;
    let chunking = &repo.configuration().chunking;

    let mut chunks: Vec<ChunkRef> = Vec::new();
    let mut head: Vec<u8> = Vec::new();
    let mut total = 0u64;
    for chunk in chunker::chunk_stream(reader, chunking)? {
        let chunk = chunk?;
        if head.is_empty() {
            head.extend_from_slice(&chunk.data[..chunk.data.len().min(512)]);
        }
        let csum = repo.checksum(&chunk.data);
        total += chunk.length as u64;
        chunks.push(ChunkRef {
            checksum: csum,
            length: chunk.length,
        });
        submit_blob(repo, packer_tx, inflight, BlobType::Chunk, csum, chunk.data)?;
    }

    let object = Object {
        content_type: sniff_content_type(&head),
        length: total,
        chunks,
    };
    let object_bytes = object.to_bytes()?;
    let object_csum = repo.checksum(&object_bytes);
    submit_blob(
        repo,
        packer_tx,
        inflight,
        BlobType::Object,
        object_csum,
        object_bytes,
    )?;

    let mut info = record.info.clone();
    info.size = total;
    let entry = VfsEntry {
        kind: EntryKind::File,
        path: record.pathname.clone(),
        info,
        object: Some(object_csum),
        link_target: None,
    };
    Ok((entry, total))
}

fn process_record(
    repo: &Repository,
    importer: &dyn Importer,
    packer_tx: &Sender<PackerMsg>,
    inflight: &InflightSet,
    record: ScanRecord,
) -> Result<WorkerOutput> {
    match record.kind {
        EntryKind::File => match process_file(repo, importer, packer_tx, inflight, &record) {
            Ok((entry, size)) => Ok(WorkerOutput::Entry {
                path: record.pathname,
                entry,
                kind: EntryKind::File,
                size,
                xattrs: record.xattrs,
            }),
            Err(e) if e.is_soft_file_error() => {
                warn!(path = %record.pathname, "skipping file: {e}");
                Ok(WorkerOutput::SoftError {
                    path: record.pathname,
                    message: e.to_string(),
                })
            }
            Err(e) => Err(e),
        },
        kind => {
            let entry = VfsEntry {
                kind,
                path: record.pathname.clone(),
                info: record.info,
                object: None,
                link_target: record.link_target,
            };
            Ok(WorkerOutput::Entry {
                path: record.pathname,
                entry,
                kind,
                size: 0,
                xattrs: record.xattrs,
            })
        }
    }
}

/// Run one backup: scan → chunk/hash workers → single packer writer →
/// VFS tree build → commit. Returns the new snapshot id.
///
/// The SNAPSHOT blob is written only after every blob it references is
/// durable, and the state file naming it is written afterwards; an
/// interrupted run leaves orphan blobs but never a dangling snapshot.
pub fn backup(
    repo: &Arc<Repository>,
    importer: &dyn Importer,
    options: &BackupOptions,
) -> Result<Checksum> {
    let started = Utc::now();
    let excludes = build_excludes(&options.excludes)?;
    let workers = if options.concurrency == 0 {
        default_concurrency()
    } else {
        options.concurrency
    };
    let cancel = &options.cancel;

    let scan_iter = importer.scan()?;

    let inflight: InflightSet = Arc::new(Mutex::new(HashSet::new()));
    let (packer_tx, packer_rx) = bounded::<PackerMsg>(256);

    // Single writer: every blob submission funnels into one packer.
    let packer_repo = Arc::clone(repo);
    let packer_handle = std::thread::spawn(move || -> Result<Packer> {
        let mut packer = packer_repo.new_packer();
        for msg in packer_rx {
            packer.put_blob(msg.blob_type, msg.csum, &msg.data)?;
        }
        Ok(packer)
    });

    let mut entries: Vec<(String, VfsEntry)> = Vec::new();
    let mut xattrs: Vec<(String, String, Vec<u8>)> = Vec::new();
    let mut errors: Vec<ErrorRecord> = Vec::new();
    let mut files_count = 0u64;
    let mut directories_count = 0u64;
    let mut total_size = 0u64;

    let pipeline_result: Result<()> = std::thread::scope(|s| {
        let (scan_tx, scan_rx) = bounded::<ScanRecord>(1024);
        let (out_tx, out_rx) = bounded::<WorkerOutput>(1024);

        // Scanner: walk the importer, filter exclusions, feed the workers.
        let scanner_cancel = Arc::clone(cancel);
        let scanner_out = out_tx.clone();
        let scanner = s.spawn(move || -> Result<()> {
            for record in scan_iter {
                if scanner_cancel.load(Ordering::Relaxed) {
                    return Err(PlakarError::Cancelled);
                }
                let record = match record {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("scan error: {e}");
                        let _ = scanner_out.send(WorkerOutput::SoftError {
                            path: String::new(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                };
                if is_excluded(&excludes, &record) {
                    debug!(path = %record.pathname, "excluded");
                    continue;
                }
                if scan_tx.send(record).is_err() {
                    break;
                }
            }
            Ok(())
        });

        // Worker pool: read, chunk, hash, dedup-check, submit to the packer.
        let mut worker_handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let scan_rx = scan_rx.clone();
            let out_tx = out_tx.clone();
            let packer_tx = packer_tx.clone();
            let inflight = Arc::clone(&inflight);
            let worker_cancel = Arc::clone(cancel);
            let repo = Arc::clone(repo);
            worker_handles.push(s.spawn(move || -> Result<()> {
                for record in scan_rx {
                    if worker_cancel.load(Ordering::Relaxed) {
                        return Err(PlakarError::Cancelled);
                    }
                    let output =
                        process_record(&repo, importer, &packer_tx, &inflight, record)?;
                    if out_tx.send(output).is_err() {
                        break;
                    }
                }
                Ok(())
            }));
        }
        drop(scan_rx);
        drop(out_tx);

        // Fan-in: collect entries and error records.
        for output in out_rx {
            match output {
                WorkerOutput::Entry {
                    path,
                    entry,
                    kind,
                    size,
                    xattrs: entry_xattrs,
                } => {
                    match kind {
                        EntryKind::File => {
                            files_count += 1;
                            total_size += size;
                        }
                        EntryKind::Directory => directories_count += 1,
                        EntryKind::Symlink => {}
                    }
                    for (name, value) in entry_xattrs {
                        xattrs.push((path.clone(), name, value));
                    }
                    entries.push((path, entry));
                }
                WorkerOutput::SoftError { path, message } => {
                    errors.push(ErrorRecord { path, message });
                }
            }
        }

        scanner
            .join()
            .map_err(|_| PlakarError::backend("scanner thread panicked"))??;
        for handle in worker_handles {
            handle
                .join()
                .map_err(|_| PlakarError::backend("worker thread panicked"))??;
        }
        Ok(())
    });

    if let Err(e) = pipeline_result {
        drop(packer_tx);
        let _ = packer_handle.join();
        return Err(e);
    }
    if cancel.load(Ordering::Relaxed) {
        drop(packer_tx);
        let _ = packer_handle.join();
        return Err(PlakarError::Cancelled);
    }

    // VFS build: insert path → entry-checksum in ascending order, then
    // freeze the tree, one VFS blob per node.
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut tree = BTree::new(MemoryNodeStore::new(), DEFAULT_ORDER)?;
    for (path, entry) in &entries {
        let entry_bytes = entry.to_bytes()?;
        let entry_csum = repo.checksum(&entry_bytes);
        submit_blob(
            repo,
            &packer_tx,
            &inflight,
            BlobType::VfsEntry,
            entry_csum,
            entry_bytes,
        )?;
        tree.insert(path.clone(), entry_csum)?;
    }
    let root: Checksum = tree.persist(&mut |node| {
        let node_bytes = vfs::encode_node(node)?;
        let node_csum = repo.checksum(&node_bytes);
        submit_blob(
            repo,
            &packer_tx,
            &inflight,
            BlobType::Vfs,
            node_csum,
            node_bytes,
        )?;
        Ok(node_csum)
    })?;

    // Xattr index: one DATA blob per value, one XATTR_ENTRY record per
    // attribute, frozen into a second B+tree keyed `path:name`.
    let xattr_root = if xattrs.is_empty() {
        None
    } else {
        // Sorted insertion keeps the frozen tree deterministic, so an
        // unchanged tree dedups its index nodes across runs.
        xattrs.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        let mut index = BTree::new(MemoryNodeStore::new(), DEFAULT_ORDER)?;
        for (path, name, value) in &xattrs {
            let data_csum = repo.checksum(value);
            submit_blob(
                repo,
                &packer_tx,
                &inflight,
                BlobType::Data,
                data_csum,
                value.clone(),
            )?;
            let record = XattrRecord {
                path: path.clone(),
                name: name.clone(),
                size: value.len() as u64,
                data: data_csum,
            };
            let record_bytes = record.to_bytes()?;
            let record_csum = repo.checksum(&record_bytes);
            submit_blob(
                repo,
                &packer_tx,
                &inflight,
                BlobType::XattrEntry,
                record_csum,
                record_bytes,
            )?;
            index.insert(vfs::xattr_key(path, name), record_csum)?;
        }
        let root: Checksum = index.persist(&mut |node| {
            let node_bytes = vfs::encode_node(node)?;
            let node_csum = repo.checksum(&node_bytes);
            submit_blob(
                repo,
                &packer_tx,
                &inflight,
                BlobType::Xattr,
                node_csum,
                node_bytes,
            )?;
            Ok(node_csum)
        })?;
        Some(root)
    };

    let errors_blob = if errors.is_empty() {
        None
    } else {
        let error_bytes = rmp_serde::to_vec(&errors)?;
        let error_csum = repo.checksum(&error_bytes);
        submit_blob(
            repo,
            &packer_tx,
            &inflight,
            BlobType::Error,
            error_csum,
            error_bytes,
        )?;
        Some(error_csum)
    };

    // Hand the packer back: all referenced blobs are now submitted.
    drop(packer_tx);
    let mut packer = packer_handle
        .join()
        .map_err(|_| PlakarError::backend("packer thread panicked"))??;

    let header = Header {
        identifier: Uuid::new_v4(),
        timestamp: started,
        root,
        hostname: platform::hostname(),
        username: platform::username(),
        tags: options.tags.clone(),
        importer_type: importer.kind().to_string(),
        importer_origin: importer.origin(),
        files_count,
        directories_count,
        size: total_size,
        errors: errors.len() as u64,
        errors_blob,
        xattr_root,
    };
    let header_bytes = header.to_bytes()?;
    let snapshot_id = repo.checksum(&header_bytes);

    // The SNAPSHOT blob is the last blob written; the state file naming it
    // comes after the packfiles are durable.
    packer.put_blob(BlobType::Snapshot, snapshot_id, &header_bytes)?;
    let deltas = packer.finish()?;
    repo.write_state(&deltas, &Metadata::new())?;

    info!(
        snapshot = %snapshot_id,
        files = files_count,
        directories = directories_count,
        size = total_size,
        errors = errors.len(),
        "snapshot committed"
    );
    Ok(snapshot_id)
}
