use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use ignore::WalkBuilder;
#[cfg(unix)]
use tracing::warn;

use crate::error::{PlakarError, Result};
use crate::snapshot::vfs::{EntryKind, FileInfo};

/// One record emitted by an importer scan.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    /// Normalized absolute pathname within the snapshot namespace.
    pub pathname: String,
    pub kind: EntryKind,
    pub info: FileInfo,
    pub link_target: Option<String>,
    pub xattrs: Vec<(String, Vec<u8>)>,
}

/// Pluggable source of scan records and file contents.
pub trait Importer: Send + Sync {
    /// Scheme this importer was registered under.
    fn kind(&self) -> &str;
    /// Origin description recorded in the snapshot header.
    fn origin(&self) -> String;
    /// Lazily walk the source, emitting one record per filesystem node.
    fn scan(&self) -> Result<Box<dyn Iterator<Item = Result<ScanRecord>> + Send>>;
    /// Open one file's content by its scan pathname.
    fn open(&self, pathname: &str) -> Result<Box<dyn Read + Send>>;
}

type ImporterFactory = fn(&str) -> Result<Box<dyn Importer>>;

fn registry() -> &'static Mutex<HashMap<String, ImporterFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, ImporterFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn register_importer(scheme: &str, factory: ImporterFactory) {
    registry()
        .lock()
        .expect("importer registry lock")
        .insert(scheme.to_string(), factory);
}

pub fn register_default_importers() {
    register_importer("fs", |base| Ok(Box::new(FsImporter::new(base)?)));
}

/// Instantiate the importer registered for a location's scheme.
/// Bare paths resolve to the filesystem importer.
pub fn new_importer(location: &str) -> Result<Box<dyn Importer>> {
    let (scheme, path) = match location.split_once("://") {
        Some((scheme, path)) => (scheme.to_string(), path.to_string()),
        None => ("fs".to_string(), location.to_string()),
    };
    let factory = {
        let map = registry().lock().expect("importer registry lock");
        map.get(&scheme).copied()
    };
    match factory {
        Some(factory) => factory(&path),
        None => Err(PlakarError::Config(format!(
            "unsupported importer scheme: '{scheme}'"
        ))),
    }
}

/// Filesystem importer rooted at a directory.
pub struct FsImporter {
    base: PathBuf,
}

impl FsImporter {
    pub fn new(base: &str) -> Result<Self> {
        let base = std::fs::canonicalize(base)
            .map_err(|e| PlakarError::Config(format!("cannot import '{base}': {e}")))?;
        Ok(Self { base })
    }

    fn to_scan_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.base) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => format!("/{}", rel.to_string_lossy().replace('\\', "/")),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    fn record_for(&self, path: &Path) -> Result<ScanRecord> {
        let metadata = std::fs::symlink_metadata(path)?;
        let file_type = metadata.file_type();

        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::File
        };

        let link_target = if kind == EntryKind::Symlink {
            Some(
                std::fs::read_link(path)?
                    .to_string_lossy()
                    .into_owned(),
            )
        } else {
            None
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        #[cfg(unix)]
        let (mode, uid, gid, mtime_ns) = {
            use std::os::unix::fs::MetadataExt;
            (
                metadata.mode(),
                metadata.uid(),
                metadata.gid(),
                metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            )
        };
        #[cfg(not(unix))]
        let (mode, uid, gid, mtime_ns) = (0o644u32, 0u32, 0u32, 0i64);

        // Symlinks are skipped: the xattr calls would follow the link.
        let xattrs = if kind == EntryKind::Symlink {
            Vec::new()
        } else {
            read_path_xattrs(path)
        };

        Ok(ScanRecord {
            pathname: self.to_scan_path(path),
            kind,
            info: FileInfo {
                name,
                size: if kind == EntryKind::File {
                    metadata.len()
                } else {
                    0
                },
                mode,
                mtime_ns,
                uid,
                gid,
            },
            link_target,
            xattrs,
        })
    }
}

/// Read a path's extended attributes, sorted by name. Unreadable or
/// non-UTF8 attributes are skipped with a warning.
#[cfg(unix)]
fn read_path_xattrs(path: &Path) -> Vec<(String, Vec<u8>)> {
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) => {
            warn!(path = %path.display(), "failed to list extended attributes: {e}");
            return Vec::new();
        }
    };

    let mut attrs = Vec::new();
    for name in names {
        let Some(key) = name.to_str().map(str::to_string) else {
            warn!(path = %path.display(), attr = ?name, "skipping extended attribute with non-UTF8 name");
            continue;
        };
        match xattr::get(path, &name) {
            Ok(Some(value)) => attrs.push((key, value)),
            Ok(None) => {}
            Err(e) => {
                warn!(path = %path.display(), attr = %key, "failed to read extended attribute: {e}");
            }
        }
    }
    attrs.sort_by(|a, b| a.0.cmp(&b.0));
    attrs
}

#[cfg(not(unix))]
fn read_path_xattrs(_path: &Path) -> Vec<(String, Vec<u8>)> {
    Vec::new()
}

impl Importer for FsImporter {
    fn kind(&self) -> &str {
        "fs"
    }

    fn origin(&self) -> String {
        self.base.to_string_lossy().into_owned()
    }

    fn scan(&self) -> Result<Box<dyn Iterator<Item = Result<ScanRecord>> + Send>> {
        let base = self.base.clone();
        let importer = FsImporter { base: base.clone() };

        let mut walker = WalkBuilder::new(&base);
        walker
            .follow_links(false)
            .hidden(false)
            .ignore(false)
            .git_global(false)
            .git_ignore(false)
            .git_exclude(false)
            .parents(false)
            .sort_by_file_name(std::ffi::OsStr::cmp);

        let iter = walker.build().map(move |entry| match entry {
            Ok(entry) => importer.record_for(entry.path()),
            Err(e) => Err(PlakarError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            ))),
        });
        Ok(Box::new(iter))
    }

    fn open(&self, pathname: &str) -> Result<Box<dyn Read + Send>> {
        let rel = pathname.trim_start_matches('/');
        let path = if rel.is_empty() {
            self.base.clone()
        } else {
            self.base.join(rel)
        };
        Ok(Box::new(std::fs::File::open(path)?))
    }
}
