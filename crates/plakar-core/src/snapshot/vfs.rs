use serde::{Deserialize, Serialize};

use crate::btree::{BTree, Node, NodeStore, DEFAULT_ORDER};
use crate::error::{PlakarError, Result};
use crate::objects::Checksum;
use crate::packfile::BlobType;
use crate::repository::Repository;

/// Stat summary carried by every VFS entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime_ns: i64,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One filesystem node, stored as a `VFS_ENTRY` blob and referenced from
/// the snapshot's path-keyed B+tree. Extended attributes live in the
/// snapshot's separate xattr index, not inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfsEntry {
    pub kind: EntryKind,
    pub path: String,
    pub info: FileInfo,
    /// For regular files: the OBJECT blob describing the content.
    #[serde(default)]
    pub object: Option<Checksum>,
    /// For symlinks: the target.
    #[serde(default)]
    pub link_target: Option<String>,
}

impl VfsEntry {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// A VFS B+tree node serialized as a `VFS` blob: keyed by pathname, mapping
/// to `VFS_ENTRY` checksums, with child pointers being blob checksums.
pub type VfsNode = Node<String, Checksum, Checksum>;

pub fn encode_node(node: &VfsNode) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(node)?)
}

pub fn decode_node(data: &[u8]) -> Result<VfsNode> {
    Ok(rmp_serde::from_slice(data)?)
}

/// One extended attribute, stored as an `XATTR_ENTRY` blob. The value
/// bytes live in a `DATA` blob of their own (kernel-bounded, so never
/// chunked).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XattrRecord {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub data: Checksum,
}

impl XattrRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Key of an xattr in the xattr index: `path:name`, with `:` and `\`
/// escaped in the attribute name so keys stay unambiguous per path.
pub fn xattr_key(path: &str, name: &str) -> String {
    let mut key = String::with_capacity(path.len() + 1 + name.len());
    key.push_str(path);
    key.push(':');
    for c in name.chars() {
        if c == ':' || c == '\\' {
            key.push('\\');
        }
        key.push(c);
    }
    key
}

/// Read-only node store resolving pointers through the repository.
/// The blob type distinguishes VFS nodes from xattr-index nodes.
pub struct BlobNodeStore<'a> {
    repo: &'a Repository,
    blob_type: BlobType,
}

impl NodeStore<String, Checksum, Checksum> for BlobNodeStore<'_> {
    fn get(&self, ptr: &Checksum) -> Result<VfsNode> {
        decode_node(&self.repo.get_blob(self.blob_type, ptr)?)
    }

    fn update(&mut self, _ptr: &Checksum, _node: VfsNode) -> Result<()> {
        Err(PlakarError::Usage("committed trees are read-only".into()))
    }

    fn put(&mut self, _node: VfsNode) -> Result<Checksum> {
        Err(PlakarError::Usage("committed trees are read-only".into()))
    }
}

/// Navigable view over a committed snapshot's filesystem.
pub struct Vfs<'a> {
    repo: &'a Repository,
    tree: BTree<String, Checksum, Checksum, BlobNodeStore<'a>>,
}

impl<'a> Vfs<'a> {
    pub fn open(repo: &'a Repository, root: Checksum) -> Self {
        let store = BlobNodeStore {
            repo,
            blob_type: BlobType::Vfs,
        };
        let tree = BTree::from_root(store, root, DEFAULT_ORDER);
        Self { repo, tree }
    }

    pub fn root(&self) -> &Checksum {
        self.tree.root()
    }

    /// Look up a single path.
    pub fn get(&self, path: &str) -> Result<Option<VfsEntry>> {
        let Some(entry_csum) = self.tree.find(&normalize_path(path))? else {
            return Ok(None);
        };
        let entry = VfsEntry::from_bytes(&self.repo.get_blob(BlobType::VfsEntry, &entry_csum)?)?;
        Ok(Some(entry))
    }

    /// All `(path, entry checksum)` pairs in ascending path order.
    pub fn entries(&self) -> Result<Vec<(String, Checksum)>> {
        self.tree.scan_all()?.collect()
    }

    /// Entries under a subtree prefix, ascending. The prefix itself is
    /// included when present.
    pub fn entries_under(&self, prefix: &str) -> Result<Vec<(String, Checksum)>> {
        let prefix = normalize_path(prefix);
        let mut out = Vec::new();
        for item in self.tree.scan_from(&prefix)? {
            let (path, csum) = item?;
            // Siblings like `<prefix>.txt` sort between the prefix and its
            // descendants; skip them, stop once past the prefix range.
            if prefix != "/" && !path.starts_with(prefix.as_str()) {
                break;
            }
            if !is_under(&prefix, &path) {
                continue;
            }
            out.push((path, csum));
        }
        Ok(out)
    }

    /// Resolve an entry checksum to the full record.
    pub fn load_entry(&self, entry_csum: &Checksum) -> Result<VfsEntry> {
        VfsEntry::from_bytes(&self.repo.get_blob(BlobType::VfsEntry, entry_csum)?)
    }

    /// Visit every tree node with its blob checksum (pre-order).
    pub fn visit_nodes<F>(&self, cb: F) -> Result<()>
    where
        F: FnMut(&Checksum, &VfsNode) -> Result<()>,
    {
        self.tree.visit_dfs(cb)
    }
}

/// Navigable view over a snapshot's xattr index: a second B+tree keyed by
/// `path:name`, mapping to `XATTR_ENTRY` checksums, its nodes stored as
/// `XATTR` blobs.
pub struct XattrIndex<'a> {
    repo: &'a Repository,
    tree: BTree<String, Checksum, Checksum, BlobNodeStore<'a>>,
}

impl<'a> XattrIndex<'a> {
    pub fn open(repo: &'a Repository, root: Checksum) -> Self {
        let store = BlobNodeStore {
            repo,
            blob_type: BlobType::Xattr,
        };
        let tree = BTree::from_root(store, root, DEFAULT_ORDER);
        Self { repo, tree }
    }

    pub fn root(&self) -> &Checksum {
        self.tree.root()
    }

    /// All `(key, record checksum)` pairs in ascending key order.
    pub fn entries(&self) -> Result<Vec<(String, Checksum)>> {
        self.tree.scan_all()?.collect()
    }

    pub fn load_record(&self, record_csum: &Checksum) -> Result<XattrRecord> {
        XattrRecord::from_bytes(&self.repo.get_blob(BlobType::XattrEntry, record_csum)?)
    }

    /// Visit every index node with its blob checksum (pre-order).
    pub fn visit_nodes<F>(&self, cb: F) -> Result<()>
    where
        F: FnMut(&Checksum, &VfsNode) -> Result<()>,
    {
        self.tree.visit_dfs(cb)
    }
}

/// Normalize to an absolute, `/`-separated path with no trailing slash.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Whether `path` equals `prefix` or lies beneath it.
pub fn is_under(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}
