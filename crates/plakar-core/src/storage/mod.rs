pub mod fs;

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::{PlakarError, Result};
use crate::objects::Checksum;

/// Whether the backend accepts deletes. `NoDelete` stores reject removal;
/// the engine tolerates this by leaving superseded files in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    ReadWrite,
    NoDelete,
}

/// Opaque sink/source of immutable packfiles, mutable state files, and the
/// repository configuration document. All operations are atomic at the
/// file granularity and durable on return.
pub trait Store: Send + Sync {
    fn location(&self) -> &str;
    fn mode(&self) -> StoreMode;

    /// Write the configuration document. Only valid at creation time.
    fn put_configuration(&self, data: &[u8]) -> Result<()>;
    /// Read the configuration document.
    fn get_configuration(&self) -> Result<Vec<u8>>;

    fn put_packfile(&self, checksum: &Checksum, data: &[u8]) -> Result<()>;
    fn get_packfile(&self, checksum: &Checksum) -> Result<Vec<u8>>;
    /// Ranged read of a packfile region. The returned buffer contains
    /// exactly `length` bytes; a short read is an integrity error.
    fn get_packfile_range(&self, checksum: &Checksum, offset: u32, length: u32) -> Result<Vec<u8>>;
    fn list_packfiles(&self) -> Result<Vec<Checksum>>;
    fn delete_packfile(&self, checksum: &Checksum) -> Result<()>;

    fn put_state(&self, checksum: &Checksum, data: &[u8]) -> Result<()>;
    fn get_state(&self, checksum: &Checksum) -> Result<Vec<u8>>;
    fn list_states(&self) -> Result<Vec<Checksum>>;
    fn delete_state(&self, checksum: &Checksum) -> Result<()>;
}

type StoreFactory = fn(&str) -> Result<Box<dyn Store>>;

fn registry() -> &'static Mutex<HashMap<String, StoreFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, StoreFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a storage backend factory for a URI scheme.
pub fn register_backend(scheme: &str, factory: StoreFactory) {
    registry()
        .lock()
        .expect("backend registry lock")
        .insert(scheme.to_string(), factory);
}

/// Register the in-tree backends. Called once at program start; replaces
/// package-initialization magic with explicit registration.
pub fn register_default_backends() {
    register_backend("fs", |path| Ok(Box::new(fs::FsStore::new(path))));
}

/// Split a repository location into `(scheme, path)`.
/// Bare paths resolve to the `fs` scheme.
pub fn parse_location(location: &str) -> Result<(String, String)> {
    let trimmed = location.trim();
    if trimmed.is_empty() {
        return Err(PlakarError::Config(
            "repository location must not be empty".into(),
        ));
    }
    match trimmed.split_once("://") {
        None => Ok(("fs".to_string(), trimmed.to_string())),
        Some(("fs", path)) => Ok(("fs".to_string(), path.to_string())),
        Some((scheme, _)) => {
            let url = url::Url::parse(trimmed).map_err(|e| {
                PlakarError::Config(format!("invalid repository location '{trimmed}': {e}"))
            })?;
            let mut path = String::new();
            if let Some(host) = url.host_str() {
                path.push_str(host);
                if let Some(port) = url.port() {
                    path.push_str(&format!(":{port}"));
                }
            }
            path.push_str(url.path());
            Ok((scheme.to_string(), path))
        }
    }
}

/// Instantiate the backend registered for the location's scheme.
pub fn open_store(location: &str) -> Result<Box<dyn Store>> {
    let (scheme, path) = parse_location(location)?;
    let factory = {
        let map = registry().lock().expect("backend registry lock");
        map.get(&scheme).copied()
    };
    match factory {
        Some(factory) => factory(&path),
        None => Err(PlakarError::Config(format!(
            "unsupported storage backend scheme: '{scheme}'"
        ))),
    }
}
