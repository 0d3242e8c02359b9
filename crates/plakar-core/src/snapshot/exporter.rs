use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use crate::error::{PlakarError, Result};
use crate::platform;
use crate::snapshot::vfs::FileInfo;

/// Pluggable sink consumed by restore: directories are created before
/// their children, file contents are streamed, and permissions are applied
/// after contents so read-only modes do not block writes.
pub trait Exporter: Send {
    fn root(&self) -> &str;
    fn create_directory(&mut self, pathname: &str) -> Result<()>;
    fn store_file(&mut self, pathname: &str, reader: &mut dyn Read) -> Result<()>;
    fn create_symlink(&mut self, pathname: &str, target: &str) -> Result<()>;
    fn set_permissions(&mut self, pathname: &str, info: &FileInfo) -> Result<()>;
    fn set_xattr(&mut self, pathname: &str, name: &str, value: &[u8]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

type ExporterFactory = fn(&str) -> Result<Box<dyn Exporter>>;

fn registry() -> &'static Mutex<HashMap<String, ExporterFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, ExporterFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn register_exporter(scheme: &str, factory: ExporterFactory) {
    registry()
        .lock()
        .expect("exporter registry lock")
        .insert(scheme.to_string(), factory);
}

pub fn register_default_exporters() {
    register_exporter("fs", |base| Ok(Box::new(FsExporter::new(base))));
}

pub fn new_exporter(location: &str) -> Result<Box<dyn Exporter>> {
    let (scheme, path) = match location.split_once("://") {
        Some((scheme, path)) => (scheme.to_string(), path.to_string()),
        None => ("fs".to_string(), location.to_string()),
    };
    let factory = {
        let map = registry().lock().expect("exporter registry lock");
        map.get(&scheme).copied()
    };
    match factory {
        Some(factory) => factory(&path),
        None => Err(PlakarError::Config(format!(
            "unsupported exporter scheme: '{scheme}'"
        ))),
    }
}

/// Filesystem exporter rooted at a destination directory.
pub struct FsExporter {
    base: PathBuf,
    location: String,
}

impl FsExporter {
    pub fn new(base: &str) -> Self {
        Self {
            base: PathBuf::from(base),
            location: base.to_string(),
        }
    }

    fn resolve(&self, pathname: &str) -> PathBuf {
        let rel = pathname.trim_start_matches('/');
        if rel.is_empty() {
            self.base.clone()
        } else {
            self.base.join(rel)
        }
    }
}

impl Exporter for FsExporter {
    fn root(&self) -> &str {
        &self.location
    }

    fn create_directory(&mut self, pathname: &str) -> Result<()> {
        std::fs::create_dir_all(self.resolve(pathname))?;
        Ok(())
    }

    fn store_file(&mut self, pathname: &str, reader: &mut dyn Read) -> Result<()> {
        let dest = self.resolve(pathname);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&dest)?;
        std::io::copy(reader, &mut file)?;
        Ok(())
    }

    fn create_symlink(&mut self, pathname: &str, target: &str) -> Result<()> {
        let dest = self.resolve(pathname);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        #[cfg(unix)]
        {
            match std::os::unix::fs::symlink(target, &dest) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::fs::remove_file(&dest)?;
                    std::os::unix::fs::symlink(target, &dest)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = target;
        }
        Ok(())
    }

    fn set_permissions(&mut self, pathname: &str, info: &FileInfo) -> Result<()> {
        let dest = self.resolve(pathname);
        set_mode(&dest, info.mode)?;
        platform::set_file_mtime(&dest, info.mtime_ns)?;
        Ok(())
    }

    fn set_xattr(&mut self, pathname: &str, name: &str, value: &[u8]) -> Result<()> {
        let dest = self.resolve(pathname);
        #[cfg(unix)]
        if let Err(e) = xattr::set(&dest, name, value) {
            // Many filesystems restrict xattr namespaces; a failed restore
            // of one attribute should not abort the run.
            tracing::warn!(
                path = %dest.display(),
                attr = %name,
                "failed to restore extended attribute: {e}"
            );
        }
        #[cfg(not(unix))]
        {
            let _ = (dest, name, value);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_creates_parents_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = FsExporter::new(dir.path().to_str().unwrap());
        exporter
            .store_file("/sub/deep/f.txt", &mut &b"data"[..])
            .unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("sub/deep/f.txt")).unwrap(),
            b"data"
        );
    }

    #[cfg(unix)]
    #[test]
    fn permissions_and_mtime_applied() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let mut exporter = FsExporter::new(dir.path().to_str().unwrap());
        exporter.store_file("/f.txt", &mut &b"x"[..]).unwrap();
        exporter
            .set_permissions(
                "/f.txt",
                &FileInfo {
                    name: "f.txt".into(),
                    size: 1,
                    mode: 0o600,
                    mtime_ns: 1_600_000_000_000_000_000,
                    uid: 0,
                    gid: 0,
                },
            )
            .unwrap();

        let meta = std::fs::metadata(dir.path().join("f.txt")).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o600);
        assert_eq!(meta.mtime(), 1_600_000_000);
    }
}
