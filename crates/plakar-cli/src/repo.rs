use std::io::{BufRead, Write};
use std::sync::Arc;

use plakar_core::caching::Manager;
use plakar_core::error::{PlakarError, Result};
use plakar_core::repository::Repository;
use plakar_core::storage;
use zeroize::Zeroizing;

/// Resolve the working repository: `--at` flag, then `$PLAKAR_REPOSITORY`,
/// then `$HOME/.plakar/store`.
pub(crate) fn resolve_location(flag: Option<&str>) -> String {
    if let Some(location) = flag {
        return location.to_string();
    }
    if let Ok(location) = std::env::var("PLAKAR_REPOSITORY") {
        if !location.is_empty() {
            return location;
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    format!("{home}/.plakar/store")
}

/// The repository passphrase: `$PLAKAR_PASSPHRASE`, else an interactive
/// prompt on the controlling terminal. Zeroized on drop.
pub(crate) fn passphrase(confirm: bool) -> Result<Zeroizing<String>> {
    if let Ok(passphrase) = std::env::var("PLAKAR_PASSPHRASE") {
        if !passphrase.is_empty() {
            return Ok(Zeroizing::new(passphrase));
        }
    }
    let first = prompt("passphrase: ")?;
    if confirm {
        let second = prompt("passphrase (again): ")?;
        if first != second {
            return Err(PlakarError::Usage("passphrases do not match".into()));
        }
    }
    Ok(first)
}

fn prompt(message: &str) -> Result<Zeroizing<String>> {
    eprint!("{message}");
    std::io::stderr().flush()?;
    let mut line = Zeroizing::new(String::new());
    std::io::stdin().lock().read_line(&mut line)?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    Ok(Zeroizing::new(trimmed.to_string()))
}

/// Open the working repository, prompting for a passphrase only when the
/// configuration requires one.
pub(crate) fn open_repository(location: &str) -> Result<Arc<Repository>> {
    let manager = Manager::new(Manager::default_dir());
    let store = storage::open_store(location)?;
    let env_pass = std::env::var("PLAKAR_PASSPHRASE")
        .ok()
        .filter(|p| !p.is_empty())
        .map(Zeroizing::new);

    match Repository::open(store, env_pass.as_ref().map(|p| p.as_str()), &manager) {
        Ok(repo) => Ok(Arc::new(repo)),
        Err(PlakarError::Config(message)) if message.contains("passphrase required") => {
            let pass = prompt("passphrase: ")?;
            let store = storage::open_store(location)?;
            Ok(Arc::new(Repository::open(store, Some(pass.as_str()), &manager)?))
        }
        Err(e) => Err(e),
    }
}

/// Split a `snapshot[:path]` argument into its id prefix and path.
pub(crate) fn split_target(target: &str) -> (&str, &str) {
    match target.split_once(':') {
        Some((snapshot, path)) => (snapshot, path),
        None => (target, "/"),
    }
}
