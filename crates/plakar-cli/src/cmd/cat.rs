use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use plakar_core::error::{PlakarError, Result};
use plakar_core::snapshot::Snapshot;

use crate::repo;

pub(crate) fn run(location: &str, target: &str) -> Result<ExitCode> {
    let Some((prefix, path)) = target.split_once(':') else {
        return Err(PlakarError::Usage(
            "cat expects snapshot:path".into(),
        ));
    };

    let repository = repo::open_repository(location)?;
    let snapshot_id = repository.resolve_snapshot(prefix)?;
    let snapshot = Snapshot::load(Arc::clone(&repository), snapshot_id)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    snapshot.read_file_to(path, &mut out)?;
    out.flush()?;
    Ok(ExitCode::SUCCESS)
}
