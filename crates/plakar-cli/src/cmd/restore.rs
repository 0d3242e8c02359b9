use std::process::ExitCode;
use std::sync::Arc;

use plakar_core::error::Result;
use plakar_core::snapshot::exporter::new_exporter;
use plakar_core::snapshot::restore::{restore, RestoreOptions};
use plakar_core::snapshot::Snapshot;

use crate::repo;

pub(crate) fn run(location: &str, target: &str, to: &str, rebase: bool) -> Result<ExitCode> {
    let (prefix, path) = repo::split_target(target);

    let repository = repo::open_repository(location)?;
    let snapshot_id = repository.resolve_snapshot(prefix)?;
    let snapshot = Snapshot::load(Arc::clone(&repository), snapshot_id)?;

    let mut exporter = new_exporter(to)?;
    let summary = restore(
        &snapshot,
        exporter.as_mut(),
        &RestoreOptions {
            subtree: path.to_string(),
            rebase,
        },
    )?;
    println!(
        "restored {} files, {} directories, {} symlinks to {to}",
        summary.files, summary.directories, summary.symlinks
    );
    Ok(ExitCode::SUCCESS)
}
