use std::process::ExitCode;

use plakar_core::error::Result;
use plakar_core::snapshot::check::check;

use crate::repo;

pub(crate) fn run(location: &str, fast: bool, snapshot: Option<&str>) -> Result<ExitCode> {
    let repository = repo::open_repository(location)?;

    let snapshot_id = match snapshot {
        Some(prefix) => Some(repository.resolve_snapshot(prefix)?),
        None => None,
    };

    let report = check(&repository, snapshot_id.as_ref(), fast)?;
    for error in &report.errors {
        eprintln!("{}: {}", error.context, error.message);
    }
    println!(
        "checked {} snapshots, {} blobs: {}",
        report.snapshots_checked,
        report.blobs_checked,
        if report.is_ok() {
            "ok".to_string()
        } else {
            format!("{} errors", report.errors.len())
        }
    );
    Ok(if report.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
