use std::process::ExitCode;

use plakar_core::error::Result;
use plakar_core::snapshot::backup::{backup, BackupOptions};
use plakar_core::snapshot::importer::new_importer;

use crate::repo;

#[allow(clippy::too_many_arguments)]
pub(crate) fn run(
    location: &str,
    directory: Option<&str>,
    tags: Vec<String>,
    mut excludes: Vec<String>,
    excludes_file: Option<&str>,
    concurrency: usize,
) -> Result<ExitCode> {
    let repository = repo::open_repository(location)?;

    if let Some(path) = excludes_file {
        for line in std::fs::read_to_string(path)?.lines() {
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                excludes.push(line.to_string());
            }
        }
    }

    let directory = match directory {
        Some(directory) => directory.to_string(),
        None => std::env::current_dir()?.to_string_lossy().into_owned(),
    };
    let importer = new_importer(&directory)?;

    let options = BackupOptions {
        tags,
        excludes,
        concurrency,
        ..Default::default()
    };
    let snapshot_id = backup(&repository, importer.as_ref(), &options)?;
    println!("{}", snapshot_id.to_hex());
    Ok(ExitCode::SUCCESS)
}
