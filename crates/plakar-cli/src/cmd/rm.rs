use std::process::ExitCode;

use plakar_core::error::{PlakarError, Result};

use crate::repo;

pub(crate) fn run(location: &str, snapshots: &[String]) -> Result<ExitCode> {
    if snapshots.is_empty() {
        return Err(PlakarError::Usage("rm expects at least one snapshot".into()));
    }

    let repository = repo::open_repository(location)?;
    let mut failures = 0u32;
    for prefix in snapshots {
        match repository
            .resolve_snapshot(prefix)
            .and_then(|id| repository.remove_snapshot(&id).map(|()| id))
        {
            Ok(id) => println!("removed {}", id.to_hex()),
            Err(e) => {
                eprintln!("{prefix}: {e}");
                failures += 1;
            }
        }
    }
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
