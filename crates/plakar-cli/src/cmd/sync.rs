use std::process::ExitCode;

use plakar_core::error::{PlakarError, Result};
use plakar_core::sync::{sync, Direction};

use crate::repo;

pub(crate) fn run(location: &str, args: &[String]) -> Result<ExitCode> {
    let (prefix, direction, peer_location) = match args {
        [direction, peer] => (None, direction.as_str(), peer.as_str()),
        [prefix, direction, peer] => (Some(prefix.as_str()), direction.as_str(), peer.as_str()),
        _ => {
            return Err(PlakarError::Usage(
                "sync expects: [snapshot] {to|from|with} REPOSITORY".into(),
            ))
        }
    };
    let direction = Direction::parse(direction).ok_or_else(|| {
        PlakarError::Usage("sync direction must be to, from or with".into())
    })?;

    let local = repo::open_repository(location)?;
    let peer = repo::open_repository(peer_location)?;

    let stats = sync(&local, &peer, prefix, direction)?;
    println!(
        "synchronized {} snapshots ({} failed)",
        stats.snapshots_synced, stats.snapshots_failed
    );
    Ok(if stats.snapshots_failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
