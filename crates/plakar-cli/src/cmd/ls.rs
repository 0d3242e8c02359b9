use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use plakar_core::error::Result;
use plakar_core::snapshot::vfs::EntryKind;
use plakar_core::snapshot::Snapshot;

use crate::repo;

fn format_time(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_mode(kind: EntryKind, mode: u32) -> String {
    let type_char = match kind {
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::File => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

pub(crate) fn run(location: &str, target: Option<&str>) -> Result<ExitCode> {
    let repository = repo::open_repository(location)?;

    let Some(target) = target else {
        // No argument: list snapshots.
        for snapshot_id in repository.snapshots()? {
            match Snapshot::load(Arc::clone(&repository), snapshot_id) {
                Ok(snapshot) => println!(
                    "{}  {}  {}@{}  {} files  {} bytes",
                    &snapshot_id.to_hex()[..16],
                    format_time(snapshot.header.timestamp),
                    snapshot.header.username,
                    snapshot.header.hostname,
                    snapshot.header.files_count,
                    snapshot.header.size,
                ),
                Err(e) => eprintln!("{}: {e}", snapshot_id.to_hex()),
            }
        }
        return Ok(ExitCode::SUCCESS);
    };

    let (prefix, path) = repo::split_target(target);
    let snapshot_id = repository.resolve_snapshot(prefix)?;
    let snapshot = Snapshot::load(Arc::clone(&repository), snapshot_id)?;
    let vfs = snapshot.vfs();

    for (entry_path, entry_csum) in vfs.entries_under(path)? {
        let entry = vfs.load_entry(&entry_csum)?;
        println!(
            "{} {:>12}  {}",
            format_mode(entry.kind, entry.info.mode),
            entry.info.size,
            entry_path,
        );
    }
    Ok(ExitCode::SUCCESS)
}
