use std::process::ExitCode;
use std::sync::Arc;

use plakar_core::error::Result;
use plakar_core::packfile::BlobType;
use plakar_core::snapshot::Snapshot;

use crate::repo;

pub(crate) fn run(location: &str, snapshot: Option<&str>) -> Result<ExitCode> {
    let repository = repo::open_repository(location)?;

    match snapshot {
        None => {
            let config = repository.configuration();
            println!("Location:    {}", repository.location());
            println!("Repository:  {}", config.repository_id);
            println!("Version:     {}", config.version);
            println!("Hashing:     {}", config.hashing.as_str());
            println!("Compression: {}", config.compression.as_str());
            println!(
                "Encryption:  {}",
                if config.encryption.is_some() {
                    "aes256-gcm"
                } else {
                    "none"
                }
            );
            println!(
                "Chunking:    min {} / normal {} / max {}",
                config.chunking.min_size, config.chunking.normal_size, config.chunking.max_size
            );
            println!("Snapshots:   {}", repository.snapshots()?.len());
            println!(
                "Chunks:      {}",
                repository.state().list_by_type(BlobType::Chunk)?.len()
            );
            println!("Packfiles:   {}", repository.store().list_packfiles()?.len());
            println!("States:      {}", repository.store().list_states()?.len());
        }
        Some(prefix) => {
            let snapshot_id = repository.resolve_snapshot(prefix)?;
            let snapshot = Snapshot::load(Arc::clone(&repository), snapshot_id)?;
            let header = &snapshot.header;
            println!("Snapshot:    {}", snapshot_id.to_hex());
            println!("Identifier:  {}", header.identifier);
            println!("Created:     {}", header.timestamp);
            println!("Owner:       {}@{}", header.username, header.hostname);
            println!("Source:      {}://{}", header.importer_type, header.importer_origin);
            if !header.tags.is_empty() {
                println!("Tags:        {}", header.tags.join(", "));
            }
            println!("Files:       {}", header.files_count);
            println!("Directories: {}", header.directories_count);
            println!("Size:        {} bytes", header.size);
            if header.errors > 0 {
                println!("Errors:      {}", header.errors);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
