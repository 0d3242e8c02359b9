use std::process::ExitCode;

use plakar_core::caching::Manager;
use plakar_core::chunker::ChunkerOptions;
use plakar_core::compress::CompressionAlgorithm;
use plakar_core::error::Result;
use plakar_core::objects::HashingAlgorithm;
use plakar_core::repository::{CreateOptions, Repository};
use plakar_core::storage;

use crate::repo;

pub(crate) fn run(
    location: &str,
    hashing: &str,
    compression: &str,
    plaintext: bool,
) -> Result<ExitCode> {
    let options = CreateOptions {
        chunking: ChunkerOptions::default(),
        compression: CompressionAlgorithm::parse(compression)?,
        hashing: HashingAlgorithm::parse(hashing)?,
    };

    let passphrase = if plaintext {
        None
    } else {
        Some(repo::passphrase(true)?)
    };

    let store = storage::open_store(location)?;
    let manager = Manager::new(Manager::default_dir());
    let repository = Repository::create(
        store,
        options,
        passphrase.as_ref().map(|p| p.as_str()),
        &manager,
    )?;
    println!(
        "created repository {} at {location}",
        repository.configuration().repository_id
    );
    Ok(ExitCode::SUCCESS)
}
