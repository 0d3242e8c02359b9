pub mod packer;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::caching::{Manager, StateCache};
use crate::chunker::ChunkerOptions;
use crate::codec::BlobCodec;
use crate::compress::CompressionAlgorithm;
use crate::crypto::key::{MasterKey, SealedKey};
use crate::crypto::{Aes256GcmEngine, CryptoEngine, PlaintextEngine};
use crate::error::{PlakarError, Result};
use crate::objects::{Checksum, Hasher, HashingAlgorithm};
use crate::packfile::BlobType;
use crate::state::{DeltaEntry, LocalState, Metadata};
use crate::storage::{Store, StoreMode};

use self::packer::Packer;

pub const REPOSITORY_VERSION: u32 = 100;

/// Immutable configuration document written at repository creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub repository_id: Uuid,
    pub version: u32,
    pub chunking: ChunkerOptions,
    pub compression: CompressionAlgorithm,
    pub hashing: HashingAlgorithm,
    pub encryption: Option<SealedKey>,
}

impl RepositoryConfig {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Options for `Repository::create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub chunking: ChunkerOptions,
    pub compression: CompressionAlgorithm,
    pub hashing: HashingAlgorithm,
}

/// Glue between storage, the local state, and the crypto layers.
///
/// All methods take `&self`: after `open` the repository is immutable glue
/// and can be shared across worker threads behind an `Arc`.
pub struct Repository {
    store: Arc<dyn Store>,
    config: RepositoryConfig,
    codec: BlobCodec,
    state: LocalState,
}

impl Repository {
    /// Create a new repository on a store, write its configuration
    /// document, and open it.
    pub fn create(
        store: Box<dyn Store>,
        options: CreateOptions,
        passphrase: Option<&str>,
        cache: &Manager,
    ) -> Result<Self> {
        options.chunking.validate()?;

        let repository_id = Uuid::new_v4();
        let (crypto, mac_key, sealed): (Arc<dyn CryptoEngine>, [u8; 32], Option<SealedKey>) =
            match passphrase {
                Some(passphrase) => {
                    let master = MasterKey::generate();
                    let sealed = master.seal(passphrase)?;
                    let engine = Aes256GcmEngine::new(&master.encryption_key);
                    (Arc::new(engine), master.mac_key, Some(sealed))
                }
                None => (
                    Arc::new(PlaintextEngine),
                    derive_plaintext_mac_key(&repository_id),
                    None,
                ),
            };

        let config = RepositoryConfig {
            repository_id,
            version: REPOSITORY_VERSION,
            chunking: options.chunking,
            compression: options.compression,
            hashing: options.hashing,
            encryption: sealed,
        };
        store.put_configuration(&config.to_bytes()?)?;
        info!(repository_id = %repository_id, location = store.location(), "created repository");

        let codec = BlobCodec::new(config.compression, config.hashing, mac_key, crypto);
        let state_cache = Arc::new(cache.repository_cache(repository_id)?);
        let state = LocalState::new(state_cache);

        Ok(Self {
            store: Arc::from(store),
            config,
            codec,
            state,
        })
    }

    /// Open an existing repository: read the configuration, unseal the key,
    /// then merge outstanding state files into the local cache.
    pub fn open(store: Box<dyn Store>, passphrase: Option<&str>, cache: &Manager) -> Result<Self> {
        let config = RepositoryConfig::from_bytes(&store.get_configuration()?)?;
        if config.version != REPOSITORY_VERSION {
            return Err(PlakarError::Config(format!(
                "unsupported repository version: {}",
                config.version
            )));
        }
        config.chunking.validate()?;

        let (crypto, mac_key): (Arc<dyn CryptoEngine>, [u8; 32]) = match &config.encryption {
            Some(sealed) => {
                let passphrase = passphrase.ok_or_else(|| {
                    PlakarError::Config("passphrase required for encrypted repository".into())
                })?;
                let master = MasterKey::unseal(sealed, passphrase)?;
                (
                    Arc::new(Aes256GcmEngine::new(&master.encryption_key)),
                    master.mac_key,
                )
            }
            None => (
                Arc::new(PlaintextEngine),
                derive_plaintext_mac_key(&config.repository_id),
            ),
        };

        let codec = BlobCodec::new(config.compression, config.hashing, mac_key, crypto);
        let state_cache = Arc::new(cache.repository_cache(config.repository_id)?);
        let state = LocalState::new(state_cache);

        let repo = Self {
            store: Arc::from(store),
            config,
            codec,
            state,
        };
        repo.merge_states()?;
        Ok(repo)
    }

    pub fn configuration(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn location(&self) -> &str {
        self.store.location()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn codec(&self) -> &BlobCodec {
        &self.codec
    }

    pub fn state(&self) -> &LocalState {
        &self.state
    }

    /// Keyed MAC of a byte string: the content address it would have.
    pub fn checksum(&self, data: &[u8]) -> Checksum {
        self.codec.checksum(data)
    }

    /// Incremental hasher keyed with the repository MAC key (file digests).
    pub fn hasher(&self) -> Hasher {
        self.codec.hasher()
    }

    /// Pure cache lookup; never touches the backend.
    pub fn blob_exists(&self, blob_type: BlobType, csum: &Checksum) -> bool {
        self.state.blob_exists(blob_type, csum)
    }

    /// Resolve the blob through the state, fetch its packfile region,
    /// decode, and verify the plaintext checksum.
    pub fn get_blob(&self, blob_type: BlobType, csum: &Checksum) -> Result<Vec<u8>> {
        let location = self
            .state
            .get_location(blob_type, csum)?
            .ok_or_else(|| {
                PlakarError::NotFound(format!("{} blob {csum}", blob_type.as_str()))
            })?;
        let region = self.store.get_packfile_range(
            &location.packfile,
            location.offset,
            location.length,
        )?;
        self.codec.decode_verified(blob_type, csum, &region)
    }

    /// A fresh packer routing flushed packfiles to this repository's store
    /// and recording delta entries in its cache.
    pub fn new_packer(&self) -> Packer {
        Packer::new(
            Arc::clone(&self.store),
            self.codec.clone(),
            Arc::clone(self.state.cache()),
        )
    }

    /// Committed snapshot ids, ordered by checksum.
    pub fn snapshots(&self) -> Result<Vec<Checksum>> {
        self.state.list_snapshots()
    }

    /// Resolve a snapshot id from a unique hex prefix.
    pub fn resolve_snapshot(&self, prefix: &str) -> Result<Checksum> {
        let matches: Vec<Checksum> = self
            .snapshots()?
            .into_iter()
            .filter(|id| id.to_hex().starts_with(prefix))
            .collect();
        match matches.len() {
            0 => Err(PlakarError::NotFound(format!("snapshot: {prefix}"))),
            1 => Ok(matches[0]),
            n => Err(PlakarError::Usage(format!(
                "snapshot prefix '{prefix}' is ambiguous ({n} matches)"
            ))),
        }
    }

    /// Write a state file containing `entries`, identified by the checksum
    /// of its serialized plaintext. Called by the snapshot commit with the
    /// deltas produced during the run.
    pub fn write_state(&self, entries: &[DeltaEntry], metadata: &Metadata) -> Result<Checksum> {
        let mut plaintext = Vec::new();
        crate::state::serialize_to_stream(&mut plaintext, entries.iter(), metadata)?;
        let state_id = self.codec.checksum(&plaintext);

        let encoded = self.codec.encode_state(&plaintext)?;
        self.store.put_state(&state_id, &encoded)?;
        self.state.cache().put_state(&state_id, &metadata.to_bytes()?)?;
        debug!(state_id = %state_id, entries = entries.len(), "wrote state file");
        Ok(state_id)
    }

    /// Merge every state file in the backend into the local cache, then
    /// publish a fresh aggregate when more than one state exists.
    /// Superseded states are deleted only after the aggregate is durable.
    fn merge_states(&self) -> Result<()> {
        let state_ids = self.store.list_states()?;
        for state_id in &state_ids {
            if self.state.has_state(state_id)? {
                continue;
            }
            let raw = self.store.get_state(state_id)?;
            let plaintext = self.codec.decode_state(&raw)?;
            self.state.insert_state(*state_id, &mut &plaintext[..])?;
            debug!(state_id = %state_id, "merged state file");
        }

        if state_ids.len() > 1 && !self.aggregate_covers_all(&state_ids)? {
            self.publish_aggregate(&state_ids)?;
        }
        Ok(())
    }

    /// Whether one of `state_ids` is an aggregate whose `extends` set
    /// already covers every other state present. Keeps `NoDelete` stores
    /// from growing a new aggregate on every open.
    fn aggregate_covers_all(&self, state_ids: &[Checksum]) -> Result<bool> {
        for state_id in state_ids {
            let Some(metadata) = self.state.state_metadata(state_id)? else {
                continue;
            };
            if !metadata.aggregate {
                continue;
            }
            let covered: std::collections::HashSet<&Checksum> = metadata.extends.iter().collect();
            if state_ids
                .iter()
                .all(|other| other == state_id || covered.contains(other))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Write an aggregate state extending `absorbed`, then delete the
    /// absorbed states (skipped when the backend rejects deletes).
    fn publish_aggregate(&self, absorbed: &[Checksum]) -> Result<()> {
        let metadata = Metadata {
            aggregate: true,
            extends: absorbed.to_vec(),
            ..Metadata::new()
        };

        let mut plaintext = Vec::new();
        self.state.serialize_all(&mut plaintext, &metadata)?;
        let aggregate_id = self.codec.checksum(&plaintext);
        if self.store.list_states()?.contains(&aggregate_id) {
            return Ok(());
        }

        let encoded = self.codec.encode_state(&plaintext)?;
        self.store.put_state(&aggregate_id, &encoded)?;
        self.state
            .cache()
            .put_state(&aggregate_id, &metadata.to_bytes()?)?;
        info!(aggregate = %aggregate_id, absorbed = absorbed.len(), "published aggregate state");

        if self.store.mode() == StoreMode::NoDelete {
            debug!("backend rejects deletes, leaving superseded states in place");
            return Ok(());
        }
        for old in absorbed {
            if *old == aggregate_id {
                continue;
            }
            if let Err(e) = self.store.delete_state(old) {
                warn!(state_id = %old, "could not delete superseded state: {e}");
                continue;
            }
            self.state.del_state(old)?;
        }
        Ok(())
    }

    /// Drop a snapshot reference and republish the state without it.
    /// The snapshot's blobs become orphans; space reclamation is a separate
    /// administrative operation.
    pub fn remove_snapshot(&self, snapshot_id: &Checksum) -> Result<()> {
        if !self.blob_exists(BlobType::Snapshot, snapshot_id) {
            return Err(PlakarError::NotFound(format!("snapshot: {snapshot_id}")));
        }
        self.state.del_delta(BlobType::Snapshot, snapshot_id)?;

        let absorbed = self.store.list_states()?;
        self.publish_aggregate(&absorbed)?;
        info!(snapshot = %snapshot_id, "removed snapshot");
        Ok(())
    }
}

/// Unencrypted repositories still need a MAC key for content addressing;
/// derive it from the repository id so checksums are stable per repository.
fn derive_plaintext_mac_key(repository_id: &Uuid) -> [u8; 32] {
    let digest = Sha256::digest(repository_id.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}
