//! Registry and stake-pointer caches using Sled
//!
//! Each registry is stored as one record tagged with a per-kind magic
//! string and the network magic. A record written for another kind or
//! another network is refused; the registry then starts empty and refills
//! through gossip.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::crypto::Hash;
use crate::node::{NodeType, Registry, RegistryState};
use crate::staking::UsedPointers;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Cache magic mismatch: expected {expected}, found {found}")]
    MagicMismatch { expected: String, found: String },
    #[error("Cache written for another network")]
    NetworkMismatch,
}

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    magic: String,
    network_magic: [u8; 4],
    state: RegistryState,
}

fn cache_magic(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::Masternode => "magicMasternodeCache",
        NodeType::Systemnode => "magicSystemnodeCache",
    }
}

#[derive(Debug, Clone)]
pub struct NodeCache {
    db: Db,
    registries: Tree,
    used_pointers: Tree,
}

impl NodeCache {
    /// Open or create the cache database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory cache removed on drop
    pub fn temporary() -> Result<Self, CacheError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, CacheError> {
        let registries = db.open_tree("registries")?;
        let used_pointers = db.open_tree("used_stake_pointers")?;
        Ok(Self {
            db,
            registries,
            used_pointers,
        })
    }

    pub fn dump_registry(&self, registry: &Registry) -> Result<(), CacheError> {
        let node_type = registry.node_type();
        let record = CacheRecord {
            magic: cache_magic(node_type).to_string(),
            network_magic: registry.params().magic,
            state: registry.snapshot(),
        };
        let count = record.state.nodes.len();
        self.registries
            .insert(node_type.name(), bincode::serialize(&record)?)?;
        self.db.flush()?;
        info!("Wrote {} cache: {} nodes", node_type, count);
        Ok(())
    }

    /// Restore a registry. Returns false if no cache exists.
    pub fn load_registry(&self, registry: &Registry) -> Result<bool, CacheError> {
        let node_type = registry.node_type();
        let bytes = match self.registries.get(node_type.name())? {
            Some(bytes) => bytes,
            None => return Ok(false),
        };

        let record: CacheRecord = bincode::deserialize(&bytes)?;
        let expected = cache_magic(node_type);
        if record.magic != expected {
            return Err(CacheError::MagicMismatch {
                expected: expected.to_string(),
                found: record.magic,
            });
        }
        if record.network_magic != registry.params().magic {
            return Err(CacheError::NetworkMismatch);
        }

        info!("Loaded {} cache: {} nodes", node_type, record.state.nodes.len());
        registry.restore(record.state);
        Ok(true)
    }

    pub fn dump_used_pointers(&self, used: &UsedPointers) -> Result<(), CacheError> {
        self.used_pointers.clear()?;
        for hash in used.snapshot() {
            self.used_pointers.insert(hash.0, &[])?;
        }
        self.db.flush()?;
        Ok(())
    }

    pub fn load_used_pointers(&self, used: &UsedPointers) -> Result<usize, CacheError> {
        let mut hashes = Vec::new();
        for item in self.used_pointers.iter() {
            let (key, _) = item?;
            if key.len() != 32 {
                continue;
            }
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&key);
            hashes.push(Hash(bytes));
        }
        let count = hashes.len();
        used.restore(hashes);
        Ok(count)
    }
}
