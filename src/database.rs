//! Snapshot persistence.
//!
//! Checkpoint snapshots are stored every 1024 blocks so that a cold lookup
//! never has to replay more than one checkpoint interval of headers. The
//! trait allows a memory-backed store for tests and a key-value-backed one
//! for production.

use crate::{chain::KeyValueStore, error::BorError, snapshot::Snapshot};
use alloy_primitives::{hex, B256};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Database key prefix for bor snapshots.
pub const SNAPSHOT_KEY_PREFIX: &str = "bor-";

/// On-disk snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Storage backend for checkpoint snapshots.
pub trait SnapshotDatabase: Send + Sync {
    /// Load a snapshot by block hash.
    fn load_snapshot(&self, hash: B256) -> Result<Option<Snapshot>, BorError>;

    /// Store a snapshot under its block hash.
    fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), BorError>;
}

#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    version: u32,
    snapshot: Snapshot,
}

/// Snapshot database on top of the chain's key-value store, encoding each
/// snapshot as versioned JSON under `bor-{hex(hash)}`.
pub struct KvSnapshotDatabase<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> KvSnapshotDatabase<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn key(hash: B256) -> Vec<u8> {
        format!("{SNAPSHOT_KEY_PREFIX}{}", hex::encode(hash)).into_bytes()
    }
}

impl<S: KeyValueStore> SnapshotDatabase for KvSnapshotDatabase<S> {
    fn load_snapshot(&self, hash: B256) -> Result<Option<Snapshot>, BorError> {
        let Some(raw) = self.store.get(&Self::key(hash))? else {
            return Ok(None);
        };
        let stored: StoredSnapshot =
            serde_json::from_slice(&raw).map_err(|e| BorError::Database {
                message: format!("corrupt snapshot {hash}: {e}"),
            })?;
        if stored.version != SNAPSHOT_VERSION {
            return Err(BorError::SnapshotVersion {
                stored: stored.version,
                supported: SNAPSHOT_VERSION,
            });
        }
        Ok(Some(stored.snapshot))
    }

    fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), BorError> {
        let stored = StoredSnapshot {
            version: SNAPSHOT_VERSION,
            snapshot: snapshot.clone(),
        };
        let raw = serde_json::to_vec(&stored).map_err(|e| BorError::Database {
            message: format!("encoding snapshot {}: {e}", snapshot.hash),
        })?;
        self.store.put(&Self::key(snapshot.hash), &raw)
    }
}

/// Memory-backed snapshot database for testing.
#[derive(Debug, Default)]
pub struct MemorySnapshotDatabase {
    snapshots: RwLock<HashMap<B256, Snapshot>>,
}

impl MemorySnapshotDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new memory database wrapped in Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

impl SnapshotDatabase for MemorySnapshotDatabase {
    fn load_snapshot(&self, hash: B256) -> Result<Option<Snapshot>, BorError> {
        Ok(self.snapshots.read().get(&hash).cloned())
    }

    fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), BorError> {
        self.snapshots
            .write()
            .insert(snapshot.hash, snapshot.clone());
        Ok(())
    }
}

/// Memory-backed key-value store for testing the KV adapter.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BorError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BorError> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}
