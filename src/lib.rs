//! Bor proof-of-authority consensus engine.
//!
//! Validators come from an externally maintained staking registry (the
//! Heimdall coordinator) and take turns sealing blocks in sprints and
//! spans. The engine verifies headers against a replayable validator-set
//! snapshot, prepares and seals blocks for the local signer, and at sprint
//! boundaries injects system transactions that roll the on-chain validator
//! set and bridge state forward.
//!
//! # Modules
//!
//! - [`bor`]: the engine facade
//! - [`snapshot`]: per-block validator-set snapshots and replay
//! - [`validator_set`]: weighted proposer rotation
//! - [`heimdall`]: coordinator types and HTTP client
//! - [`contracts`]: typed genesis-contract clients and system messages
//! - [`api`]: the `bor` RPC namespace
//!
//! The chain, EVM, state trie and database stay on the other side of the
//! capability traits in [`chain`].

use alloy_primitives::{address, b256, Address, B256};

pub mod api;
pub mod bor;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod database;
pub mod error;
pub mod header;
pub mod heimdall;
pub mod seal;
pub mod snapshot;
pub mod validator;
pub mod validator_set;

pub use api::{BorApiServer, BorRpc};
pub use bor::{secret_key_signer, Bor, SignerFn};
pub use chain::{
    BlockRef, CallApi, ChainHeaderReader, KeyValueStore, StateDb, StateSyncData, SystemMessage,
};
pub use config::{AllocAccount, BorConfig, GenesisAlloc};
pub use database::{
    KvSnapshotDatabase, MemorySnapshotDatabase, SnapshotDatabase, SNAPSHOT_KEY_PREFIX,
};
pub use error::BorError;
pub use header::{Block, Header};
pub use heimdall::{EventRecord, HeimdallClient, HeimdallHttpClient, HeimdallSpan, Span};
pub use seal::{bor_rlp, seal_hash};
pub use snapshot::Snapshot;
pub use validator::{parse_validators, sorted_header_bytes, MinimalVal, Validator};
pub use validator_set::ValidatorSet;

/// Fixed number of extra-data prefix bytes reserved for signer vanity.
pub const EXTRA_VANITY: usize = 32;

/// Fixed number of extra-data suffix bytes reserved for the signer seal.
pub const EXTRA_SEAL: usize = 65;

/// One validator entry in header extra-data: address plus padded power.
pub const VALIDATOR_HEADER_BYTES_LENGTH: usize = 40;

/// Default number of blocks in a sprint.
pub const DEFAULT_SPRINT_LENGTH: u64 = 64;

/// Number of blocks after which to save the snapshot to the database.
pub const CHECKPOINT_INTERVAL: u64 = 1024;

/// Number of recent snapshots to keep in memory.
pub const INMEMORY_SNAPSHOTS: usize = 128;

/// Number of recent block signatures to keep in memory.
pub const INMEMORY_SIGNATURES: usize = 4096;

/// Seconds a block may lead the local clock before it counts as future.
pub const ALLOW_FUTURE_BLOCK_TIME: u64 = 3;

/// Reserved sender of protocol-level system transactions.
pub const SYSTEM_ADDRESS: Address = address!("fffffffffffffffffffffffffffffffffffffffe");

/// Hash of an empty uncle list; the only one PoA accepts.
pub const UNCLE_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");
