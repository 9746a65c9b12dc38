//! Capability traits the engine consumes from its host.
//!
//! The chain owns the engine, not the other way around, so none of these
//! handles are stored beyond a method call unless noted. Abstracting them
//! as traits also allows memory-based testing.

use crate::{error::BorError, header::Header};
use alloy_primitives::{Address, Bytes, B256, U256};

/// Read access to the canonical header chain.
pub trait ChainHeaderReader: Send + Sync {
    /// Current chain head, if the chain has one.
    fn current_header(&self) -> Option<Header>;

    /// Get header by hash and number.
    fn get_header(&self, hash: B256, number: u64) -> Option<Header>;

    /// Get header by number.
    fn get_header_by_number(&self, number: u64) -> Option<Header>;

    /// Get header by hash.
    fn get_header_by_hash(&self, hash: B256) -> Option<Header>;
}

/// Block reference for contract reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    /// Latest canonical block.
    Latest,
    /// A specific height.
    Number(u64),
    /// A specific block hash.
    Hash(B256),
}

/// `eth_call` capability against the EVM-backed API.
pub trait CallApi: Send + Sync {
    /// Execute a read-only call of `data` against `to` at `block`.
    fn call(&self, to: Address, data: Bytes, block: BlockRef) -> Result<Bytes, BorError>;
}

/// A protocol-level EVM call from the reserved system sender. Nonce and
/// gas-payment checks do not apply to these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemMessage {
    pub from: Address,
    pub to: Address,
    pub gas: u64,
    pub gas_price: U256,
    pub value: U256,
    pub data: Bytes,
}

/// Mutable block state during finalization, backed by the external EVM and
/// state trie.
pub trait StateDb {
    /// Run a system message against the current state.
    fn execute(&mut self, msg: &SystemMessage) -> Result<Bytes, BorError>;

    /// Flush pending state changes (journal checkpoint).
    fn finalise(&mut self, delete_empty_objects: bool);

    /// Overwrite the runtime bytecode of an account.
    fn set_code(&mut self, address: Address, code: Bytes);

    /// Intermediate state root over everything applied so far.
    fn intermediate_root(&mut self) -> B256;
}

/// Byte-oriented key-value store used for snapshot checkpoints.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BorError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BorError>;
}

/// A state-sync event committed at a sprint boundary, reported back to the
/// chain alongside the finalized block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSyncData {
    pub id: u64,
    pub contract: Address,
    pub data: Bytes,
    pub tx_hash: B256,
}
