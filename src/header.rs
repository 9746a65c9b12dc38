//! Minimal header and block wire types consumed from the chain.
//!
//! The engine only needs the fifteen legacy header fields the seal hash is
//! defined over, so it carries its own wire type instead of pulling in a
//! full node framework.

use crate::{EXTRA_SEAL, EXTRA_VANITY};
use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256, B64, U256};
use alloy_rlp::RlpEncodable;
use serde::{Deserialize, Serialize};

/// Block header as the consensus engine sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub coinbase: Address,
    pub state_root: B256,
    pub tx_root: B256,
    pub receipt_root: B256,
    pub bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub time: u64,
    pub extra: Bytes,
    pub mix_digest: B256,
    pub nonce: B64,
}

impl Header {
    /// Keccak-256 of the RLP encoding of the full header, seal included.
    pub fn hash_slow(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// The 65-byte seal at the tail of extra-data.
    pub fn seal(&self) -> Option<&[u8]> {
        if self.extra.len() < EXTRA_SEAL {
            return None;
        }
        Some(&self.extra[self.extra.len() - EXTRA_SEAL..])
    }

    /// The validator region of extra-data, between vanity and seal.
    ///
    /// Empty on every block except the last block of a sprint.
    pub fn validator_bytes(&self) -> Option<&[u8]> {
        if self.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return None;
        }
        Some(&self.extra[EXTRA_VANITY..self.extra.len() - EXTRA_SEAL])
    }
}

/// A block paired with the opaque transactions the engine schedules for
/// sealing. Transaction contents are none of the engine's business; only
/// their presence matters (zero-period chains refuse to seal empty blocks).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Bytes>,
    pub uncles: Vec<Header>,
}

impl Block {
    /// Replace the header with its sealed counterpart.
    pub fn with_seal(&self, header: Header) -> Block {
        Block {
            header,
            transactions: self.transactions.clone(),
            uncles: self.uncles.clone(),
        }
    }
}
