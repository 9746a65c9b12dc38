//! Bor consensus engine configuration.

use crate::{error::BorError, DEFAULT_SPRINT_LENGTH};
use alloy_primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Consensus parameters for a Bor chain.
///
/// `block_alloc` carries raw JSON straight from the chain spec file; the
/// engine decodes it once at construction and refuses to start on a decode
/// failure (a malformed alloc is a configuration bug, not a runtime
/// condition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorConfig {
    /// Number of seconds between blocks to enforce.
    pub period: u64,
    /// Sprint length in blocks. Validator-list data appears in the last
    /// block of each sprint.
    pub sprint: u64,
    /// Extra delay for the first block of a sprint, allowing the previous
    /// sprint's blocks to propagate.
    pub producer_delay: u64,
    /// Per-succession-position delay multiplier for out-of-turn producers.
    pub backup_multiplier: u64,
    /// Validator-set genesis contract.
    pub validator_contract: Address,
    /// State-receiver genesis contract.
    pub state_receiver_contract: Address,
    /// Chain id the coordinator must agree on.
    pub chain_id: String,
    /// Block number -> genesis alloc override, applied as a direct code
    /// rewrite at that height (hard-fork mechanism).
    #[serde(default)]
    pub block_alloc: HashMap<u64, serde_json::Value>,
    /// Block number -> cap on the number of state-sync records committed at
    /// that block.
    #[serde(default)]
    pub override_state_sync_records: HashMap<u64, usize>,
}

impl Default for BorConfig {
    fn default() -> Self {
        Self {
            period: 2,
            sprint: DEFAULT_SPRINT_LENGTH,
            producer_delay: 6,
            backup_multiplier: 2,
            validator_contract: Address::ZERO,
            state_receiver_contract: Address::ZERO,
            chain_id: String::new(),
            block_alloc: HashMap::new(),
            override_state_sync_records: HashMap::new(),
        }
    }
}

impl BorConfig {
    /// Producer delay for a block: `period` within a sprint,
    /// `producer_delay` on the first block of a sprint, plus
    /// `succession * backup_multiplier` for out-of-turn producers.
    pub fn calc_producer_delay(&self, number: u64, succession: usize) -> u64 {
        let mut delay = self.period;
        if number % self.sprint == 0 {
            delay = self.producer_delay;
        }
        if succession > 0 {
            delay += succession as u64 * self.backup_multiplier;
        }
        delay
    }

    /// True when `number` is the first block of a sprint.
    pub fn is_sprint_start(&self, number: u64) -> bool {
        number % self.sprint == 0
    }

    /// True when `number` is the last block of a sprint.
    pub fn is_sprint_end(&self, number: u64) -> bool {
        (number + 1) % self.sprint == 0
    }
}

/// One account entry of a block-alloc override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocAccount {
    /// Runtime bytecode installed at the account.
    #[serde(default)]
    pub code: Bytes,
}

/// Decoded form of one `block_alloc` entry: address -> account override.
pub type GenesisAlloc = HashMap<Address, AllocAccount>;

/// Decode every `block_alloc` entry up front.
pub(crate) fn decode_block_allocs(
    config: &BorConfig,
) -> Result<HashMap<u64, GenesisAlloc>, BorError> {
    let mut decoded = HashMap::with_capacity(config.block_alloc.len());
    for (number, raw) in &config.block_alloc {
        let alloc: GenesisAlloc =
            serde_json::from_value(raw.clone()).map_err(|e| BorError::Config {
                message: format!("block alloc at {number} is not correct: {e}"),
            })?;
        decoded.insert(*number, alloc);
    }
    Ok(decoded)
}
