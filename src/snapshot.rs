//! Per-block snapshot of the authorized validator set.
//!
//! Snapshots are immutable once stored; `apply` always returns a new value.
//! Signer recovery is injected as a closure so the signature cache stays
//! with the engine.

use crate::{
    config::BorConfig,
    error::BorError,
    header::Header,
    validator::parse_validators,
    validator_set::{get_updated_validator_set, ValidatorSet},
};
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Validator-set state at a given block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Consensus engine configuration; re-attached after loading.
    #[serde(skip)]
    pub config: BorConfig,

    /// Block number where the snapshot was created.
    pub number: u64,

    /// Block hash where the snapshot was created.
    pub hash: B256,

    /// Validator set at this moment.
    pub validator_set: ValidatorSet,

    /// Signers of recent blocks, for double-sign protection
    /// (block number -> signer).
    pub recents: HashMap<u64, Address>,
}

impl Snapshot {
    /// Snapshot for a trusted checkpoint. The recent-signers window starts
    /// empty, so this is only appropriate for genesis.
    pub fn new(config: BorConfig, number: u64, hash: B256, validator_set: ValidatorSet) -> Self {
        Self {
            config,
            number,
            hash,
            validator_set,
            recents: HashMap::new(),
        }
    }

    /// A signer is barred for the ceil(N/2) blocks after one it sealed.
    /// The oldest entry is dropped before each check, so the map is kept
    /// one block wider than the enforced window.
    fn recents_limit(&self) -> u64 {
        (self.validator_set.len() as u64 + 1) / 2 + 1
    }

    /// Expected difficulty for a block sealed by `signer` on top of this
    /// snapshot.
    pub fn difficulty(&self, signer: Address) -> Result<u64, BorError> {
        self.validator_set.difficulty(signer)
    }

    /// Replay `headers` (ascending, contiguous, child of this snapshot) and
    /// return the snapshot at the last one.
    pub fn apply<F>(&self, headers: &[Header], mut recover_signer: F) -> Result<Snapshot, BorError>
    where
        F: FnMut(&Header) -> Result<Address, BorError>,
    {
        if headers.is_empty() {
            return Ok(self.clone());
        }

        for pair in headers.windows(2) {
            if pair[1].number != pair[0].number + 1 {
                return Err(BorError::OutOfRangeChain);
            }
        }
        if headers[0].number != self.number + 1 {
            return Err(BorError::OutOfRangeChain);
        }

        let mut snap = self.clone();

        for header in headers {
            let number = header.number;

            // Slide the window before admitting the new signer.
            let limit = snap.recents_limit();
            if number >= limit {
                snap.recents.remove(&(number - limit));
            }

            let signer = recover_signer(header)?;
            if !snap.validator_set.has_address(signer) {
                return Err(BorError::UnauthorizedSigner { signer });
            }
            for (&recent_block, &recent_signer) in &snap.recents {
                if recent_signer == signer {
                    return Err(BorError::RecentlySigned {
                        signer,
                        recent_block,
                    });
                }
            }
            snap.recents.insert(number, signer);

            // The last block of a sprint announces the set for the next
            // one; it takes effect before the rotation advances into it.
            if number > 0 && snap.config.is_sprint_end(number) {
                let validator_bytes = header
                    .validator_bytes()
                    .ok_or(BorError::MissingSignature)?;
                let fetched = parse_validators(validator_bytes)?;
                snap.validator_set =
                    get_updated_validator_set(&snap.validator_set, &fetched)?;
            }

            snap.validator_set.increment_proposer_priority(1);
        }

        snap.number = headers[headers.len() - 1].number;
        snap.hash = headers[headers.len() - 1].hash_slow();

        Ok(snap)
    }
}
