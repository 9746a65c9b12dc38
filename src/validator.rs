//! Validators and their wire encodings.

use crate::{error::BorError, VALIDATOR_HEADER_BYTES_LENGTH};
use alloy_primitives::{Address, U256};
use alloy_rlp::RlpEncodable;
use serde::{Deserialize, Serialize};

/// A single validator: staking-registry id, signer address, voting power
/// and the rotating proposer priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Id assigned by the staking registry. Zero for validators that only
    /// ever existed on-chain.
    #[serde(rename = "ID", default)]
    pub id: u64,
    /// Signing address.
    #[serde(rename = "signer")]
    pub address: Address,
    /// Stake-weighted voting power. Never negative.
    #[serde(rename = "power")]
    pub voting_power: i64,
    /// Accumulated proposer priority.
    #[serde(rename = "accum", default)]
    pub proposer_priority: i64,
}

impl Validator {
    /// A validator with fresh (zero) priority.
    pub fn new(address: Address, voting_power: i64) -> Self {
        Self {
            id: 0,
            address,
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Header wire form: `address || big-endian power padded to 20 bytes`.
    pub fn header_bytes(&self) -> [u8; VALIDATOR_HEADER_BYTES_LENGTH] {
        let mut out = [0u8; VALIDATOR_HEADER_BYTES_LENGTH];
        out[..20].copy_from_slice(self.address.as_slice());
        let power = U256::from(self.voting_power.max(0) as u64).to_be_bytes::<32>();
        out[20..].copy_from_slice(&power[12..]);
        out
    }

    /// The priority-free form packed into contract call payloads.
    pub fn minimal(&self) -> MinimalVal {
        MinimalVal {
            id: self.id,
            voting_power: self.voting_power.max(0) as u64,
            signer: self.address,
        }
    }
}

/// Priority-free validator form, RLP-encoded into `commitSpan` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable)]
pub struct MinimalVal {
    pub id: u64,
    pub voting_power: u64,
    pub signer: Address,
}

/// Decode the validator region of a sprint-end header.
///
/// The input must be a whole number of 40-byte entries; the entries come
/// back in their on-wire order.
pub fn parse_validators(data: &[u8]) -> Result<Vec<Validator>, BorError> {
    if data.is_empty() || data.len() % VALIDATOR_HEADER_BYTES_LENGTH != 0 {
        return Err(BorError::InvalidSpanValidators);
    }

    let mut validators = Vec::with_capacity(data.len() / VALIDATOR_HEADER_BYTES_LENGTH);
    for chunk in data.chunks(VALIDATOR_HEADER_BYTES_LENGTH) {
        let address = Address::from_slice(&chunk[..20]);
        let power = U256::from_be_slice(&chunk[20..]);
        let power = u64::try_from(power).map_err(|_| BorError::InvalidSpanValidators)?;
        validators.push(Validator::new(address, power as i64));
    }
    Ok(validators)
}

/// Concatenated header bytes of `validators`, sorted by address.
pub fn sorted_header_bytes(validators: &[Validator]) -> Vec<u8> {
    let mut sorted: Vec<Validator> = validators.to_vec();
    sorted.sort_by(|a, b| a.address.cmp(&b.address));

    let mut out = Vec::with_capacity(sorted.len() * VALIDATOR_HEADER_BYTES_LENGTH);
    for validator in &sorted {
        out.extend_from_slice(&validator.header_bytes());
    }
    out
}
