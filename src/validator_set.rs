//! Ordered validator set with weighted proposer rotation.
//!
//! Every height each validator gains its voting power in priority; the
//! highest-priority validator proposes and pays the total power back.
//! Priorities are kept centered and capped so that long-lived sets do not
//! overflow and freshly-joined validators cannot immediately propose.

use crate::{error::BorError, validator::Validator};
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

/// Bound on the priority spread, as a multiple of total voting power.
const PRIORITY_WINDOW_SIZE_FACTOR: i64 = 2;

/// Ordered set of validators, sorted by address, with the current proposer
/// and a cached total voting power.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub validators: Vec<Validator>,
    pub proposer: Option<Validator>,
    #[serde(default)]
    total_voting_power: i64,
}

impl ValidatorSet {
    /// Build a set from `validators` and elect the initial proposer.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        let total_voting_power = validators.iter().map(|v| v.voting_power).sum();

        let mut set = Self {
            validators,
            proposer: None,
            total_voting_power,
        };
        if !set.is_empty() {
            set.increment_proposer_priority(1);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Sum of all voting powers.
    pub fn total_voting_power(&self) -> i64 {
        self.total_voting_power
    }

    /// Whether `address` belongs to the set.
    pub fn has_address(&self, address: Address) -> bool {
        self.index_of(address).is_some()
    }

    fn index_of(&self, address: Address) -> Option<usize> {
        self.validators.iter().position(|v| v.address == address)
    }

    /// Current proposer. `None` only for the empty set.
    pub fn get_proposer(&self) -> Option<&Validator> {
        self.proposer.as_ref()
    }

    /// Advance the rotation by `times` heights.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        if self.is_empty() || times == 0 {
            return;
        }

        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR.saturating_mul(self.total_voting_power);
        self.rescale_priorities(diff_max);
        self.shift_by_avg_proposer_priority();

        let mut proposer_idx = 0;
        for _ in 0..times {
            proposer_idx = self.single_increment();
        }
        self.proposer = Some(self.validators[proposer_idx]);
    }

    /// One rotation step: everyone gains their power, the maximum pays the
    /// total back. Returns the elected index. Ties resolve to the lowest
    /// address because the array is address-sorted and only a strictly
    /// greater priority displaces the running maximum.
    fn single_increment(&mut self) -> usize {
        for v in &mut self.validators {
            v.proposer_priority = v.proposer_priority.saturating_add(v.voting_power);
        }

        let mut max_idx = 0;
        for (i, v) in self.validators.iter().enumerate() {
            if v.proposer_priority > self.validators[max_idx].proposer_priority {
                max_idx = i;
            }
        }

        self.validators[max_idx].proposer_priority = self.validators[max_idx]
            .proposer_priority
            .saturating_sub(self.total_voting_power);
        max_idx
    }

    fn rescale_priorities(&mut self, diff_max: i64) {
        if diff_max <= 0 {
            return;
        }
        let diff = self.priority_spread();
        if diff > diff_max {
            let ratio = (diff + diff_max - 1) / diff_max;
            for v in &mut self.validators {
                v.proposer_priority /= ratio;
            }
        }
    }

    fn priority_spread(&self) -> i64 {
        let min = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .min()
            .unwrap_or(0);
        let max = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .max()
            .unwrap_or(0);
        max.saturating_sub(min)
    }

    fn shift_by_avg_proposer_priority(&mut self) {
        if self.is_empty() {
            return;
        }
        let sum: i128 = self
            .validators
            .iter()
            .map(|v| v.proposer_priority as i128)
            .sum();
        let avg = (sum / self.validators.len() as i128) as i64;
        for v in &mut self.validators {
            v.proposer_priority = v.proposer_priority.saturating_sub(avg);
        }
    }

    /// Zero-based distance of `signer` from the proposer, walking the
    /// address-sorted array as a ring.
    pub fn get_signer_succession_number(&self, signer: Address) -> Result<usize, BorError> {
        let proposer = self
            .proposer
            .as_ref()
            .ok_or(BorError::UnauthorizedSigner { signer })?;
        let proposer_index = self
            .index_of(proposer.address)
            .ok_or(BorError::UnauthorizedSigner { signer })?;
        let signer_index = self
            .index_of(signer)
            .ok_or(BorError::UnauthorizedSigner { signer })?;

        let mut temp_index = signer_index;
        if temp_index < proposer_index {
            temp_index += self.validators.len();
        }
        Ok(temp_index - proposer_index)
    }

    /// Difficulty a block sealed by `signer` must carry: the proposer gets
    /// the set size, each succession position one less.
    pub fn difficulty(&self, signer: Address) -> Result<u64, BorError> {
        let succession = self.get_signer_succession_number(signer)?;
        Ok((self.validators.len() - succession) as u64)
    }

    /// Merge a change set into the set.
    ///
    /// Entries with zero power remove the validator; new addresses join
    /// with a priority penalty; existing addresses keep their accumulated
    /// priority and only update power. Priorities are re-centered and, when
    /// the spread outgrows the window, rescaled.
    pub fn update_with_change_set(&mut self, changes: &[Validator]) -> Result<(), BorError> {
        let mut updates: Vec<Validator> = Vec::new();
        let mut removals: Vec<Address> = Vec::new();

        let mut sorted: Vec<Validator> = changes.to_vec();
        sorted.sort_by(|a, b| a.address.cmp(&b.address));
        for pair in sorted.windows(2) {
            if pair[0].address == pair[1].address {
                return Err(BorError::InvalidChangeSet {
                    message: format!("duplicate entry {}", pair[0].address),
                });
            }
        }
        for change in sorted {
            if change.voting_power < 0 {
                return Err(BorError::InvalidChangeSet {
                    message: format!("negative voting power for {}", change.address),
                });
            }
            if change.voting_power == 0 {
                removals.push(change.address);
            } else {
                updates.push(change);
            }
        }

        for address in &removals {
            if self.index_of(*address).is_none() {
                return Err(BorError::InvalidChangeSet {
                    message: format!("removal of unknown validator {address}"),
                });
            }
        }

        // Total power after the merge, needed for the joining penalty.
        let mut total_after: i64 = self
            .validators
            .iter()
            .filter(|v| !removals.contains(&v.address))
            .map(|v| {
                updates
                    .iter()
                    .find(|u| u.address == v.address)
                    .map(|u| u.voting_power)
                    .unwrap_or(v.voting_power)
            })
            .sum();
        total_after += updates
            .iter()
            .filter(|u| self.index_of(u.address).is_none())
            .map(|u| u.voting_power)
            .sum::<i64>();
        if total_after <= 0 {
            return Err(BorError::EmptyValidatorSet);
        }

        for update in updates {
            match self.index_of(update.address) {
                Some(i) => {
                    self.validators[i].voting_power = update.voting_power;
                    self.validators[i].id = update.id;
                }
                None => {
                    // Joining validators start behind the whole rotation.
                    let mut joined = update;
                    joined.proposer_priority = -(total_after + total_after / 8);
                    self.validators.push(joined);
                }
            }
        }
        self.validators.retain(|v| !removals.contains(&v.address));
        self.validators.sort_by(|a, b| a.address.cmp(&b.address));
        self.total_voting_power = total_after;

        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR.saturating_mul(self.total_voting_power);
        self.rescale_priorities(diff_max);
        self.shift_by_avg_proposer_priority();

        // Re-elect if the proposer was voted out; otherwise keep the stored
        // proposer in sync with its array entry.
        if let Some(address) = self.proposer.as_ref().map(|p| p.address) {
            self.proposer = match self.index_of(address) {
                Some(i) => Some(self.validators[i]),
                None => self
                    .validators
                    .iter()
                    .max_by(|a, b| {
                        a.proposer_priority
                            .cmp(&b.proposer_priority)
                            .then(b.address.cmp(&a.address))
                    })
                    .copied(),
            };
        }
        Ok(())
    }
}

/// Fold a freshly fetched validator list into `current`: validators absent
/// from `fetched` are removed, the rest are updated or inserted.
pub fn get_updated_validator_set(
    current: &ValidatorSet,
    fetched: &[Validator],
) -> Result<ValidatorSet, BorError> {
    let mut changes: Vec<Validator> = Vec::with_capacity(current.len() + fetched.len());

    for old in &current.validators {
        let mut change = *old;
        change.voting_power = fetched
            .iter()
            .find(|n| n.address == old.address)
            .map(|n| n.voting_power)
            .unwrap_or(0);
        changes.push(change);
    }
    for new in fetched {
        if !changes.iter().any(|c| c.address == new.address) {
            changes.push(*new);
        }
    }

    let mut updated = current.clone();
    updated.update_with_change_set(&changes)?;
    Ok(updated)
}
