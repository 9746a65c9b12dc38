//! Typed clients for the genesis contracts.
//!
//! Validator-set reads back verification and snapshots; the state receiver
//! ingests cross-chain events. Writes go through system messages: calls
//! from the reserved sender with nonce and gas payment disabled.

use crate::{
    chain::{BlockRef, CallApi, StateDb, SystemMessage},
    error::BorError,
    heimdall::{EventRecord, HeimdallSpan, Span},
    validator::{MinimalVal, Validator},
    SYSTEM_ADDRESS,
};
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_rlp::RlpEncodable;
use alloy_sol_types::{sol, SolCall};
use std::sync::Arc;
use tracing::{debug, info};

sol! {
    function getCurrentSpan() external view returns (uint256 number, uint256 startBlock, uint256 endBlock);
    function getBorValidators(uint256 number) external view returns (address[] memory, uint256[] memory);
    function commitSpan(
        uint256 newSpan,
        uint256 startBlock,
        uint256 endBlock,
        bytes calldata validatorBytes,
        bytes calldata producerBytes
    ) external;
    function lastStateId() external view returns (uint256);
    function commitState(uint256 syncTime, bytes calldata recordBytes) external;
}

/// Build a system message against `to`.
pub fn system_message(to: Address, data: Bytes) -> SystemMessage {
    SystemMessage {
        from: SYSTEM_ADDRESS,
        to,
        gas: u64::MAX / 2,
        gas_price: U256::ZERO,
        value: U256::ZERO,
        data,
    }
}

/// Run a system message against the block state.
///
/// Failures are deliberately swallowed: the state is finalised so that
/// changes made before the revert stick, and the block goes on. Protocol
/// commits are best-effort by design; a failing genesis contract must not
/// halt the chain.
pub fn apply_system_message<S: StateDb + ?Sized>(state: &mut S, msg: &SystemMessage) {
    if let Err(err) = state.execute(msg) {
        state.finalise(true);
        debug!(target: "bor::contracts", %err, to = %msg.to, "system call reverted");
    }
}

fn u256_to_u64(value: U256, what: &str) -> Result<u64, BorError> {
    u64::try_from(value).map_err(|_| BorError::AbiDecode {
        message: format!("{what} out of range: {value}"),
    })
}

/// Read/write client for the validator-set genesis contract.
pub struct ValidatorSetContract {
    address: Address,
    api: Arc<dyn CallApi>,
}

impl ValidatorSetContract {
    pub fn new(address: Address, api: Arc<dyn CallApi>) -> Self {
        Self { address, api }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// `getCurrentSpan()` at `block`.
    pub fn get_current_span(&self, block: BlockRef) -> Result<Span, BorError> {
        let data = Bytes::from(getCurrentSpanCall {}.abi_encode());
        let ret = self.api.call(self.address, data, block)?;
        let decoded =
            getCurrentSpanCall::abi_decode_returns(&ret, true).map_err(|e| BorError::AbiDecode {
                message: format!("getCurrentSpan: {e}"),
            })?;
        Ok(Span {
            id: u256_to_u64(decoded.number, "span id")?,
            start_block: u256_to_u64(decoded.startBlock, "span start")?,
            end_block: u256_to_u64(decoded.endBlock, "span end")?,
        })
    }

    /// `getBorValidators(number)` at `block`.
    pub fn get_validators(&self, block: BlockRef, number: u64) -> Result<Vec<Validator>, BorError> {
        let call = getBorValidatorsCall {
            number: U256::from(number),
        };
        let ret = self.api.call(self.address, Bytes::from(call.abi_encode()), block)?;
        let decoded = getBorValidatorsCall::abi_decode_returns(&ret, true).map_err(|e| {
            BorError::AbiDecode {
                message: format!("getBorValidators: {e}"),
            }
        })?;

        if decoded._0.len() != decoded._1.len() {
            return Err(BorError::AbiDecode {
                message: format!(
                    "getBorValidators returned {} addresses but {} powers",
                    decoded._0.len(),
                    decoded._1.len()
                ),
            });
        }
        decoded
            ._0
            .into_iter()
            .zip(decoded._1)
            .map(|(address, power)| {
                Ok(Validator::new(
                    address,
                    u256_to_u64(power, "voting power")? as i64,
                ))
            })
            .collect()
    }

    /// Build the `commitSpan` system message for a span fetched from the
    /// coordinator. Validators and producers travel as RLP-encoded minimal
    /// forms.
    pub fn commit_span_message(&self, span: &HeimdallSpan) -> SystemMessage {
        let validators: Vec<MinimalVal> = span
            .validator_set
            .validators
            .iter()
            .map(Validator::minimal)
            .collect();
        let producers: Vec<MinimalVal> =
            span.selected_producers.iter().map(Validator::minimal).collect();

        let validator_bytes = alloy_rlp::encode(&validators);
        let producer_bytes = alloy_rlp::encode(&producers);

        info!(
            target: "bor::contracts",
            id = span.span.id,
            start_block = span.span.start_block,
            end_block = span.span.end_block,
            validators = validators.len(),
            producers = producers.len(),
            "committing new span"
        );

        let call = commitSpanCall {
            newSpan: U256::from(span.span.id),
            startBlock: U256::from(span.span.start_block),
            endBlock: U256::from(span.span.end_block),
            validatorBytes: validator_bytes.into(),
            producerBytes: producer_bytes.into(),
        };
        system_message(self.address, Bytes::from(call.abi_encode()))
    }
}

/// Wire form of an event record inside `commitState` calldata.
#[derive(RlpEncodable)]
struct EventRecordRlp<'a> {
    id: u64,
    contract: Address,
    data: &'a [u8],
    tx_hash: B256,
    chain_id: &'a str,
}

/// Read/write client for the state-receiver genesis contract.
pub struct StateReceiverContract {
    address: Address,
    api: Arc<dyn CallApi>,
}

impl StateReceiverContract {
    pub fn new(address: Address, api: Arc<dyn CallApi>) -> Self {
        Self { address, api }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// `lastStateId()` at `block`.
    pub fn last_state_id(&self, block: BlockRef) -> Result<u64, BorError> {
        let data = Bytes::from(lastStateIdCall {}.abi_encode());
        let ret = self.api.call(self.address, data, block)?;
        let decoded =
            lastStateIdCall::abi_decode_returns(&ret, true).map_err(|e| BorError::AbiDecode {
                message: format!("lastStateId: {e}"),
            })?;
        u256_to_u64(decoded._0, "last state id")
    }

    /// Build the `commitState` system message delivering `event`.
    pub fn commit_state_message(&self, event: &EventRecord) -> SystemMessage {
        let record = EventRecordRlp {
            id: event.id,
            contract: event.contract,
            data: event.data.as_ref(),
            tx_hash: event.tx_hash,
            chain_id: &event.chain_id,
        };
        let call = commitStateCall {
            syncTime: U256::from(event.time.max(0) as u64),
            recordBytes: alloy_rlp::encode(&record).into(),
        };
        system_message(self.address, Bytes::from(call.abi_encode()))
    }
}
