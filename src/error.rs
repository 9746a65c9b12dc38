//! Bor consensus errors.

use alloy_primitives::{Address, B256, U256};
use thiserror::Error;

/// Errors produced by the Bor consensus engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BorError {
    /// Unknown block error.
    #[error("unknown block")]
    UnknownBlock,

    /// Block is from the future.
    #[error("block from future: block time {block_time}, current time {current_time}")]
    FutureBlock {
        block_time: u64,
        current_time: u64,
    },

    /// Unknown ancestor error.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// Missing vanity in extra-data.
    #[error("extra-data 32 byte vanity prefix missing")]
    MissingVanity,

    /// Missing signature in extra-data.
    #[error("extra-data 65 byte signature suffix missing")]
    MissingSignature,

    /// Non-sprint-end block contains a validator list.
    #[error("non-sprint-end block contains extra validator list")]
    ExtraValidators,

    /// Invalid validator list on a sprint-end block.
    #[error("invalid validator list on sprint end block")]
    InvalidSpanValidators,

    /// Non-zero mix digest.
    #[error("non-zero mix digest")]
    InvalidMixDigest,

    /// Non-empty uncle hash.
    #[error("non empty uncle hash")]
    InvalidUncleHash,

    /// Block carries uncles, which PoA rejects outright.
    #[error("uncles not allowed")]
    UnclesNotAllowed,

    /// Missing or zero difficulty.
    #[error("invalid difficulty")]
    InvalidDifficulty,

    /// Wrong difficulty for the signer's turn.
    #[error("wrong difficulty: signer {signer} at block {block}, expected {expected}, got {actual}")]
    WrongDifficulty {
        signer: Address,
        block: u64,
        expected: u64,
        actual: U256,
    },

    /// Timestamp too close to the parent.
    #[error("invalid timestamp: parent {parent_time} + period {period} > block {block_time}")]
    InvalidTimestamp {
        parent_time: u64,
        period: u64,
        block_time: u64,
    },

    /// Block sealed before the producer's slot.
    #[error("block {block} sealed too soon by signer at succession {succession}")]
    BlockTooSoon { block: u64, succession: usize },

    /// Signer is not part of the validator set.
    #[error("unauthorized signer: {signer}")]
    UnauthorizedSigner { signer: Address },

    /// Signer signed again within the recent-signers window.
    #[error("signer {signer} recently signed at block {recent_block}")]
    RecentlySigned {
        signer: Address,
        recent_block: u64,
    },

    /// Sprint-start block whose parent carries a validator list different
    /// from the local snapshot.
    #[error("mismatching validator list at block {block}")]
    MismatchingValidators { block: u64 },

    /// Headers handed to snapshot replay are out of range or non-contiguous.
    #[error("out of range or non-contiguous chain")]
    OutOfRangeChain,

    /// Validator set lookup via the validator contract failed.
    #[error("unknown validators")]
    UnknownValidators,

    /// The merged validator set would be empty or powerless.
    #[error("validator set update left no voting power")]
    EmptyValidatorSet,

    /// A change set entry was malformed (duplicate address, negative power,
    /// removal of an unknown validator).
    #[error("invalid validator change set: {message}")]
    InvalidChangeSet { message: String },

    /// State-sync event out of sequence, from a foreign chain, or outside
    /// the commit window.
    #[error(
        "invalid state received at block {block}: event {event_id} after state id {last_state_id}, window end {window_end}"
    )]
    InvalidStateReceived {
        block: u64,
        last_state_id: u64,
        event_id: u64,
        window_end: i64,
    },

    /// Span proposed by the coordinator belongs to a different chain.
    #[error("chain id of proposed span, {heimdall}, and bor chain id, {local}, don't match")]
    ChainIdMismatch { heimdall: String, local: String },

    /// Terminal coordinator error (4xx and malformed payloads).
    #[error("heimdall error: {message}")]
    Heimdall { message: String },

    /// Coordinator unreachable after all retries were spent.
    #[error("heimdall unavailable: {message}")]
    HeimdallUnavailable { message: String },

    /// `eth_call` against a genesis contract failed.
    #[error("contract call failed: {message}")]
    ContractCall { message: String },

    /// Contract return data did not decode against the expected ABI.
    #[error("abi decoding failed: {message}")]
    AbiDecode { message: String },

    /// System message execution failed inside the EVM.
    #[error("system call failed: {message}")]
    SystemCall { message: String },

    /// Signature recovery failed.
    #[error("signature recovery failed: {message}")]
    SignatureRecoveryFailed { message: String },

    /// The injected signer callback refused to sign.
    #[error("signing failed: {message}")]
    SigningFailed { message: String },

    /// Snapshot database error.
    #[error("database error: {message}")]
    Database { message: String },

    /// Persisted snapshot was written by an incompatible version.
    #[error("snapshot version mismatch: stored {stored}, supported {supported}")]
    SnapshotVersion { stored: u32, supported: u32 },

    /// Snapshot not found.
    #[error("snapshot not found for hash {hash}")]
    SnapshotNotFound { hash: B256 },

    /// Engine configuration is inconsistent; surfaced at construction.
    #[error("invalid bor config: {message}")]
    Config { message: String },

    /// Shutdown signal observed while work was pending.
    #[error("shutdown detected")]
    ShutdownDetected,
}
