//! Heimdall coordinator types and client capability.
//!
//! Heimdall tracks the staking registry and the cross-chain event queue.
//! The engine only ever reads from it: spans at sprint boundaries and
//! state-sync events for the receiver contract.

mod client;

pub use client::{HeimdallHttpClient, INITIAL_BACKOFF, MAX_FETCH_ATTEMPTS};

use crate::{error::BorError, validator::Validator, validator_set::ValidatorSet};
use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A range of blocks over which one validator set is authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    #[serde(rename = "span_id")]
    pub id: u64,
    pub start_block: u64,
    pub end_block: u64,
}

/// Span as served by the coordinator, with the validator set and the
/// producer subset selected for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeimdallSpan {
    #[serde(flatten)]
    pub span: Span,
    pub validator_set: ValidatorSet,
    pub selected_producers: Vec<Validator>,
    #[serde(rename = "bor_chain_id")]
    pub chain_id: String,
}

/// One cross-chain event queued for delivery to the state receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u64,
    pub contract: Address,
    pub data: Bytes,
    pub tx_hash: B256,
    #[serde(rename = "bor_chain_id")]
    pub chain_id: String,
    /// Unix seconds at which the event was recorded.
    #[serde(rename = "record_time")]
    pub time: i64,
}

/// Client capability against the coordinator's HTTP API.
#[async_trait]
pub trait HeimdallClient: Send + Sync {
    /// Fetch `path?query`, retrying transient failures, and return the raw
    /// response body.
    async fn fetch(&self, path: &str, query: &str) -> Result<Vec<u8>, BorError>;

    /// Fetch event records with `id > from_id` and `time < to_time`,
    /// ordered by id.
    async fn fetch_state_sync_events(
        &self,
        from_id: u64,
        to_time: i64,
    ) -> Result<Vec<EventRecord>, BorError>;

    /// Release pooled connections. Called from the engine shutdown path.
    async fn close(&self);
}

/// Parse a span payload fetched from `bor/span/{id}`.
pub fn parse_span(body: &[u8]) -> Result<HeimdallSpan, BorError> {
    serde_json::from_slice(body).map_err(|e| BorError::Heimdall {
        message: format!("malformed span payload: {e}"),
    })
}
