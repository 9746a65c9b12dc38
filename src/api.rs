//! The `bor` RPC namespace (version 1.0, private).
//!
//! Read-only views over the engine: the snapshot at a block, the sealer of
//! a block, and the current rotation state.

use crate::{
    bor::Bor, chain::ChainHeaderReader, database::SnapshotDatabase, error::BorError,
    header::Header, snapshot::Snapshot, validator::Validator,
};
use alloy_primitives::{Address, B256};
use jsonrpsee::{core::RpcResult, proc_macros::rpc, types::ErrorObjectOwned, RpcModule};
use std::sync::Arc;

/// `bor` namespace surface.
#[rpc(server, namespace = "bor")]
pub trait BorApi {
    /// Snapshot at the given block number, or at the chain head.
    #[method(name = "getSnapshot")]
    fn get_snapshot(&self, number: Option<u64>) -> RpcResult<Snapshot>;

    /// Snapshot at the given block hash.
    #[method(name = "getSnapshotAtHash")]
    fn get_snapshot_at_hash(&self, hash: B256) -> RpcResult<Snapshot>;

    /// Address that sealed the given block (head when omitted).
    #[method(name = "getAuthor")]
    fn get_author(&self, number: Option<u64>) -> RpcResult<Address>;

    /// Proposer at the chain head.
    #[method(name = "getCurrentProposer")]
    fn get_current_proposer(&self) -> RpcResult<Address>;

    /// Validator set at the chain head.
    #[method(name = "getCurrentValidators")]
    fn get_current_validators(&self) -> RpcResult<Vec<Validator>>;
}

/// Server half of the `bor` namespace.
pub struct BorRpc<DB> {
    bor: Arc<Bor<DB>>,
    chain: Arc<dyn ChainHeaderReader>,
}

fn rpc_error(err: BorError) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(-32000, err.to_string(), None::<()>)
}

impl<DB: SnapshotDatabase> BorRpc<DB> {
    pub fn new(bor: Arc<Bor<DB>>, chain: Arc<dyn ChainHeaderReader>) -> Self {
        Self { bor, chain }
    }

    fn header_for(&self, number: Option<u64>) -> RpcResult<Header> {
        let header = match number {
            Some(number) => self.chain.get_header_by_number(number),
            None => self.chain.current_header(),
        };
        header.ok_or_else(|| rpc_error(BorError::UnknownBlock))
    }

    fn snapshot_at(&self, header: &Header) -> RpcResult<Snapshot> {
        self.bor
            .snapshot(&*self.chain, header.number, header.hash_slow(), None)
            .map_err(rpc_error)
    }
}

impl<DB: SnapshotDatabase + 'static> BorApiServer for BorRpc<DB> {
    fn get_snapshot(&self, number: Option<u64>) -> RpcResult<Snapshot> {
        let header = self.header_for(number)?;
        self.snapshot_at(&header)
    }

    fn get_snapshot_at_hash(&self, hash: B256) -> RpcResult<Snapshot> {
        let header = self
            .chain
            .get_header_by_hash(hash)
            .ok_or_else(|| rpc_error(BorError::UnknownBlock))?;
        self.snapshot_at(&header)
    }

    fn get_author(&self, number: Option<u64>) -> RpcResult<Address> {
        let header = self.header_for(number)?;
        self.bor.author(&header).map_err(rpc_error)
    }

    fn get_current_proposer(&self) -> RpcResult<Address> {
        let header = self.header_for(None)?;
        let snap = self.snapshot_at(&header)?;
        snap.validator_set
            .get_proposer()
            .map(|v| v.address)
            .ok_or_else(|| rpc_error(BorError::EmptyValidatorSet))
    }

    fn get_current_validators(&self) -> RpcResult<Vec<Validator>> {
        let header = self.header_for(None)?;
        let snap = self.snapshot_at(&header)?;
        Ok(snap.validator_set.validators)
    }
}

impl<DB: SnapshotDatabase + 'static> Bor<DB> {
    /// The RPC modules this engine exposes to the node.
    pub fn apis(self: Arc<Self>, chain: Arc<dyn ChainHeaderReader>) -> RpcModule<BorRpc<DB>> {
        BorRpc::new(self, chain).into_rpc()
    }
}
