//! The upstream node's HTTP client is, per spec.md §1, an external
//! collaborator specified only through the narrow interface the core
//! consumes. This module defines that interface plus a production
//! `reqwest`-backed implementation and a test double.

pub mod http;
pub mod mock;

use crate::error::UpstreamError;
use crate::model::{BlockHeader, NodeInfo, PeerList, RawBlock, RawPoolTransaction, TransactionGlobalIndexes};
use async_trait::async_trait;

/// Identifies a block either by height or by hash, matching the upstream
/// RPC surface's `heightOrHash` parameter (spec.md §6).
#[derive(Clone, Debug)]
pub enum HeightOrHash {
    Height(u64),
    Hash(String),
}

/// Result of the `rawSync` RPC (spec.md §4.3/§9): a page of raw blocks
/// plus a `synced` flag that is true exactly when the page is empty —
/// spec.md preserves this conflation between "caught up" and "temporarily
/// empty response" deliberately (see spec.md §9, Open Questions).
#[derive(Clone, Debug)]
pub struct RawSyncResult {
    pub blocks: Vec<RawBlock>,
    pub synced: bool,
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn info(&self) -> Result<NodeInfo, UpstreamError>;
    async fn peers(&self) -> Result<PeerList, UpstreamError>;
    async fn raw_transaction_pool(&self) -> Result<Vec<RawPoolTransaction>, UpstreamError>;
    async fn raw_block(&self, which: HeightOrHash) -> Result<RawBlock, UpstreamError>;
    async fn block_header(&self, which: HeightOrHash) -> Result<BlockHeader, UpstreamError>;
    /// Global output indexes for every key-type output of every transaction
    /// in `[start, end]`, inclusive.
    async fn indexes(&self, start: u64, end: u64) -> Result<Vec<TransactionGlobalIndexes>, UpstreamError>;
    /// Up to 30 headers, descending from `height_desc`.
    async fn block_headers(&self, height_desc: u64) -> Result<Vec<BlockHeader>, UpstreamError>;
    async fn raw_sync(
        &self,
        checkpoints: &[String],
        height: u64,
        timestamp: i64,
        skip_coinbase_only: bool,
        count: u32,
    ) -> Result<RawSyncResult, UpstreamError>;

    /// Mutating RPCs are not available from a mirrored read-only daemon
    /// (spec.md §4.3/§6); implementations should not call these, they
    /// exist only so a generic caller sees the same method-not-available
    /// failure the storage layer's mirrored surface returns.
    async fn block_template(&self) -> Result<(), UpstreamError> {
        Err(UpstreamError::MethodNotAvailable)
    }
    async fn submit_block(&self) -> Result<(), UpstreamError> {
        Err(UpstreamError::MethodNotAvailable)
    }
    async fn submit_transaction(&self) -> Result<(), UpstreamError> {
        Err(UpstreamError::MethodNotAvailable)
    }
}
