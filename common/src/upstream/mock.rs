//! An in-memory [`UpstreamClient`] for exercising the synchronization
//! engine without a live upstream daemon.

use super::{HeightOrHash, RawSyncResult, UpstreamClient};
use crate::error::UpstreamError;
use crate::model::{BlockHeader, NodeInfo, PeerList, RawBlock, RawPoolTransaction, TransactionGlobalIndexes};
use async_trait::async_trait;
use std::sync::Mutex;

/// A scripted chain of raw blocks plus headers/indexes, served back to the
/// caller as if it were a real upstream node. Tests construct one of these
/// to drive the `Collector` deterministically.
pub struct MockUpstream {
    pub blocks: Vec<RawBlock>,
    pub headers: Vec<BlockHeader>,
    pub indexes: Vec<TransactionGlobalIndexes>,
    pub pool: Mutex<Vec<RawPoolTransaction>>,
    pub info: Mutex<NodeInfo>,
    pub peers: Mutex<PeerList>,
    /// When set, the next N calls to the named method fail with this error.
    pub fail_next: Mutex<Option<(&'static str, UpstreamError)>>,
}

impl MockUpstream {
    pub fn empty() -> Self {
        Self {
            blocks: Vec::new(),
            headers: Vec::new(),
            indexes: Vec::new(),
            pool: Mutex::new(Vec::new()),
            info: Mutex::new(NodeInfo {
                height: 0,
                network_height: 0,
                difficulty: 0,
                major_version: 1,
                minor_version: 0,
                synced: true,
                is_cache_api: false,
                hashrate: 0,
                last_block_index: 0,
                transactions_size: 0,
                extra: Default::default(),
            }),
            peers: Mutex::new(PeerList { peers: Vec::new(), extra: Default::default() }),
            fail_next: Mutex::new(None),
        }
    }

    fn maybe_fail(&self, method: &'static str) -> Result<(), UpstreamError> {
        let mut guard = self.fail_next.lock().unwrap();
        if let Some((target, _)) = guard.as_ref() {
            if *target == method {
                let (_, err) = guard.take().unwrap();
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn info(&self) -> Result<NodeInfo, UpstreamError> {
        self.maybe_fail("info")?;
        Ok(self.info.lock().unwrap().clone())
    }

    async fn peers(&self) -> Result<PeerList, UpstreamError> {
        self.maybe_fail("peers")?;
        Ok(self.peers.lock().unwrap().clone())
    }

    async fn raw_transaction_pool(&self) -> Result<Vec<RawPoolTransaction>, UpstreamError> {
        self.maybe_fail("raw_transaction_pool")?;
        Ok(self.pool.lock().unwrap().clone())
    }

    async fn raw_block(&self, which: HeightOrHash) -> Result<RawBlock, UpstreamError> {
        self.maybe_fail("raw_block")?;
        match which {
            HeightOrHash::Height(h) => self
                .blocks
                .get(h as usize)
                .cloned()
                .ok_or_else(|| UpstreamError::NotFound(format!("block {h}"))),
            HeightOrHash::Hash(_) => Err(UpstreamError::NotFound("mock lookup by hash unsupported".into())),
        }
    }

    async fn block_header(&self, which: HeightOrHash) -> Result<BlockHeader, UpstreamError> {
        self.maybe_fail("block_header")?;
        match which {
            HeightOrHash::Height(h) => self
                .headers
                .get(h as usize)
                .cloned()
                .ok_or_else(|| UpstreamError::NotFound(format!("header {h}"))),
            HeightOrHash::Hash(_) => Err(UpstreamError::NotFound("mock lookup by hash unsupported".into())),
        }
    }

    async fn indexes(&self, start: u64, end: u64) -> Result<Vec<TransactionGlobalIndexes>, UpstreamError> {
        self.maybe_fail("indexes")?;
        let matching: Vec<_> = self
            .headers
            .iter()
            .enumerate()
            .filter(|(h, _)| *h as u64 >= start && *h as u64 <= end)
            .flat_map(|(h, _)| {
                self.blocks
                    .get(h)
                    .map(|_| self.indexes.iter().cloned())
                    .into_iter()
                    .flatten()
            })
            .collect();
        Ok(matching)
    }

    async fn block_headers(&self, height_desc: u64) -> Result<Vec<BlockHeader>, UpstreamError> {
        self.maybe_fail("block_headers")?;
        let mut out = Vec::new();
        let mut h = height_desc;
        for _ in 0..30 {
            if let Some(header) = self.headers.get(h as usize) {
                out.push(header.clone());
            }
            if h == 0 {
                break;
            }
            h -= 1;
        }
        Ok(out)
    }

    async fn raw_sync(
        &self,
        checkpoints: &[String],
        height: u64,
        _timestamp: i64,
        skip_coinbase_only: bool,
        count: u32,
    ) -> Result<RawSyncResult, UpstreamError> {
        self.maybe_fail("raw_sync")?;
        let mut start = height as usize;
        for (h, header) in self.headers.iter().enumerate() {
            if checkpoints.iter().any(|c| c == &header.hash.to_hex()) {
                start = start.max(h + 1);
            }
        }

        let mut blocks = Vec::new();
        let mut h = start;
        while blocks.len() < count as usize && h < self.blocks.len() {
            let block = &self.blocks[h];
            if !skip_coinbase_only || block.transaction_blobs.len() > 0 {
                blocks.push(block.clone());
            }
            h += 1;
        }
        let synced = blocks.is_empty();
        Ok(RawSyncResult { blocks, synced })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Hash;

    fn header_at(height: u64) -> BlockHeader {
        let mut bytes = [0u8; crate::model::HASH_SIZE];
        bytes[0..8].copy_from_slice(&height.to_le_bytes());
        BlockHeader {
            hash: Hash::new(bytes),
            height,
            prev_hash: Hash::zero(),
            timestamp: 0,
            major_version: 1,
            minor_version: 0,
            nonce: 0,
            size: 0,
            difficulty: 1,
            reward: 0,
            base_reward: 0,
            already_generated_coins: 0,
            already_generated_transactions: 0,
            size_median: 0,
            total_fee_amount: 0,
            transactions_cumulative_size: 0,
            transactions_count: 0,
            orphan: false,
            penalty: 0.0,
        }
    }

    fn block() -> RawBlock {
        RawBlock { block_blob: vec![], transaction_blobs: vec![] }
    }

    #[tokio::test]
    async fn maybe_fail_triggers_exactly_once_for_the_targeted_method() {
        let mock = MockUpstream::empty();
        *mock.fail_next.lock().unwrap() = Some(("info", UpstreamError::NotFound("boom".into())));

        assert!(mock.info().await.is_err());
        assert!(mock.info().await.is_ok());
    }

    #[tokio::test]
    async fn maybe_fail_ignores_non_targeted_methods() {
        let mock = MockUpstream::empty();
        *mock.fail_next.lock().unwrap() = Some(("info", UpstreamError::NotFound("boom".into())));

        assert!(mock.peers().await.is_ok());
        assert!(mock.info().await.is_err());
    }

    #[tokio::test]
    async fn raw_sync_resumes_just_past_the_highest_known_checkpoint() {
        let mut mock = MockUpstream::empty();
        mock.blocks = vec![block(), block(), block(), block()];
        mock.headers = vec![header_at(0), header_at(1), header_at(2), header_at(3)];

        let checkpoints = vec![header_at(1).hash.to_hex()];
        let result = mock.raw_sync(&checkpoints, 0, 0, false, 100).await.unwrap();

        assert_eq!(result.blocks.len(), 2);
        assert!(!result.synced);
    }

    #[tokio::test]
    async fn raw_sync_reports_synced_once_every_block_has_been_returned() {
        let mut mock = MockUpstream::empty();
        mock.blocks = vec![block()];
        mock.headers = vec![header_at(0)];

        let checkpoints = vec![header_at(0).hash.to_hex()];
        let result = mock.raw_sync(&checkpoints, 0, 0, false, 100).await.unwrap();

        assert!(result.blocks.is_empty());
        assert!(result.synced);
    }
}
