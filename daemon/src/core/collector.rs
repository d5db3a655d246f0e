//! The synchronization engine (spec.md §4.5): the daemon's core control
//! loop. Three independent 5-second tickers (info, pool, sync) poll the
//! upstream node and mirror it into storage. Each ticker serializes
//! against itself by construction — a ticker is just a loop that runs its
//! body to completion before sleeping for the next period, so two ticks
//! of the same kind can never overlap.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use blockdb_common::model::{BlockHeader, Hash, RawBlock, TransactionGlobalIndexes};
use blockdb_common::upstream::{HeightOrHash, UpstreamClient};

use crate::config::{
    DEFAULT_BATCH_SIZE, HEADER_BULK_RETRY_LIMIT, HEADER_CHUNK, INDEX_CHUNK, MIN_BATCH_SIZE, TICKER_PERIOD_MS,
};
use crate::core::codec::CodecAdapter;
use crate::core::error::{BlockchainError, BlockchainResult};
use crate::core::storage::BlockchainDb;

pub struct Collector {
    db: Arc<BlockchainDb>,
    upstream: Arc<dyn UpstreamClient>,
    codec: Arc<CodecAdapter>,
    batch_size: AtomicU32,
    running: AtomicBool,
    destroyed: AtomicBool,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(db: Arc<BlockchainDb>, upstream: Arc<dyn UpstreamClient>, codec: Arc<CodecAdapter>) -> Arc<Self> {
        Arc::new(Self {
            db,
            upstream,
            codec,
            batch_size: AtomicU32::new(DEFAULT_BATCH_SIZE),
            running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            handles: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Startup sequence (spec.md §4.5): consistency recovery, genesis
    /// bootstrap if needed, then registers the three tickers. Destroyed
    /// instances cannot be restarted; construct a new [`Collector`].
    pub async fn init(self: Arc<Self>) -> BlockchainResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BlockchainError::Startup("collector already destroyed".into()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BlockchainError::Startup("collector already running".into()));
        }

        self.db.repair_consistency().await?;

        if !self.db.have_genesis().await? {
            info!("no genesis block present, bootstrapping height 0");
            self.bootstrap_genesis().await.map_err(|e| {
                BlockchainError::Startup(format!("genesis bootstrap failed, cannot continue: {e}"))
            })?;
        }

        self.clone().spawn_ticker("info", |c| Box::pin(async move { c.info_tick().await }));
        self.clone().spawn_ticker("pool", |c| Box::pin(async move { c.pool_tick().await }));
        self.clone().spawn_ticker("sync", |c| Box::pin(async move { c.sync_tick().await }));

        info!("collector started");
        Ok(())
    }

    async fn bootstrap_genesis(&self) -> BlockchainResult<()> {
        let raw = self.upstream.raw_block(HeightOrHash::Height(0)).await?;
        let header = self.upstream.block_header(HeightOrHash::Height(0)).await?;
        let indexes = self.upstream.indexes(0, 0).await?;

        let block = self.codec.decode_block(0, raw)?;
        self.db.save_raw_blocks(&[block]).await?;
        self.db.save_output_global_indexes(&flatten_indexes(&indexes)).await?;
        self.db.save_blocks_meta(&[header]).await?;
        Ok(())
    }

    fn spawn_ticker<F>(self: Arc<Self>, name: &'static str, body: F)
    where
        F: Fn(Arc<Self>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + 'static,
    {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(TICKER_PERIOD_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.destroyed.load(Ordering::SeqCst) {
                    debug!("{name} ticker stopping, collector destroyed");
                    return;
                }
                body(this.clone()).await;
            }
        });
        self.handles.lock().unwrap().push(handle);
    }

    /// Fetches `/info` and `/peers` and upserts them. Errors are logged
    /// and swallowed; the next tick retries (spec.md §4.5).
    async fn info_tick(&self) {
        match self.upstream.info().await {
            Ok(info) => {
                if let Err(e) = self.db.save_information(&info).await {
                    warn!("info tick: failed to save node info: {e}");
                }
            }
            Err(e) => warn!("info tick: failed to fetch /info: {e}"),
        }

        match self.upstream.peers().await {
            Ok(peers) => {
                if let Err(e) = self.db.save_peers(&peers).await {
                    warn!("info tick: failed to save peers: {e}");
                }
            }
            Err(e) => warn!("info tick: failed to fetch /peers: {e}"),
        }
    }

    /// Replaces the mempool snapshot. Errors are swallowed (spec.md §4.5).
    async fn pool_tick(&self) {
        let raw = match self.upstream.raw_transaction_pool().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("pool tick: failed to fetch raw transaction pool: {e}");
                return;
            }
        };

        let mut decoded = Vec::with_capacity(raw.len());
        for tx in raw {
            match self.codec.decode_pool_transaction(&tx.blob) {
                Ok(t) => decoded.push(t),
                Err(e) => {
                    warn!("pool tick: failed to decode pool transaction, skipping: {e}");
                }
            }
        }

        if let Err(e) = self.db.save_transaction_pool(&decoded).await {
            warn!("pool tick: failed to replace transaction pool: {e}");
        }
    }

    /// The engine's heart (spec.md §4.5): pulls a batch of new blocks from
    /// upstream and mirrors them, recovering by rewind-and-shrink-batch on
    /// any failure in steps 2-9.
    async fn sync_tick(&self) {
        if let Err(e) = self.sync_tick_inner().await {
            warn!("sync tick failed: {e}");
        }
    }

    async fn sync_tick_inner(&self) -> BlockchainResult<()> {
        self.db.repair_consistency().await?;

        let checkpoints = self.db.hashes_for_sync().await?;
        let mut min_height = 0u64;
        for cp in &checkpoints {
            if let Some(h) = self.db.height_from_hash(*cp).await? {
                min_height = h;
                break;
            }
        }

        let result = self.run_sync_body(&checkpoints, min_height).await;

        match result {
            Ok(()) => {
                self.increase_block_batch_size();
                Ok(())
            }
            Err((rewind_height, e)) => {
                warn!("sync tick body failed, rewinding to height {rewind_height} and shrinking batch: {e}");
                self.db.rewind(rewind_height).await?;
                self.reduce_block_batch_size();
                Err(e)
            }
        }
    }

    /// Runs steps 2-9 of the sync tick. On failure, returns the height to
    /// rewind to alongside the error: step 6 may have redefined `min_height`
    /// from the just-inserted batch's lowest height (spec.md §4.5 step 10),
    /// so a failure in steps 7-9 must roll back to that, not to the
    /// checkpoint-derived height the tick started with.
    async fn run_sync_body(&self, checkpoints: &[Hash], mut min_height: u64) -> Result<(), (u64, BlockchainError)> {
        let checkpoint_hex: Vec<String> = checkpoints.iter().map(|h| h.to_hex()).collect();
        let batch_size = self.batch_size.load(Ordering::SeqCst);

        let sync_result = self
            .upstream
            .raw_sync(&checkpoint_hex, 0, 0, false, batch_size)
            .await
            .map_err(|e| (min_height, e.into()))?;
        if sync_result.blocks.is_empty() {
            return Ok(());
        }

        let decoded = self.decode_raw_blocks(sync_result.blocks, min_height).map_err(|e| (min_height, e))?;
        let (heights, hashes) = self.db.save_raw_blocks(&decoded).await.map_err(|e| (min_height, e))?;

        let max_height = *heights.last().unwrap_or(&0);
        min_height = *heights.first().unwrap_or(&min_height);

        let expected_tx_count: usize = decoded.iter().map(|b| b.transactions.len()).sum();
        let indexes = self
            .fetch_output_indexes(min_height, max_height, expected_tx_count)
            .await
            .map_err(|e| (min_height, e))?;
        self.db.save_output_global_indexes(&flatten_indexes(&indexes)).await.map_err(|e| (min_height, e))?;

        let hash_set: std::collections::HashSet<Hash> = hashes.into_iter().collect();
        let headers = self.fetch_headers(min_height, max_height, &hash_set).await.map_err(|e| (min_height, e))?;
        self.db.save_blocks_meta(&headers).await.map_err(|e| (min_height, e))?;

        Ok(())
    }

    /// `rawSync` returns blocks in ascending height order starting just
    /// above the last locally-known checkpoint; `from_height` is that
    /// checkpoint's height, so block `i` is a hint for `from_height + 1 +
    /// i` (spec.md §4.1 leaves final height resolution to the codec,
    /// which may override it from data embedded in the blob).
    fn decode_raw_blocks(
        &self,
        blocks: Vec<RawBlock>,
        from_height: u64,
    ) -> BlockchainResult<Vec<blockdb_common::model::DecodedBlock>> {
        blocks
            .into_iter()
            .enumerate()
            .map(|(i, raw)| self.codec.decode_block(from_height + 1 + i as u64, raw))
            .collect()
    }

    /// Index-fetch subroutine (spec.md §4.5): one full-range attempt, then
    /// chunked-and-retried on a count mismatch.
    async fn fetch_output_indexes(
        &self,
        min_height: u64,
        max_height: u64,
        expected_tx_count: usize,
    ) -> BlockchainResult<Vec<TransactionGlobalIndexes>> {
        if let Ok(full) = self.upstream.indexes(min_height, max_height).await {
            if full.len() == expected_tx_count {
                return Ok(full);
            }
        }

        let mut out = Vec::new();
        let mut start = min_height;
        while start <= max_height {
            let end = (start + INDEX_CHUNK - 1).min(max_height);
            loop {
                match self.upstream.indexes(start, end).await {
                    Ok(chunk) => {
                        out.extend(chunk);
                        break;
                    }
                    Err(e) => {
                        warn!("index fetch [{start}, {end}] failed, retrying: {e}");
                    }
                }
            }
            start = end + 1;
        }

        if out.len() != expected_tx_count {
            return Err(BlockchainError::Other(format!(
                "index fetch returned {} entries, expected {expected_tx_count}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Header-fetch subroutine (spec.md §4.5): walks the range in
    /// 30-height chunks, falling back to per-height fetches when the bulk
    /// RPC returns empty, then filters to hashes actually persisted.
    async fn fetch_headers(
        &self,
        min_height: u64,
        max_height: u64,
        persisted: &std::collections::HashSet<Hash>,
    ) -> BlockchainResult<Vec<BlockHeader>> {
        let mut collected: Vec<BlockHeader> = Vec::new();
        let mut height = max_height;

        loop {
            let mut attempts = 0;
            let mut headers: Vec<BlockHeader> = Vec::new();
            loop {
                match self.upstream.block_headers(height).await {
                    Ok(h) if !h.is_empty() => {
                        headers = h;
                        break;
                    }
                    Ok(_) => break,
                    Err(e) => {
                        attempts += 1;
                        if attempts >= HEADER_BULK_RETRY_LIMIT {
                            warn!("bulk header fetch at height {height} gave up after {attempts} attempts: {e}");
                            break;
                        }
                    }
                }
            }

            if headers.is_empty() {
                let floor = height.saturating_sub(HEADER_CHUNK - 1);
                for h in (floor..=height).rev() {
                    loop {
                        match self.upstream.block_header(HeightOrHash::Height(h)).await {
                            Ok(header) => {
                                headers.push(header);
                                break;
                            }
                            Err(e) => warn!("single header fetch at height {h} failed, retrying: {e}"),
                        }
                    }
                }
            }

            collected.extend(headers);

            if height <= min_height + HEADER_CHUNK - 1 || height < HEADER_CHUNK {
                break;
            }
            height -= HEADER_CHUNK;
        }

        let mut seen = std::collections::HashSet::new();
        let filtered = collected
            .into_iter()
            .filter(|h| persisted.contains(&h.hash))
            .filter(|h| seen.insert(h.hash))
            .collect();
        Ok(filtered)
    }

    fn increase_block_batch_size(&self) {
        let current = self.batch_size.load(Ordering::SeqCst);
        if current >= DEFAULT_BATCH_SIZE {
            return;
        }
        let increased = ((current as f64 * 1.25).ceil() as u32).min(DEFAULT_BATCH_SIZE);
        self.batch_size.store(increased, Ordering::SeqCst);
    }

    fn reduce_block_batch_size(&self) {
        let current = self.batch_size.load(Ordering::SeqCst);
        if current <= MIN_BATCH_SIZE {
            return;
        }
        let reduced = ((current as f64 / 2.0).ceil() as u32).max(MIN_BATCH_SIZE);
        self.batch_size.store(reduced, Ordering::SeqCst);
    }

    /// Destroys all three tickers and marks the collector unusable. A new
    /// instance must be constructed to resume (spec.md §4.5).
    pub fn stop(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        info!("collector stopped");
    }
}

fn flatten_indexes(indexes: &[TransactionGlobalIndexes]) -> Vec<(Hash, u32, u64)> {
    indexes
        .iter()
        .flat_map(|entry| entry.indexes.iter().enumerate().map(move |(idx, global_idx)| (entry.hash, idx as u32, *global_idx)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockdb_common::codec::{BlockCodec, CodecError};
    use blockdb_common::config::{DbBackend, DbConfig};
    use blockdb_common::model::{DecodedBlock, DecodedTransaction, HASH_SIZE};
    use blockdb_common::upstream::mock::MockUpstream;

    /// Derives a deterministic hash/prev_hash pair from a height alone, so
    /// tests never need real block-blob bytes. Independent of the
    /// production codec, which is out of scope (spec.md §1).
    fn test_hash(height: u64) -> Hash {
        let mut bytes = [0u8; HASH_SIZE];
        bytes[0..8].copy_from_slice(&height.to_le_bytes());
        Hash::new(bytes)
    }

    struct TestCodec;

    impl BlockCodec for TestCodec {
        fn decode_block(&self, height: u64, raw: RawBlock) -> Result<DecodedBlock, CodecError> {
            Ok(DecodedBlock {
                hash: test_hash(height),
                height,
                timestamp: 1_700_000_000 + height as i64,
                prev_hash: if height == 0 { Hash::zero() } else { test_hash(height - 1) },
                major_version: 1,
                minor_version: 0,
                nonce: 0,
                base_reward: 1000,
                difficulty: 1,
                reward: 1000,
                size_median: 300,
                already_generated_coins: 0,
                already_generated_transactions: 0,
                raw: raw.block_blob,
                transactions: vec![],
            })
        }

        fn decode_transaction(&self, _blob: &[u8]) -> Result<DecodedTransaction, CodecError> {
            Err(CodecError::Transaction { index: 0, source: "not exercised by these tests".into() })
        }
    }

    fn test_header(height: u64) -> BlockHeader {
        BlockHeader {
            hash: test_hash(height),
            height,
            prev_hash: if height == 0 { Hash::zero() } else { test_hash(height - 1) },
            timestamp: 1_700_000_000 + height as i64,
            major_version: 1,
            minor_version: 0,
            nonce: 0,
            size: 100,
            difficulty: 1,
            reward: 1000,
            base_reward: 1000,
            already_generated_coins: 0,
            already_generated_transactions: 0,
            size_median: 300,
            total_fee_amount: 0,
            transactions_cumulative_size: 0,
            transactions_count: 0,
            orphan: false,
            penalty: 0.0,
        }
    }

    async fn memory_db() -> Arc<BlockchainDb> {
        let cfg = DbConfig {
            backend: DbBackend::Sqlite,
            sqlite_path: ":memory:".into(),
            host: None,
            port: None,
            user: None,
            pass: None,
            name: None,
        };
        Arc::new(BlockchainDb::connect(&cfg).await.unwrap())
    }

    fn chain_of(height: u64) -> (Vec<RawBlock>, Vec<BlockHeader>) {
        let blocks = (0..=height).map(|_| RawBlock { block_blob: vec![], transaction_blobs: vec![] }).collect();
        let headers = (0..=height).map(test_header).collect();
        (blocks, headers)
    }

    fn collector_with(db: Arc<BlockchainDb>, upstream: MockUpstream) -> Arc<Collector> {
        let codec = Arc::new(CodecAdapter::new(Arc::new(TestCodec)));
        Collector::new(db, Arc::new(upstream), codec)
    }

    #[tokio::test]
    async fn sync_tick_pulls_new_blocks_and_keeps_batch_size_at_the_ceiling() {
        let db = memory_db().await;
        let (blocks, headers) = chain_of(3);
        let mut upstream = MockUpstream::empty();
        upstream.blocks = blocks;
        upstream.headers = headers;
        let collector = collector_with(db.clone(), upstream);

        collector.bootstrap_genesis().await.unwrap();
        assert_eq!(db.top_height().await.unwrap(), Some(0));

        collector.sync_tick_inner().await.unwrap();

        assert_eq!(db.top_height().await.unwrap(), Some(3));
        assert_eq!(collector.batch_size.load(Ordering::SeqCst), DEFAULT_BATCH_SIZE);
        let (consistent, _) = db.check_consistency().await.unwrap();
        assert!(consistent);
    }

    #[tokio::test]
    async fn sync_tick_failure_rewinds_to_the_checkpoint_and_shrinks_the_batch() {
        let db = memory_db().await;
        let (blocks, headers) = chain_of(3);
        let mut upstream = MockUpstream::empty();
        upstream.blocks = blocks;
        upstream.headers = headers;
        *upstream.fail_next.lock().unwrap() = Some(("raw_sync", blockdb_common::error::UpstreamError::NotFound("offline".into())));
        let collector = collector_with(db.clone(), upstream);

        collector.bootstrap_genesis().await.unwrap();

        let result = collector.sync_tick_inner().await;

        assert!(result.is_err());
        assert_eq!(db.top_height().await.unwrap(), Some(0));
        assert_eq!(collector.batch_size.load(Ordering::SeqCst), ((DEFAULT_BATCH_SIZE as f64 / 2.0).ceil() as u32));
    }

    #[tokio::test]
    async fn batch_size_saturates_at_its_floor_and_ceiling() {
        let db = memory_db().await;
        let upstream = MockUpstream::empty();
        let collector = collector_with(db, upstream);

        collector.batch_size.store(DEFAULT_BATCH_SIZE, Ordering::SeqCst);
        collector.increase_block_batch_size();
        assert_eq!(collector.batch_size.load(Ordering::SeqCst), DEFAULT_BATCH_SIZE);

        collector.batch_size.store(MIN_BATCH_SIZE, Ordering::SeqCst);
        collector.reduce_block_batch_size();
        assert_eq!(collector.batch_size.load(Ordering::SeqCst), MIN_BATCH_SIZE);
    }
}
