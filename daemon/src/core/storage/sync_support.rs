//! Checkpoint negotiation and the mirrored `rawSync`/`randomIndexes`
//! surface (spec.md §4.3).

use rand::seq::IteratorRandom;
use sqlx::Row;

use super::row_ext::{get_hash, get_i64, get_opt_i64};
use super::BlockchainDb;
use crate::core::error::{BlockchainError, BlockchainResult};
use blockdb_common::codec::BlockCodec;
use blockdb_common::model::{DecodedBlock, Hash, RawBlock};

impl BlockchainDb {
    pub async fn top_height(&self) -> BlockchainResult<Option<u64>> {
        let row = sqlx::query("SELECT MAX(height) AS height FROM blockchain").fetch_one(&self.pool).await?;
        Ok(get_opt_i64(&row, "height")?.map(|h| h as u64))
    }

    pub async fn height_from_hash(&self, hash: Hash) -> BlockchainResult<Option<u64>> {
        let row = sqlx::query("SELECT height FROM blockchain WHERE hash = ?")
            .bind(hash.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| get_i64(&r, "height").map(|h| h as u64)).transpose()
    }

    pub async fn hash_from_height(&self, height: u64) -> BlockchainResult<Option<Hash>> {
        let row = sqlx::query("SELECT hash FROM blockchain WHERE height = ?")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| get_hash(&r, "hash")).transpose()
    }

    pub async fn have_genesis(&self) -> BlockchainResult<bool> {
        Ok(self.hash_from_height(0).await?.is_some())
    }

    pub async fn genesis_hash(&self) -> BlockchainResult<Option<Hash>> {
        self.hash_from_height(0).await
    }

    /// Logarithmic checkpoint list (spec.md §4.3): the top 11 consecutive
    /// hashes descending, then exponentially sparsening hashes below that,
    /// then always the genesis hash, descending, deduplicated.
    pub async fn hashes_for_sync(&self) -> BlockchainResult<Vec<Hash>> {
        let Some(top) = self.top_height().await? else {
            return Ok(Vec::new());
        };

        let mut heights: Vec<u64> = Vec::new();
        let dense_floor = top.saturating_sub(crate::config::CHECKPOINT_DENSE_PREFIX - 1);
        let mut h = top;
        loop {
            heights.push(h);
            if h == dense_floor || h == 0 {
                break;
            }
            h -= 1;
        }

        let lowest_included = *heights.last().unwrap() as i64;
        let mut n: u32 = 1;
        loop {
            let offset = 2i64.pow(n);
            let candidate = lowest_included - offset;
            if candidate < 0 {
                break;
            }
            heights.push(candidate as u64);
            n += 1;
        }

        heights.push(0);

        let mut seen = std::collections::HashSet::new();
        heights.retain(|h| seen.insert(*h));

        let mut hashes = Vec::with_capacity(heights.len());
        for height in heights {
            if let Some(hash) = self.hash_from_height(height).await? {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    /// Resume point negotiation (spec.md §4.3): the max of (a) 1 + height
    /// of the most recent checkpoint present locally, (b) 1 + height of
    /// the most recent block at/below `timestamp` (when > 0), and (c) the
    /// supplied `height`. Falls back to 0 when none apply.
    pub async fn get_sync_height(&self, checkpoints: &[Hash], height: u64, timestamp: i64) -> BlockchainResult<u64> {
        let mut candidate = height;

        if !checkpoints.is_empty() {
            let placeholders = checkpoints.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!(
                "SELECT MAX(height) AS height FROM blockchain WHERE hash IN ({placeholders})"
            );
            let mut q = sqlx::query(&sql);
            for cp in checkpoints {
                q = q.bind(cp.to_hex());
            }
            let row = q.fetch_one(&self.pool).await?;
            if let Some(height) = get_opt_i64(&row, "height")? {
                candidate = candidate.max(height as u64 + 1);
            }
        }

        if timestamp > 0 {
            let row = sqlx::query(
                "SELECT MAX(height) AS height FROM blockchain WHERE utctimestamp <= ?",
            )
            .bind(timestamp)
            .fetch_one(&self.pool)
            .await?;
            if let Some(height) = get_opt_i64(&row, "height")? {
                candidate = candidate.max(height as u64 + 1);
            }
        }

        Ok(candidate)
    }

    /// Mirrored `rawSync`: raw block blob plus non-coinbase transaction
    /// blobs for each block from the resume point onward, read entirely
    /// from the local mirror. `synced` is true exactly when the page is
    /// empty (spec.md §9, preserved intentionally).
    pub async fn raw_sync(
        &self,
        checkpoints: &[Hash],
        height: u64,
        timestamp: i64,
        skip_coinbase_only: bool,
        count: u32,
    ) -> BlockchainResult<(Vec<(u64, Hash, Vec<u8>, Vec<Vec<u8>>)>, bool)> {
        let start = self.get_sync_height(checkpoints, height, timestamp).await?;

        let sql = if skip_coinbase_only {
            "SELECT blocks.hash AS hash, blocks.data AS data, blockchain.height AS height FROM blocks \
             JOIN blockchain ON blockchain.hash = blocks.hash \
             JOIN block_meta ON block_meta.hash = blocks.hash \
             WHERE blockchain.height >= ? AND block_meta.transactionsCount > 1 \
             ORDER BY blockchain.height ASC LIMIT ?"
        } else {
            "SELECT blocks.hash AS hash, blocks.data AS data, blockchain.height AS height FROM blocks \
             JOIN blockchain ON blockchain.hash = blocks.hash \
             WHERE blockchain.height >= ? \
             ORDER BY blockchain.height ASC LIMIT ?"
        };

        let rows = sqlx::query(sql).bind(start as i64).bind(count as i64).fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let hash = get_hash(row, "hash")?;
            let height = get_i64(row, "height")? as u64;
            let data = super::row_ext::get_blob(row, "data")?;
            let tx_rows = sqlx::query("SELECT data FROM transactions WHERE block_hash = ? AND coinbase = ?")
                .bind(hash.to_hex())
                .bind(false)
                .fetch_all(&self.pool)
                .await?;
            let blobs = tx_rows.iter().map(|r| super::row_ext::get_blob(r, "data")).collect::<BlockchainResult<Vec<_>>>()?;
            out.push((height, hash, data, blobs));
        }

        let synced = out.is_empty();
        Ok((out, synced))
    }

    /// Mirrored `sync` (spec.md §4.3): the decoded form of [`Self::raw_sync`],
    /// running each page through the caller-supplied codec rather than
    /// handing back raw blobs. The codec is an external collaborator
    /// (spec.md §1), so it's threaded through as a parameter here rather
    /// than stored on `BlockchainDb` itself.
    pub async fn sync(
        &self,
        codec: &dyn BlockCodec,
        checkpoints: &[Hash],
        height: u64,
        timestamp: i64,
        skip_coinbase_only: bool,
        count: u32,
    ) -> BlockchainResult<(Vec<DecodedBlock>, bool)> {
        let (raw, synced) = self.raw_sync(checkpoints, height, timestamp, skip_coinbase_only, count).await?;

        let decoded = raw
            .into_iter()
            .map(|(height, _hash, data, transaction_blobs)| {
                codec
                    .decode_block(height, RawBlock { block_blob: data, transaction_blobs })
                    .map_err(|e| BlockchainError::Other(format!("failed to decode block at height {height}: {e}")))
            })
            .collect::<BlockchainResult<Vec<_>>>()?;

        Ok((decoded, synced))
    }

    /// `randomIndexes` (spec.md §4.3): for each amount, `count` distinct
    /// uniformly-random global indexes in `[0, maxGlobalIdx(amount)]`,
    /// with the matching output key, ascending.
    pub async fn random_indexes(&self, amounts: &[u64], count: u32) -> BlockchainResult<Vec<Vec<(u64, Hash)>>> {
        let mut out = Vec::with_capacity(amounts.len());

        for &amount in amounts {
            let row = sqlx::query(
                "SELECT MAX(globalIdx) AS maxidx FROM transaction_outputs WHERE amount = ? AND globalIdx IS NOT NULL",
            )
            .bind(amount as i64)
            .fetch_one(&self.pool)
            .await?;

            let max_idx = get_opt_i64(&row, "maxidx")?.ok_or_else(|| {
                BlockchainError::NotFound(format!("no outputs of amount {amount}"))
            })?;

            if max_idx <= count as i64 {
                return Err(BlockchainError::Other(format!(
                    "amount {amount}: requested {count} indexes but only {max_idx} available"
                )));
            }

            let mut rng = rand::thread_rng();
            let chosen: std::collections::BTreeSet<u64> =
                (0..=max_idx as u64).choose_multiple(&mut rng, count as usize).into_iter().collect();

            let placeholders = chosen.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!(
                "SELECT globalIdx, outputKey FROM transaction_outputs WHERE amount = ? AND globalIdx IN ({placeholders}) ORDER BY globalIdx ASC"
            );
            let mut q = sqlx::query(&sql).bind(amount as i64);
            for idx in &chosen {
                q = q.bind(*idx as i64);
            }
            let rows = q.fetch_all(&self.pool).await?;

            let mut pairs = Vec::with_capacity(rows.len());
            for row in &rows {
                let idx = get_i64(row, "globalIdx")? as u64;
                let key = get_hash(row, "outputKey")?;
                pairs.push((idx, key));
            }
            out.push(pairs);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockdb_common::config::{DbBackend, DbConfig};
    use blockdb_common::model::{DecodedBlock, DecodedTransaction};

    async fn memory_db() -> BlockchainDb {
        let cfg = DbConfig {
            backend: DbBackend::Sqlite,
            sqlite_path: ":memory:".into(),
            host: None,
            port: None,
            user: None,
            pass: None,
            name: None,
        };
        BlockchainDb::connect(&cfg).await.unwrap()
    }

    fn chain_block(height: u64) -> DecodedBlock {
        DecodedBlock {
            hash: Hash::new([height as u8; 32]),
            height,
            timestamp: 1_700_000_000 + height as i64,
            prev_hash: Hash::zero(),
            major_version: 1,
            minor_version: 0,
            nonce: 0,
            base_reward: 1000,
            difficulty: 1,
            reward: 1000,
            size_median: 300,
            already_generated_coins: 1000,
            already_generated_transactions: 1,
            raw: vec![],
            transactions: vec![DecodedTransaction {
                hash: Hash::new([(height + 100) as u8; 32]),
                coinbase: true,
                fee: 0,
                amount: 1000,
                size: 100,
                unlock_time: 0,
                public_key: None,
                payment_id: None,
                inputs: vec![],
                outputs: vec![],
                raw: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn hashes_for_sync_is_a_dense_prefix_then_an_exponential_sparsening_then_genesis() {
        let db = memory_db().await;
        let blocks: Vec<_> = (0..=19).map(chain_block).collect();
        db.save_raw_blocks(&blocks).await.unwrap();

        let hashes = db.hashes_for_sync().await.unwrap();
        let expected_heights = [19, 18, 17, 16, 15, 14, 13, 12, 11, 10, 9, 7, 5, 1, 0];
        let expected: Vec<Hash> = expected_heights.iter().map(|&h| chain_block(h).hash).collect();
        assert_eq!(hashes, expected);
    }

    #[tokio::test]
    async fn hashes_for_sync_is_empty_for_an_empty_mirror() {
        let db = memory_db().await;
        assert!(db.hashes_for_sync().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_sync_height_resumes_just_past_the_newest_known_checkpoint() {
        let db = memory_db().await;
        let blocks: Vec<_> = (0..=10).map(chain_block).collect();
        db.save_raw_blocks(&blocks).await.unwrap();

        let checkpoint = chain_block(5).hash;
        let resume = db.get_sync_height(&[checkpoint], 0, 0).await.unwrap();
        assert_eq!(resume, 6);
    }

    #[tokio::test]
    async fn get_sync_height_honors_the_explicit_height_floor_over_a_stale_checkpoint() {
        let db = memory_db().await;
        let blocks: Vec<_> = (0..=10).map(chain_block).collect();
        db.save_raw_blocks(&blocks).await.unwrap();

        let checkpoint = chain_block(2).hash;
        let resume = db.get_sync_height(&[checkpoint], 8, 0).await.unwrap();
        assert_eq!(resume, 8);
    }

    #[tokio::test]
    async fn get_sync_height_uses_the_timestamp_floor_when_it_is_newer() {
        let db = memory_db().await;
        let blocks: Vec<_> = (0..=10).map(chain_block).collect();
        db.save_raw_blocks(&blocks).await.unwrap();

        let resume = db.get_sync_height(&[], 0, 1_700_000_007).await.unwrap();
        assert_eq!(resume, 8);
    }

    #[tokio::test]
    async fn raw_sync_pages_ascending_from_the_resume_point_and_reports_synced_when_empty() {
        let db = memory_db().await;
        let blocks: Vec<_> = (0..=5).map(chain_block).collect();
        db.save_raw_blocks(&blocks).await.unwrap();

        let (page, synced) = db.raw_sync(&[], 2, 0, false, 100).await.unwrap();
        assert_eq!(page.iter().map(|(h, ..)| *h).collect::<Vec<_>>(), vec![2, 3, 4, 5]);
        assert!(!synced);

        let (page, synced) = db.raw_sync(&[], 6, 0, false, 100).await.unwrap();
        assert!(page.is_empty());
        assert!(synced);
    }

    struct EchoCodec;

    impl BlockCodec for EchoCodec {
        fn decode_block(
            &self,
            height: u64,
            _raw: RawBlock,
        ) -> Result<DecodedBlock, blockdb_common::codec::CodecError> {
            Ok(chain_block(height))
        }

        fn decode_transaction(
            &self,
            _blob: &[u8],
        ) -> Result<blockdb_common::model::DecodedTransaction, blockdb_common::codec::CodecError> {
            Err(blockdb_common::codec::CodecError::Transaction { index: 0, source: "not exercised".into() })
        }
    }

    #[tokio::test]
    async fn sync_decodes_each_raw_sync_page_entry_through_the_supplied_codec() {
        let db = memory_db().await;
        let blocks: Vec<_> = (0..=3).map(chain_block).collect();
        db.save_raw_blocks(&blocks).await.unwrap();

        let (decoded, synced) = db.sync(&EchoCodec, &[], 1, 0, false, 100).await.unwrap();

        assert!(!synced);
        assert_eq!(decoded.iter().map(|b| b.height).collect::<Vec<_>>(), vec![1, 2, 3]);
        for block in &decoded {
            assert_eq!(block.raw, vec![]);
        }
    }
}
