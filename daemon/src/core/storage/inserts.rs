//! Mutating storage operations (spec.md §4.3): `saveRawBlocks`,
//! `saveBlocksMeta`, `saveOutputGlobalIndexes`, `saveTransactionPool`,
//! `saveInformation`/`savePeers`. Bulk inserts are chunked to
//! [`crate::config::BULK_INSERT_CHUNK`] value-rows per statement
//! (grounded on the `QueryBuilder::push_values` idiom used by production
//! sqlx-backed chain indexers for exactly this shape of write).

use blockdb_common::model::{BlockHeader, DecodedBlock, DecodedTransaction, Hash, Input, NodeInfo, Output, PeerList};
use sqlx::{Any, QueryBuilder};

use crate::config::BULK_INSERT_CHUNK;
use crate::core::error::BlockchainResult;

use super::BlockchainDb;

impl BlockchainDb {
    /// Persists an ordered batch of decoded blocks. Rewinds to the lowest
    /// height present in the batch first so re-ingest of an overlapping
    /// range (a reorg, or a retried tick) is idempotent (spec.md §4.3,
    /// I1–I5).
    pub async fn save_raw_blocks(&self, blocks: &[DecodedBlock]) -> BlockchainResult<(Vec<u64>, Vec<Hash>)> {
        if blocks.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let lowest = blocks.iter().map(|b| b.height).min().unwrap();
        self.rewind(lowest).await?;

        let mut tx = self.pool.begin().await?;
        insert_block_rows(&mut tx, blocks).await?;
        tx.commit().await?;

        let mut heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
        heights.sort_unstable();
        let hashes: Vec<Hash> = blocks.iter().map(|b| b.hash).collect();

        info!("saved {} raw block(s), heights {}..={}", blocks.len(), heights[0], heights[heights.len() - 1]);
        Ok((heights, hashes))
    }

    /// Single-block insert used by the offload worker (spec.md §4.6): no
    /// rewind, since concurrent workers may be inserting unrelated heights
    /// at once. Returns `false` without writing if the block already
    /// exists (the worker's idempotent short-circuit).
    pub async fn insert_block_if_new(&self, block: &DecodedBlock) -> BlockchainResult<bool> {
        if self.hash_exists(block.hash).await? {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        insert_block_rows(&mut tx, std::slice::from_ref(block)).await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn hash_exists(&self, hash: Hash) -> BlockchainResult<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM blocks WHERE hash = ?")
            .bind(hash.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

async fn insert_block_rows(tx: &mut sqlx::Transaction<'_, Any>, blocks: &[DecodedBlock]) -> BlockchainResult<()> {
    for chunk in blocks.chunks(BULK_INSERT_CHUNK) {
        let mut qb: QueryBuilder<Any> = QueryBuilder::new("INSERT INTO blocks (hash, data) ");
        qb.push_values(chunk, |mut b, blk| {
            b.push_bind(blk.hash.to_hex());
            b.push_bind(blk.raw.clone());
        });
        qb.build().execute(&mut *tx).await?;
    }

    for chunk in blocks.chunks(BULK_INSERT_CHUNK) {
        let mut qb: QueryBuilder<Any> =
            QueryBuilder::new("INSERT INTO blockchain (height, hash, utctimestamp) ");
        qb.push_values(chunk, |mut b, blk| {
            b.push_bind(blk.height as i64);
            b.push_bind(blk.hash.to_hex());
            b.push_bind(blk.timestamp);
        });
        qb.build().execute(&mut *tx).await?;
    }

    let txns: Vec<_> = blocks.iter().flat_map(|b| b.transactions.iter().map(move |t| (b, t))).collect();

    for chunk in txns.chunks(BULK_INSERT_CHUNK) {
        let mut qb: QueryBuilder<Any> =
            QueryBuilder::new("INSERT INTO transactions (hash, block_hash, coinbase, data) ");
        qb.push_values(chunk, |mut b, (blk, t)| {
            b.push_bind(t.hash.to_hex());
            b.push_bind(blk.hash.to_hex());
            b.push_bind(t.coinbase);
            b.push_bind(t.raw.clone());
        });
        qb.build().execute(&mut *tx).await?;
    }

    for chunk in txns.chunks(BULK_INSERT_CHUNK) {
        let mut qb: QueryBuilder<Any> =
            QueryBuilder::new("INSERT INTO transaction_meta (hash, fee, amount, size) ");
        qb.push_values(chunk, |mut b, (_, t)| {
            b.push_bind(t.hash.to_hex());
            b.push_bind(t.fee as i64);
            b.push_bind(t.amount as i64);
            b.push_bind(t.size as i64);
        });
        qb.build().execute(&mut *tx).await?;
    }

    let inputs: Vec<_> = txns
        .iter()
        .flat_map(|(_, t)| t.inputs.iter().filter_map(move |i| match i {
            Input::Key { amount, key_image, .. } => Some((t.hash, *amount, *key_image)),
            Input::Coinbase { .. } => None,
        }))
        .collect();

    for chunk in inputs.chunks(BULK_INSERT_CHUNK) {
        let mut qb: QueryBuilder<Any> =
            QueryBuilder::new("INSERT INTO transaction_inputs (hash, keyImage, amount) ");
        qb.push_values(chunk, |mut b, (hash, amount, key_image)| {
            b.push_bind(hash.to_hex());
            b.push_bind(key_image.to_hex());
            b.push_bind(*amount as i64);
        });
        qb.build().execute(&mut *tx).await?;
    }

    let outputs: Vec<_> = txns
        .iter()
        .flat_map(|(_, t)| {
            t.outputs.iter().enumerate().map(move |(idx, o)| match o {
                Output::Key { amount, key } => (t.hash, idx as i64, *amount, *key),
            })
        })
        .collect();

    for chunk in outputs.chunks(BULK_INSERT_CHUNK) {
        let mut qb: QueryBuilder<Any> =
            QueryBuilder::new("INSERT INTO transaction_outputs (hash, idx, amount, outputKey) ");
        qb.push_values(chunk, |mut b, (hash, idx, amount, key)| {
            b.push_bind(hash.to_hex());
            b.push_bind(*idx);
            b.push_bind(*amount as i64);
            b.push_bind(key.to_hex());
        });
        qb.build().execute(&mut *tx).await?;
    }

    let payment_ids: Vec<_> = txns
        .iter()
        .filter_map(|(_, t)| t.payment_id.map(|pid| (t.hash, pid)))
        .collect();

    for chunk in payment_ids.chunks(BULK_INSERT_CHUNK) {
        let mut qb: QueryBuilder<Any> =
            QueryBuilder::new("INSERT INTO transaction_paymentids (hash, paymentId) ");
        qb.push_values(chunk, |mut b, (hash, pid)| {
            b.push_bind(hash.to_hex());
            b.push_bind(pid.to_hex());
        });
        qb.build().execute(&mut *tx).await?;
    }

    Ok(())
}

impl BlockchainDb {
    /// Deduplicates by hash, then for each header DELETE+INSERT its
    /// `block_meta` row so re-ingest is idempotent (spec.md §4.3).
    pub async fn save_blocks_meta(&self, headers: &[BlockHeader]) -> BlockchainResult<()> {
        if headers.is_empty() {
            return Ok(());
        }

        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<&BlockHeader> = headers.iter().filter(|h| seen.insert(h.hash)).collect();

        let mut tx = self.pool.begin().await?;

        for chunk in deduped.chunks(BULK_INSERT_CHUNK) {
            let hashes: Vec<String> = chunk.iter().map(|h| h.hash.to_hex()).collect();
            let placeholders = hashes.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!("DELETE FROM block_meta WHERE hash IN ({placeholders})");
            let mut q = sqlx::query(&sql);
            for h in &hashes {
                q = q.bind(h.clone());
            }
            q.execute(&mut *tx).await?;
        }

        for chunk in deduped.chunks(BULK_INSERT_CHUNK) {
            let mut qb: QueryBuilder<Any> = QueryBuilder::new(
                "INSERT INTO block_meta (hash, prevHash, baseReward, difficulty, majorVersion, minorVersion, \
                 nonce, size, alreadyGeneratedCoins, alreadyGeneratedTransactions, reward, sizeMedian, \
                 totalFeeAmount, transactionsCumulativeSize, transactionsCount, orphan, penalty) ",
            );
            qb.push_values(chunk, |mut b, h| {
                b.push_bind(h.hash.to_hex());
                b.push_bind(h.prev_hash.to_hex());
                b.push_bind(h.base_reward as i64);
                b.push_bind(h.difficulty as i64);
                b.push_bind(h.major_version as i32);
                b.push_bind(h.minor_version as i32);
                b.push_bind(h.nonce as i64);
                b.push_bind(h.size as i64);
                b.push_bind(h.already_generated_coins as i64);
                b.push_bind(h.already_generated_transactions as i64);
                b.push_bind(h.reward as i64);
                b.push_bind(h.size_median as i64);
                b.push_bind(h.total_fee_amount as i64);
                b.push_bind(h.transactions_cumulative_size as i64);
                b.push_bind(h.transactions_count as i32);
                b.push_bind(h.orphan);
                b.push_bind(h.penalty);
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!("saved block_meta for {} header(s)", deduped.len());
        Ok(())
    }

    /// UPDATEs `transaction_outputs.globalIdx` for each `(hash, idx)` pair,
    /// all inside one transaction (spec.md §4.3, I5).
    pub async fn save_output_global_indexes(&self, indexes: &[(Hash, u32, u64)]) -> BlockchainResult<()> {
        if indexes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (hash, idx, global_idx) in indexes {
            sqlx::query("UPDATE transaction_outputs SET globalIdx = ? WHERE hash = ? AND idx = ?")
                .bind(*global_idx as i64)
                .bind(hash.to_hex())
                .bind(*idx as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!("updated global indexes for {} output(s)", indexes.len());
        Ok(())
    }

    /// Snapshot-replaces `transaction_pool` in its entirety (spec.md §3, I6).
    pub async fn save_transaction_pool(&self, txns: &[DecodedTransaction]) -> BlockchainResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM transaction_pool").execute(&mut *tx).await?;

        for chunk in txns.chunks(BULK_INSERT_CHUNK) {
            if chunk.is_empty() {
                continue;
            }
            let mut qb: QueryBuilder<Any> =
                QueryBuilder::new("INSERT INTO transaction_pool (hash, fee, size, amount, data) ");
            qb.push_values(chunk, |mut b, t| {
                b.push_bind(t.hash.to_hex());
                b.push_bind(t.fee as i64);
                b.push_bind(t.size as i64);
                b.push_bind(t.amount as i64);
                b.push_bind(t.raw.clone());
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!("replaced transaction pool with {} transaction(s)", txns.len());
        Ok(())
    }

    async fn upsert_information(&self, key: &str, payload: &serde_json::Value) -> BlockchainResult<()> {
        let data = serde_json::to_vec(payload).map_err(|e| crate::core::error::BlockchainError::Other(e.to_string()))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM information WHERE idx = ?").bind(key).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO information (idx, data) VALUES (?, ?)")
            .bind(key)
            .bind(data)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn save_information(&self, info: &NodeInfo) -> BlockchainResult<()> {
        let value = serde_json::to_value(info).map_err(|e| crate::core::error::BlockchainError::Other(e.to_string()))?;
        self.upsert_information("info", &value).await
    }

    pub async fn save_peers(&self, peers: &PeerList) -> BlockchainResult<()> {
        let value = serde_json::to_value(peers).map_err(|e| crate::core::error::BlockchainError::Other(e.to_string()))?;
        self.upsert_information("peers", &value).await
    }
}
