//! Read surface mirroring the upstream node (spec.md §4.3/§6), sourced
//! entirely from the mirror. `/info` overwrites several fields from the
//! stored snapshot to reflect the local mirror's own height, per spec.md §6.

use sqlx::Row;
use std::collections::HashMap;

use super::row_ext::{get_blob, get_hash};
use super::BlockchainDb;
use crate::core::error::{BlockchainError, BlockchainResult};
use blockdb_common::model::{BlockHeader, Hash, NodeInfo, PeerList};

#[derive(Clone, Debug)]
pub struct TransactionRecord {
    pub hash: Hash,
    pub block_hash: Hash,
    pub coinbase: bool,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct PoolTransactionRecord {
    pub hash: Hash,
    pub fee: u64,
    pub size: u64,
    pub amount: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct TransactionPoolChanges {
    pub added: Vec<Hash>,
    pub deleted: Vec<Hash>,
}

impl BlockchainDb {
    pub async fn block(&self, height: Option<u64>, hash: Option<Hash>) -> BlockchainResult<Vec<u8>> {
        let row = match (height, hash) {
            (Some(h), _) => {
                sqlx::query("SELECT data FROM blocks JOIN blockchain ON blockchain.hash = blocks.hash WHERE blockchain.height = ?")
                    .bind(h as i64)
                    .fetch_optional(&self.pool)
                    .await?
            }
            (None, Some(hash)) => {
                sqlx::query("SELECT data FROM blocks WHERE hash = ?").bind(hash.to_hex()).fetch_optional(&self.pool).await?
            }
            (None, None) => return Err(BlockchainError::Other("block: one of height/hash required".into())),
        };
        let row = row.ok_or_else(|| BlockchainError::NotFound("block not found".into()))?;
        get_blob(&row, "data")
    }

    /// Alias used by the mirrored read surface for raw block retrieval;
    /// identical to [`Self::block`] (spec.md §4.3 lists both `rawBlock`
    /// and `block` as read operations sourced from the same table).
    pub async fn raw_block(&self, height: Option<u64>, hash: Option<Hash>) -> BlockchainResult<Vec<u8>> {
        self.block(height, hash).await
    }

    pub async fn last_block(&self) -> BlockchainResult<Option<(u64, Hash)>> {
        let row = sqlx::query("SELECT height, hash FROM blockchain ORDER BY height DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let height = super::row_ext::get_i64(&row, "height")? as u64;
                let hash = get_hash(&row, "hash")?;
                Ok(Some((height, hash)))
            }
        }
    }

    /// Up to 30 headers, descending from `height`, filtered to hashes
    /// actually present in `blocks` (spec.md §4.3/§6).
    pub async fn block_headers(&self, height: u64) -> BlockchainResult<Vec<BlockHeader>> {
        let floor = height.saturating_sub(29);
        let rows = sqlx::query(
            "SELECT block_meta.*, blockchain.height AS height, blockchain.utctimestamp AS utctimestamp \
             FROM block_meta \
             JOIN blockchain ON blockchain.hash = block_meta.hash \
             WHERE blockchain.height BETWEEN ? AND ? \
             ORDER BY blockchain.height DESC",
        )
        .bind(floor as i64)
        .bind(height as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_header).collect()
    }

    /// `indexes`: per-transaction ordered global index list for every
    /// output in `[start, end]` (spec.md §4.3/§6).
    pub async fn indexes(&self, start: u64, end: u64) -> BlockchainResult<HashMap<Hash, Vec<u64>>> {
        let rows = sqlx::query(
            "SELECT transactions.hash AS hash, transaction_outputs.idx AS idx, transaction_outputs.globalIdx AS globalidx \
             FROM transaction_outputs \
             JOIN transactions ON transactions.hash = transaction_outputs.hash \
             JOIN blockchain ON blockchain.hash = transactions.block_hash \
             WHERE blockchain.height BETWEEN ? AND ? \
             ORDER BY transactions.hash, transaction_outputs.idx ASC",
        )
        .bind(start as i64)
        .bind(end as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out: HashMap<Hash, Vec<u64>> = HashMap::new();
        for row in &rows {
            let hash = get_hash(row, "hash")?;
            let idx = super::row_ext::get_opt_i64(row, "globalidx")?.unwrap_or(0) as u64;
            out.entry(hash).or_default().push(idx);
        }
        Ok(out)
    }

    /// `/info`, overwritten per spec.md §6: `isCacheApi=true`,
    /// `height=topBlock.height`, `networkHeight` decremented by one,
    /// `synced=(height==networkHeight)`, `difficulty`/`majorVersion`/
    /// `minorVersion` copied from the top block, `hashrate=round(difficulty/30)`,
    /// `transactionsSize` = count of non-coinbase transactions.
    ///
    /// spec.md §9 flags the upstream's own `networkHeight--` as a likely
    /// source bug (post-decrement discards the mutation, so the field is
    /// observably unchanged); that exact observable behavior is preserved
    /// here rather than "fixed" to a genuine decrement.
    pub async fn info(&self) -> BlockchainResult<NodeInfo> {
        let row = sqlx::query("SELECT data FROM information WHERE idx = ?").bind("info").fetch_optional(&self.pool).await?;
        let mut info: NodeInfo = match row {
            Some(row) => {
                let data = get_blob(&row, "data")?;
                serde_json::from_slice(&data).map_err(|e| BlockchainError::Other(e.to_string()))?
            }
            None => NodeInfo {
                height: 0,
                network_height: 0,
                difficulty: 0,
                major_version: 0,
                minor_version: 0,
                synced: false,
                is_cache_api: false,
                hashrate: 0,
                last_block_index: 0,
                transactions_size: 0,
                extra: Default::default(),
            },
        };

        let Some((top_height, top_hash)) = self.last_block().await? else {
            return Ok(info);
        };
        let meta = self.block_meta(top_hash).await?;

        info.is_cache_api = true;
        info.height = top_height;
        // Preserves the upstream's `networkHeight--` post-decrement bug
        // verbatim: the observable value is unchanged (spec.md §9).
        let network_height = info.network_height;
        info.network_height = network_height;
        info.synced = info.height == info.network_height;
        if let Some(meta) = &meta {
            info.difficulty = meta.difficulty;
            info.major_version = meta.major_version as u8;
            info.minor_version = meta.minor_version as u8;
        }
        info.hashrate = (info.difficulty as f64 / 30.0).round() as u64;
        info.last_block_index = top_height;

        let count_row = sqlx::query("SELECT COUNT(*) AS n FROM transactions WHERE coinbase = ?")
            .bind(false)
            .fetch_one(&self.pool)
            .await?;
        info.transactions_size = super::row_ext::get_i64(&count_row, "n")? as u64;

        Ok(info)
    }

    pub async fn peers(&self) -> BlockchainResult<PeerList> {
        let row = sqlx::query("SELECT data FROM information WHERE idx = ?").bind("peers").fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let data = get_blob(&row, "data")?;
                serde_json::from_slice(&data).map_err(|e| BlockchainError::Other(e.to_string()))
            }
            None => Ok(PeerList { peers: Vec::new(), extra: Default::default() }),
        }
    }

    pub async fn block_meta(&self, hash: Hash) -> BlockchainResult<Option<BlockHeader>> {
        let row = sqlx::query(
            "SELECT block_meta.*, blockchain.height AS height, blockchain.utctimestamp AS utctimestamp \
             FROM block_meta JOIN blockchain ON blockchain.hash = block_meta.hash WHERE block_meta.hash = ?",
        )
        .bind(hash.to_hex())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_header).transpose()
    }

    pub async fn transaction(&self, hash: Hash) -> BlockchainResult<TransactionRecord> {
        let row = sqlx::query("SELECT hash, block_hash, coinbase, data FROM transactions WHERE hash = ?")
            .bind(hash.to_hex())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BlockchainError::NotFound(format!("transaction {hash}")))?;
        Ok(TransactionRecord {
            hash: get_hash(&row, "hash")?,
            block_hash: get_hash(&row, "block_hash")?,
            coinbase: super::row_ext::get_bool(&row, "coinbase")?,
            data: get_blob(&row, "data")?,
        })
    }

    pub async fn raw_transaction(&self, hash: Hash) -> BlockchainResult<Vec<u8>> {
        Ok(self.transaction(hash).await?.data)
    }

    pub async fn transaction_pool(&self) -> BlockchainResult<Vec<PoolTransactionRecord>> {
        let rows = sqlx::query("SELECT hash, fee, size, amount, data FROM transaction_pool").fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(PoolTransactionRecord {
                    hash: get_hash(row, "hash")?,
                    fee: super::row_ext::get_i64(row, "fee")? as u64,
                    size: super::row_ext::get_i64(row, "size")? as u64,
                    amount: super::row_ext::get_i64(row, "amount")? as u64,
                    data: get_blob(row, "data")?,
                })
            })
            .collect()
    }

    pub async fn raw_transaction_pool(&self) -> BlockchainResult<Vec<Vec<u8>>> {
        Ok(self.transaction_pool().await?.into_iter().map(|t| t.data).collect())
    }

    /// Diffs a caller-supplied transaction list against the current pool
    /// snapshot (spec.md §8, S5): `added` are pool members not in the
    /// caller's list, `deleted` are caller-list members no longer pooled.
    pub async fn transaction_pool_changes(&self, known: &[Hash]) -> BlockchainResult<TransactionPoolChanges> {
        let pool: Vec<Hash> = self.transaction_pool().await?.into_iter().map(|t| t.hash).collect();
        let pool_set: std::collections::HashSet<Hash> = pool.iter().copied().collect();
        let known_set: std::collections::HashSet<Hash> = known.iter().copied().collect();

        Ok(TransactionPoolChanges {
            added: pool.into_iter().filter(|h| !known_set.contains(h)).collect(),
            deleted: known.iter().copied().filter(|h| !pool_set.contains(h)).collect(),
        })
    }

    pub async fn transactions_status(&self, hashes: &[Hash]) -> BlockchainResult<HashMap<Hash, bool>> {
        let mut out = HashMap::new();
        for hash in hashes {
            let in_chain = sqlx::query("SELECT 1 FROM transactions WHERE hash = ?")
                .bind(hash.to_hex())
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            out.insert(*hash, in_chain);
        }
        Ok(out)
    }

    /// Mutating upstream RPCs are not available from a read-only mirror
    /// (spec.md §4.3).
    pub async fn block_template(&self) -> BlockchainResult<()> {
        Err(BlockchainError::MethodNotAvailable)
    }

    pub async fn submit_block(&self) -> BlockchainResult<()> {
        Err(BlockchainError::MethodNotAvailable)
    }

    pub async fn submit_transaction(&self) -> BlockchainResult<()> {
        Err(BlockchainError::MethodNotAvailable)
    }
}

fn row_to_header(row: &sqlx::any::AnyRow) -> BlockchainResult<BlockHeader> {
    Ok(BlockHeader {
        hash: get_hash(row, "hash")?,
        height: super::row_ext::get_i64(row, "height")? as u64,
        prev_hash: get_hash(row, "prevHash")?,
        timestamp: super::row_ext::get_i64(row, "utctimestamp")?,
        major_version: super::row_ext::get_i64(row, "majorVersion")? as u8,
        minor_version: super::row_ext::get_i64(row, "minorVersion")? as u8,
        nonce: super::row_ext::get_i64(row, "nonce")? as u32,
        size: super::row_ext::get_i64(row, "size")? as u64,
        difficulty: super::row_ext::get_i64(row, "difficulty")? as u64,
        reward: super::row_ext::get_i64(row, "reward")? as u64,
        base_reward: super::row_ext::get_i64(row, "baseReward")? as u64,
        already_generated_coins: super::row_ext::get_i64(row, "alreadyGeneratedCoins")? as u64,
        already_generated_transactions: super::row_ext::get_i64(row, "alreadyGeneratedTransactions")? as u64,
        size_median: super::row_ext::get_i64(row, "sizeMedian")? as u64,
        total_fee_amount: super::row_ext::get_i64(row, "totalFeeAmount")? as u64,
        transactions_cumulative_size: super::row_ext::get_i64(row, "transactionsCumulativeSize")? as u64,
        transactions_count: super::row_ext::get_i64(row, "transactionsCount")? as u32,
        orphan: super::row_ext::get_bool(row, "orphan")?,
        penalty: super::row_ext::get_f64(row, "penalty")?,
    })
}
