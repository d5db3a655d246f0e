//! The storage layer (spec.md §3/§4.3): a single [`BlockchainDb`] wrapping
//! a backend-agnostic [`sqlx::AnyPool`], so the same SQL and row-reading
//! code serves SQLite, MySQL, and Postgres (spec.md §9 calls out this
//! coalescing explicitly; grounded on the `Any` driver pattern rather than
//! three parallel backend-specific clients).

mod consistency;
mod inserts;
mod read;
mod rewind;
mod row_ext;
mod sync_support;

pub use read::{PoolTransactionRecord, TransactionPoolChanges, TransactionRecord};

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use crate::core::error::BlockchainResult;
use blockdb_common::config::{DbBackend, DbConfig};

#[derive(Clone)]
pub struct BlockchainDb {
    pool: AnyPool,
    backend: DbBackend,
}

impl BlockchainDb {
    /// Connects, enables foreign-key enforcement on SQLite (off by default,
    /// and required for the `ON DELETE CASCADE` rewind semantics in
    /// [`rewind`](Self::rewind) to actually fire), and runs the schema.
    pub async fn connect(cfg: &DbConfig) -> BlockchainResult<Self> {
        sqlx::any::install_default_drivers();

        let url = cfg.connect_url();
        let pool = AnyPoolOptions::new().max_connections(10).connect(&url).await?;

        if cfg.backend == DbBackend::Sqlite {
            sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        }

        crate::core::schema::init(&pool).await?;

        info!("connected to {:?} backend", cfg.backend);
        Ok(Self { pool, backend: cfg.backend.clone() })
    }

    pub fn backend(&self) -> &DbBackend {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn sample_block(height: u64) -> DecodedBlock {
        DecodedBlock {
            hash: blockdb_common::model::Hash::new([height as u8; 32]),
            height,
            timestamp: 1_700_000_000 + height as i64,
            prev_hash: blockdb_common::model::Hash::zero(),
            major_version: 1,
            minor_version: 0,
            nonce: 0,
            base_reward: 1000,
            difficulty: 1,
            reward: 1000,
            size_median: 300,
            already_generated_coins: 1000,
            already_generated_transactions: 1,
            raw: vec![1, 2, 3],
            transactions: vec![DecodedTransaction {
                hash: blockdb_common::model::Hash::new([(height + 1) as u8; 32]),
                coinbase: true,
                fee: 0,
                amount: 1000,
                size: 100,
                unlock_time: 0,
                public_key: None,
                payment_id: None,
                inputs: vec![],
                outputs: vec![],
                raw: vec![4, 5, 6],
            }],
        }
    }

    #[tokio::test]
    async fn connect_creates_schema_and_round_trips_a_block() {
        let db = memory_db().await;
        assert!(db.top_height().await.unwrap().is_none());

        let block = sample_block(0);
        let (heights, hashes) = db.save_raw_blocks(&[block.clone()]).await.unwrap();
        assert_eq!(heights, vec![0]);
        assert_eq!(hashes, vec![block.hash]);

        assert_eq!(db.top_height().await.unwrap(), Some(0));
        let fetched = db.block(Some(0), None).await.unwrap();
        assert_eq!(fetched, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn rewind_removes_blocks_at_and_above_height() {
        let db = memory_db().await;
        db.save_raw_blocks(&[sample_block(0), sample_block(1), sample_block(2)]).await.unwrap();

        db.rewind(1).await.unwrap();

        assert_eq!(db.top_height().await.unwrap(), Some(0));
        assert!(db.hash_from_height(1).await.unwrap().is_none());
        assert!(db.hash_from_height(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_truncates_blocks_information_and_the_pool_table() {
        let db = memory_db().await;
        db.save_raw_blocks(&[sample_block(0), sample_block(1)]).await.unwrap();
        db.save_information(&blockdb_common::model::NodeInfo {
            height: 1,
            network_height: 1,
            difficulty: 1,
            major_version: 1,
            minor_version: 0,
            synced: true,
            is_cache_api: false,
            hashrate: 0,
            last_block_index: 1,
            transactions_size: 0,
            extra: Default::default(),
        })
        .await
        .unwrap();
        db.save_transaction_pool(&[DecodedTransaction {
            hash: blockdb_common::model::Hash::new([9; 32]),
            coinbase: false,
            fee: 1,
            amount: 1,
            size: 1,
            unlock_time: 0,
            public_key: None,
            payment_id: None,
            inputs: vec![],
            outputs: vec![],
            raw: vec![],
        }])
        .await
        .unwrap();

        db.reset().await.unwrap();

        assert!(db.top_height().await.unwrap().is_none());
        // No top block survives the reset, so `info()` falls back to its
        // zeroed default rather than the just-deleted stored snapshot
        // (difficulty=1 there) only if the `information` row is truly gone.
        assert_eq!(db.info().await.unwrap().difficulty, 0);
        assert!(db.transaction_pool().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consistency_check_flags_missing_meta_and_repairs_by_rewinding() {
        let db = memory_db().await;
        db.save_raw_blocks(&[sample_block(0), sample_block(1)]).await.unwrap();

        let (ok, _) = db.check_consistency().await.unwrap();
        assert!(!ok, "block_meta was never populated, should be flagged inconsistent");

        db.repair_consistency().await.unwrap();
        assert_eq!(db.top_height().await.unwrap(), None);
    }
}
