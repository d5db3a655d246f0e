//! End-to-end scenarios driving the real `Collector` against a
//! `MockUpstream` through its public `init`/`stop` surface, plus a
//! storage-only scenario for transaction pool churn that doesn't need the
//! engine at all.

use std::sync::Arc;
use std::time::Duration;

use blockdb_common::codec::{BlockCodec, CodecError};
use blockdb_common::config::{DbBackend, DbConfig};
use blockdb_common::model::{
    BlockHeader, DecodedBlock, DecodedTransaction, Hash, RawBlock, HASH_SIZE,
};
use blockdb_common::upstream::mock::MockUpstream;
use blockdb_daemon::core::codec::CodecAdapter;
use blockdb_daemon::core::collector::Collector;
use blockdb_daemon::core::storage::BlockchainDb;

fn test_hash(height: u64) -> Hash {
    let mut bytes = [0u8; HASH_SIZE];
    bytes[0..8].copy_from_slice(&height.to_le_bytes());
    Hash::new(bytes)
}

struct ScenarioCodec;

impl BlockCodec for ScenarioCodec {
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
        Err(CodecError::Transaction { index: 0, source: "not exercised by this scenario".into() })
    }
}

fn header_at(height: u64) -> BlockHeader {
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

fn chain_of(top_height: u64) -> (Vec<RawBlock>, Vec<BlockHeader>) {
    let blocks = (0..=top_height).map(|_| RawBlock { block_blob: vec![], transaction_blobs: vec![] }).collect();
    let headers = (0..=top_height).map(header_at).collect();
    (blocks, headers)
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

/// S1 (fresh bootstrap): empty mirror, upstream reports a 10-block chain.
/// `Collector::init` bootstraps genesis, then the paused clock is advanced
/// one ticker period at a time until the sync tick has pulled everything
/// upstream has to offer.
#[tokio::test(start_paused = true)]
async fn fresh_bootstrap_reaches_the_full_upstream_chain() {
    let db = memory_db().await;
    let (blocks, headers) = chain_of(10);
    let mut upstream = MockUpstream::empty();
    upstream.blocks = blocks;
    upstream.headers = headers;

    let codec = Arc::new(CodecAdapter::new(Arc::new(ScenarioCodec)));
    let collector = Collector::new(db.clone(), Arc::new(upstream), codec);
    collector.clone().init().await.unwrap();

    for _ in 0..5 {
        tokio::time::advance(Duration::from_millis(5000)).await;
        tokio::task::yield_now().await;
        if db.top_height().await.unwrap() == Some(10) {
            break;
        }
    }

    assert_eq!(db.top_height().await.unwrap(), Some(10));
    let (consistent, _) = db.check_consistency().await.unwrap();
    assert!(consistent);

    collector.stop();
}

/// Resume-after-rewind: a synced mirror is manually rewound to height 2
/// (as the rewind engine itself would do after detecting a reorg or a
/// consistency failure), then a fresh `Collector` is started against the
/// same upstream chain. `init`'s bootstrap step is a no-op since genesis
/// already exists, and the sync ticker alone must walk the mirror back up
/// to the upstream's current top.
#[tokio::test(start_paused = true)]
async fn restart_after_a_manual_rewind_resyncs_to_the_same_upstream_chain() {
    let db = memory_db().await;
    let (blocks, headers) = chain_of(5);
    let mut upstream = MockUpstream::empty();
    upstream.blocks = blocks.clone();
    upstream.headers = headers.clone();

    let codec = Arc::new(CodecAdapter::new(Arc::new(ScenarioCodec)));
    let first = Collector::new(db.clone(), Arc::new(upstream), codec.clone());
    first.clone().init().await.unwrap();
    for _ in 0..5 {
        tokio::time::advance(Duration::from_millis(5000)).await;
        tokio::task::yield_now().await;
        if db.top_height().await.unwrap() == Some(5) {
            break;
        }
    }
    assert_eq!(db.top_height().await.unwrap(), Some(5));
    first.stop();

    db.rewind(3).await.unwrap();
    assert_eq!(db.top_height().await.unwrap(), Some(2));
    let (consistent, _) = db.check_consistency().await.unwrap();
    assert!(consistent, "rewind itself must never leave a dangling block_meta row behind");

    let mut upstream_again = MockUpstream::empty();
    upstream_again.blocks = blocks;
    upstream_again.headers = headers;
    let second = Collector::new(db.clone(), Arc::new(upstream_again), codec);
    second.clone().init().await.unwrap();

    for _ in 0..5 {
        tokio::time::advance(Duration::from_millis(5000)).await;
        tokio::task::yield_now().await;
        if db.top_height().await.unwrap() == Some(5) {
            break;
        }
    }
    assert_eq!(db.top_height().await.unwrap(), Some(5));
    let (consistent, _) = db.check_consistency().await.unwrap();
    assert!(consistent);

    second.stop();
}

/// S5 (pool churn): the pool table is a strict last-snapshot replacement,
/// and `transaction_pool_changes` diffs a caller-known list against it.
#[tokio::test]
async fn pool_replacement_is_a_strict_snapshot_and_changes_diff_correctly() {
    let db = memory_db().await;

    let txn = |seed: u8| DecodedTransaction {
        hash: Hash::new([seed; HASH_SIZE]),
        coinbase: false,
        fee: 1,
        amount: 100,
        size: 50,
        unlock_time: 0,
        public_key: None,
        payment_id: None,
        inputs: vec![],
        outputs: vec![],
        raw: vec![seed],
    };

    let a = txn(1);
    let b = txn(2);
    let c = txn(3);
    let d = txn(4);

    db.save_transaction_pool(&[a.clone(), b.clone(), c.clone()]).await.unwrap();
    let pool = db.transaction_pool().await.unwrap();
    assert_eq!(pool.len(), 3);

    db.save_transaction_pool(&[b.clone(), c.clone(), d.clone()]).await.unwrap();
    let pool = db.transaction_pool().await.unwrap();
    let mut hashes: Vec<Hash> = pool.into_iter().map(|p| p.hash).collect();
    hashes.sort();
    let mut expected = vec![b.hash, c.hash, d.hash];
    expected.sort();
    assert_eq!(hashes, expected, "pool table must be exactly {{B,C,D}} after replacement");

    let changes = db.transaction_pool_changes(&[a.hash, b.hash]).await.unwrap();
    assert_eq!(changes.added, vec![d.hash]);
    assert_eq!(changes.deleted, vec![a.hash]);
}
