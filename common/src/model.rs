//! Decoded, backend-agnostic model of a block, matching the relational
//! shape in spec.md §3. These types are produced by a [`crate::codec::BlockCodec`]
//! implementation and consumed by the storage layer; they never carry any
//! notion of which SQL backend eventually persists them.

use serde::{Deserialize, Serialize};
use std::{convert::TryInto, fmt, str::FromStr};

pub const HASH_SIZE: usize = 32;

/// A 32-byte chain hash (block hash, transaction hash, key image, output key, ...),
/// always exchanged and persisted as its lowercase hex encoding.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    pub const fn zero() -> Self {
        Hash([0u8; HASH_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Hash {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| "invalid hex hash")?;
        let bytes: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| "wrong hash length")?;
        Ok(Hash(bytes))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Alias for documentation: a key image uniquely identifies a spent key-type input.
pub type KeyImage = Hash;
/// Alias: the one-time public key carried by a key-type output.
pub type OutputKey = Hash;

/// A decoded block, the "height + ordered transactions" view the
/// synchronization engine and storage layer operate on. The raw blob and
/// transaction blobs are retained for their owning caller to persist
/// verbatim into `blocks.data` / `transactions.data`.
#[derive(Clone, Debug)]
pub struct DecodedBlock {
    pub hash: Hash,
    pub height: u64,
    /// Absolute (not offset) unix timestamp of the block.
    pub timestamp: i64,
    pub prev_hash: Hash,
    pub major_version: u8,
    pub minor_version: u8,
    pub nonce: u32,
    pub base_reward: u64,
    pub difficulty: u64,
    pub reward: u64,
    pub size_median: u64,
    pub already_generated_coins: u64,
    pub already_generated_transactions: u64,
    /// Raw block blob, as received from upstream, stored verbatim in `blocks.data`.
    pub raw: Vec<u8>,
    /// Coinbase transaction first, then user transactions in upstream order.
    pub transactions: Vec<DecodedTransaction>,
}

impl DecodedBlock {
    /// Sum of non-coinbase transaction fees, matching `block_meta.totalFeeAmount`.
    pub fn total_fee_amount(&self) -> u64 {
        self.transactions.iter().filter(|t| !t.coinbase).map(|t| t.fee).sum()
    }

    /// `block_meta.transactionsCumulativeSize`.
    pub fn transactions_cumulative_size(&self) -> u64 {
        self.transactions.iter().map(|t| t.size as u64).sum()
    }

    /// `block_meta.transactionsCount`, including the coinbase transaction.
    pub fn transactions_count(&self) -> u32 {
        self.transactions.len() as u32
    }
}

#[derive(Clone, Debug)]
pub struct DecodedTransaction {
    pub hash: Hash,
    pub coinbase: bool,
    pub fee: u64,
    pub amount: u64,
    pub size: u32,
    pub unlock_time: u64,
    pub public_key: Option<Hash>,
    pub payment_id: Option<Hash>,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    /// Raw transaction blob, stored verbatim in `transactions.data`.
    pub raw: Vec<u8>,
}

/// Typed sum type for a transaction input (spec.md §9): coinbase inputs
/// carry only the block index they mint from and are excluded from
/// `transaction_inputs`; key inputs are the only ones persisted.
#[derive(Clone, Debug)]
pub enum Input {
    Coinbase { block_index: u64 },
    Key { amount: u64, key_image: KeyImage, key_offsets: Vec<u64> },
}

/// Typed sum type for a transaction output. Only key-type outputs are
/// persisted (spec.md §3, `transaction_outputs`).
#[derive(Clone, Debug)]
pub enum Output {
    Key { amount: u64, key: OutputKey },
}

/// A raw block as handed back by the upstream client, before decoding:
/// one block blob plus its transactions' blobs in upstream order.
#[derive(Clone, Debug)]
pub struct RawBlock {
    pub block_blob: Vec<u8>,
    pub transaction_blobs: Vec<Vec<u8>>,
}

/// A raw (undecoded) mempool transaction, as returned by `rawTransactionPool`.
#[derive(Clone, Debug)]
pub struct RawPoolTransaction {
    pub blob: Vec<u8>,
}

/// Block header fields not derivable from the raw block blob alone
/// (`block_meta` minus what the codec already produces).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: Hash,
    pub height: u64,
    pub prev_hash: Hash,
    pub timestamp: i64,
    pub major_version: u8,
    pub minor_version: u8,
    pub nonce: u32,
    pub size: u64,
    pub difficulty: u64,
    pub reward: u64,
    pub base_reward: u64,
    pub already_generated_coins: u64,
    pub already_generated_transactions: u64,
    pub size_median: u64,
    pub total_fee_amount: u64,
    pub transactions_cumulative_size: u64,
    pub transactions_count: u32,
    pub orphan: bool,
    pub penalty: f64,
}

/// One `(height, globalIndex)` pair returned by the upstream `indexes` RPC
/// for a single transaction's key-type outputs, in output order.
#[derive(Clone, Debug)]
pub struct TransactionGlobalIndexes {
    pub hash: Hash,
    pub indexes: Vec<u64>,
}

/// Upstream node info, mirrored (and partly overwritten, see spec.md §6) by
/// the read surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub height: u64,
    pub network_height: u64,
    pub difficulty: u64,
    pub major_version: u8,
    pub minor_version: u8,
    pub synced: bool,
    #[serde(default)]
    pub is_cache_api: bool,
    #[serde(default)]
    pub hashrate: u64,
    #[serde(default)]
    pub last_block_index: u64,
    #[serde(default)]
    pub transactions_size: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_round_trips_through_hex() {
        let hash = Hash::new([0xab; HASH_SIZE]);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), HASH_SIZE * 2);
        assert_eq!(Hash::from_str(&hex).unwrap(), hash);
    }

    #[test]
    fn hash_rejects_wrong_length() {
        assert!(Hash::from_str("ab").is_err());
    }

    #[test]
    fn hash_rejects_non_hex() {
        assert!(Hash::from_str(&"zz".repeat(HASH_SIZE)).is_err());
    }

    #[test]
    fn hash_serializes_as_hex_string() {
        let hash = Hash::zero();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "0".repeat(HASH_SIZE * 2)));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn decoded_block_totals_are_computed_from_transactions() {
        let block = DecodedBlock {
            hash: Hash::zero(),
            height: 10,
            timestamp: 1_700_000_000,
            prev_hash: Hash::zero(),
            major_version: 1,
            minor_version: 0,
            nonce: 0,
            base_reward: 1000,
            difficulty: 1,
            reward: 1000,
            size_median: 300,
            already_generated_coins: 1000,
            already_generated_transactions: 2,
            raw: vec![],
            transactions: vec![
                DecodedTransaction {
                    hash: Hash::new([1; HASH_SIZE]),
                    coinbase: true,
                    fee: 0,
                    amount: 1000,
                    size: 100,
                    unlock_time: 0,
                    public_key: None,
                    payment_id: None,
                    inputs: vec![],
                    outputs: vec![],
                    raw: vec![0; 100],
                },
                DecodedTransaction {
                    hash: Hash::new([2; HASH_SIZE]),
                    coinbase: false,
                    fee: 5,
                    amount: 200,
                    size: 150,
                    unlock_time: 0,
                    public_key: None,
                    payment_id: None,
                    inputs: vec![],
                    outputs: vec![],
                    raw: vec![0; 150],
                },
            ],
        };

        assert_eq!(block.total_fee_amount(), 5);
        assert_eq!(block.transactions_cumulative_size(), 250);
        assert_eq!(block.transactions_count(), 2);
    }
}
