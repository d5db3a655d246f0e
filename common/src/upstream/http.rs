//! Production [`UpstreamClient`] backed by `reqwest`, talking to the
//! upstream daemon's HTTP RPC surface (spec.md §6).

use super::{HeightOrHash, RawSyncResult, UpstreamClient};
use crate::error::UpstreamError;
use crate::model::{BlockHeader, NodeInfo, PeerList, RawBlock, RawPoolTransaction, TransactionGlobalIndexes};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Matches the production topology's fixed upstream RPC timeout
/// (spec.md §5, 120s).
const UPSTREAM_TIMEOUT_SECS: u64 = 120;

pub struct HttpUpstreamClient {
    client: Client,
    base_url: String,
}

impl HttpUpstreamClient {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<B: serde::Serialize + Sync, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, UpstreamError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Connection(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(UpstreamError::Connection(format!(
                "upstream returned status {}",
                resp.status()
            )));
        }

        resp.json::<R>()
            .await
            .map_err(|e| UpstreamError::Malformed(e.to_string()))
    }
}

#[derive(Deserialize)]
struct RawSyncWire {
    blocks: Vec<RawBlockWire>,
    synced: bool,
}

#[derive(Deserialize)]
struct RawBlockWire {
    #[serde(with = "hex_bytes")]
    block: Vec<u8>,
    #[serde(default, deserialize_with = "hex_bytes_vec")]
    transactions: Vec<Vec<u8>>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

fn hex_bytes_vec<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
    let raw: Vec<String> = Vec::deserialize(d)?;
    raw.into_iter()
        .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
        .collect()
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn info(&self) -> Result<NodeInfo, UpstreamError> {
        self.post_json("/getinfo", &json!({})).await
    }

    async fn peers(&self) -> Result<PeerList, UpstreamError> {
        self.post_json("/getpeers", &json!({})).await
    }

    async fn raw_transaction_pool(&self) -> Result<Vec<RawPoolTransaction>, UpstreamError> {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(default, deserialize_with = "hex_bytes_vec")]
            transactions: Vec<Vec<u8>>,
        }
        let wire: Wire = self.post_json("/get_raw_transaction_pool", &json!({})).await?;
        Ok(wire.transactions.into_iter().map(|blob| RawPoolTransaction { blob }).collect())
    }

    async fn raw_block(&self, which: HeightOrHash) -> Result<RawBlock, UpstreamError> {
        let body = match which {
            HeightOrHash::Height(h) => json!({ "height": h }),
            HeightOrHash::Hash(h) => json!({ "hash": h }),
        };
        let wire: RawBlockWire = self.post_json("/get_raw_block", &body).await?;
        Ok(RawBlock { block_blob: wire.block, transaction_blobs: wire.transactions })
    }

    async fn block_header(&self, which: HeightOrHash) -> Result<BlockHeader, UpstreamError> {
        let body = match which {
            HeightOrHash::Height(h) => json!({ "height": h }),
            HeightOrHash::Hash(h) => json!({ "hash": h }),
        };
        self.post_json("/getblockheaderbyheight", &body).await
    }

    async fn indexes(&self, start: u64, end: u64) -> Result<Vec<TransactionGlobalIndexes>, UpstreamError> {
        #[derive(Deserialize)]
        struct Entry {
            hash: String,
            indexes: Vec<u64>,
        }
        let entries: Vec<Entry> = self
            .post_json("/get_indexes", &json!({ "start_height": start, "end_height": end }))
            .await?;
        entries
            .into_iter()
            .map(|e| {
                e.hash
                    .parse()
                    .map(|hash| TransactionGlobalIndexes { hash, indexes: e.indexes })
                    .map_err(|_| UpstreamError::Malformed("bad transaction hash in indexes response".into()))
            })
            .collect()
    }

    async fn block_headers(&self, height_desc: u64) -> Result<Vec<BlockHeader>, UpstreamError> {
        self.post_json("/getblockheaders", &json!({ "start_height": height_desc })).await
    }

    async fn raw_sync(
        &self,
        checkpoints: &[String],
        height: u64,
        timestamp: i64,
        skip_coinbase_only: bool,
        count: u32,
    ) -> Result<RawSyncResult, UpstreamError> {
        let wire: RawSyncWire = self
            .post_json(
                "/getrawblocks",
                &json!({
                    "block_ids": checkpoints,
                    "start_height": height,
                    "start_timestamp": timestamp,
                    "no_miner_tx": skip_coinbase_only,
                    "count": count,
                }),
            )
            .await?;

        Ok(RawSyncResult {
            blocks: wire
                .blocks
                .into_iter()
                .map(|b| RawBlock { block_blob: b.block, transaction_blobs: b.transactions })
                .collect(),
            synced: wire.synced,
        })
    }
}
