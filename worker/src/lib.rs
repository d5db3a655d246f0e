//! Offload worker (spec.md §4.6): an alternative topology that distributes
//! per-block persistence over a pool of workers connected through a
//! durable AMQP request/reply queue, rather than having a single
//! synchronization engine insert every block itself.
//!
//! Each worker holds one prefetch credit at a time, so message order
//! within a queue roughly tracks delivery order but no ordering guarantee
//! is made across workers — `insert_block_if_new` on the shared storage
//! layer is what keeps re-delivery and out-of-order arrival safe.

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::timeout;

use blockdb_common::codec::BlockCodec;
use blockdb_common::model::RawBlock;
use blockdb_daemon::core::codec::CodecAdapter;
use blockdb_daemon::core::error::BlockchainError;
use blockdb_daemon::core::storage::BlockchainDb;

/// Reply-wait bound for the dispatcher side of the offload topology
/// (spec.md §5, 600s).
pub const OFFLOAD_REPLY_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error(transparent)]
    Blockchain(#[from] BlockchainError),
    #[error("offload request timed out after {OFFLOAD_REPLY_TIMEOUT_SECS}s waiting for a reply")]
    ReplyTimeout,
}

/// Wire payload for a single raw-block request (spec.md §4.6).
#[derive(Serialize, Deserialize)]
struct BlockRequest {
    height: u64,
    #[serde(with = "hex::serde")]
    block: Vec<u8>,
    transactions: Vec<String>,
}

/// Idempotent-short-circuit-aware response: `inserted` is false when the
/// block already existed and the request was a no-op.
#[derive(Serialize, Deserialize)]
struct BlockResponse {
    height: u64,
    hash: String,
    transaction_count: usize,
    inserted: bool,
}

pub struct WorkerConfig {
    pub amqp_url: String,
    pub queue: String,
}

pub async fn run(db: Arc<BlockchainDb>, codec: Arc<dyn BlockCodec>, config: WorkerConfig) -> Result<(), WorkerError> {
    let codec = Arc::new(CodecAdapter::new(codec));

    let conn = Connection::connect(&config.amqp_url, ConnectionProperties::default()).await?;
    let channel = conn.create_channel().await?;

    channel
        .queue_declare(&config.queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
        .await?;
    channel.basic_qos(1, BasicQosOptions::default()).await?;

    let mut consumer = channel
        .basic_consume(&config.queue, "blockdb-worker", BasicConsumeOptions::default(), FieldTable::default())
        .await?;

    info!("worker listening on queue {}", config.queue);

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(d) => d,
            Err(e) => {
                warn!("worker: failed to receive delivery: {e}");
                continue;
            }
        };

        match handle_request(&db, &codec, &delivery.data).await {
            Ok(response) => {
                reply_and_ack(&channel, &delivery, &response).await?;
            }
            Err(e) => {
                warn!("worker: failed to process block request, nacking for redelivery: {e}");
                delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    db: &BlockchainDb,
    codec: &CodecAdapter,
    body: &[u8],
) -> Result<BlockResponse, WorkerError> {
    let request: BlockRequest = serde_json::from_slice(body).map_err(|e| WorkerError::Malformed(e.to_string()))?;

    let transaction_blobs = request
        .transactions
        .iter()
        .map(|hex_blob| hex::decode(hex_blob).map_err(|e| WorkerError::Malformed(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    let raw = RawBlock { block_blob: request.block, transaction_blobs };
    let block = codec.decode_block(request.height, raw)?;
    let transaction_count = block.transactions.len();
    let hash = block.hash.to_hex();

    let inserted = db.insert_block_if_new(&block).await?;
    if inserted {
        debug!("worker: inserted block {hash} at height {}", request.height);
    } else {
        debug!("worker: block {hash} already present, short-circuited");
    }

    Ok(BlockResponse { height: request.height, hash, transaction_count, inserted })
}

async fn reply_and_ack(
    channel: &Channel,
    delivery: &lapin::message::Delivery,
    response: &BlockResponse,
) -> Result<(), WorkerError> {
    if let Some(reply_to) = delivery.properties.reply_to().as_ref() {
        let payload = serde_json::to_vec(response).map_err(|e| WorkerError::Malformed(e.to_string()))?;
        let mut props = BasicProperties::default();
        if let Some(correlation_id) = delivery.properties.correlation_id().as_ref() {
            props = props.with_correlation_id(correlation_id.clone());
        }
        channel
            .basic_publish("", reply_to.as_str(), BasicPublishOptions::default(), &payload, props)
            .await?;
    }

    delivery.ack(BasicAckOptions::default()).await?;
    Ok(())
}

/// Dispatcher side of the offload topology (spec.md §4.6/§5): publishes a
/// raw-block request onto the durable queue a [`run`] worker consumes from,
/// then waits on a private, auto-deleted reply queue for that request's
/// response, bounded by [`OFFLOAD_REPLY_TIMEOUT_SECS`].
pub struct OffloadClient {
    channel: Channel,
    reply_queue: String,
    request_queue: String,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<BlockResponseSnapshot>>>>,
}

/// Owned mirror of [`BlockResponse`] handed back to callers of [`OffloadClient::dispatch`].
#[derive(Debug, Clone)]
pub struct BlockResponseSnapshot {
    pub height: u64,
    pub hash: String,
    pub transaction_count: usize,
    pub inserted: bool,
}

impl From<BlockResponse> for BlockResponseSnapshot {
    fn from(r: BlockResponse) -> Self {
        Self { height: r.height, hash: r.hash, transaction_count: r.transaction_count, inserted: r.inserted }
    }
}

impl OffloadClient {
    pub async fn connect(amqp_url: &str, request_queue: &str) -> Result<Self, WorkerError> {
        let conn = Connection::connect(amqp_url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;

        channel
            .queue_declare(request_queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await?;

        let reply_queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions { exclusive: true, auto_delete: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        let reply_queue_name = reply_queue.name().to_string();

        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<BlockResponseSnapshot>>>> = Arc::new(Mutex::new(HashMap::new()));

        let mut consumer = channel
            .basic_consume(&reply_queue_name, "blockdb-offload-client", BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        let pending_for_task = pending.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let Ok(delivery) = delivery else { continue };
                let correlation_id = delivery.properties.correlation_id().as_ref().map(|c| c.to_string());
                if let (Some(correlation_id), Ok(response)) =
                    (correlation_id, serde_json::from_slice::<BlockResponse>(&delivery.data))
                {
                    if let Some(sender) = pending_for_task.lock().unwrap().remove(&correlation_id) {
                        let _ = sender.send(response.into());
                    }
                }
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
        });

        Ok(Self {
            channel,
            reply_queue: reply_queue_name,
            request_queue: request_queue.to_string(),
            next_id: AtomicU64::new(0),
            pending,
        })
    }

    /// Publishes a raw-block request and waits up to the 600s reply
    /// timeout (spec.md §5) for the worker's response.
    pub async fn dispatch(
        &self,
        height: u64,
        block: Vec<u8>,
        transactions: Vec<Vec<u8>>,
    ) -> Result<BlockResponseSnapshot, WorkerError> {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let request = BlockRequest {
            height,
            block,
            transactions: transactions.into_iter().map(hex::encode).collect(),
        };
        let payload = serde_json::to_vec(&request).map_err(|e| WorkerError::Malformed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(correlation_id.clone(), tx);

        let props = BasicProperties::default()
            .with_reply_to(self.reply_queue.clone().into())
            .with_correlation_id(correlation_id.clone().into());

        self.channel
            .basic_publish("", &self.request_queue, BasicPublishOptions::default(), &payload, props)
            .await?;

        match timeout(Duration::from_secs(OFFLOAD_REPLY_TIMEOUT_SECS), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().unwrap().remove(&correlation_id);
                Err(WorkerError::Malformed("reply channel closed before a response arrived".into()))
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&correlation_id);
                Err(WorkerError::ReplyTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_request_round_trips_its_hex_encoded_blobs_through_json() {
        let request = BlockRequest { height: 7, block: vec![1, 2, 3], transactions: vec![hex::encode([4, 5, 6])] };
        let encoded = serde_json::to_vec(&request).unwrap();
        let decoded: BlockRequest = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.height, 7);
        assert_eq!(decoded.block, vec![1, 2, 3]);
        assert_eq!(hex::decode(&decoded.transactions[0]).unwrap(), vec![4, 5, 6]);
    }

    #[test]
    fn block_response_snapshot_mirrors_the_wire_response() {
        let response = BlockResponse { height: 3, hash: "abc".into(), transaction_count: 2, inserted: true };
        let snapshot: BlockResponseSnapshot = response.into();
        assert_eq!(snapshot.height, 3);
        assert_eq!(snapshot.hash, "abc");
        assert_eq!(snapshot.transaction_count, 2);
        assert!(snapshot.inserted);
    }

    #[test]
    fn reply_timeout_error_names_the_configured_bound() {
        let message = WorkerError::ReplyTimeout.to_string();
        assert!(message.contains(&OFFLOAD_REPLY_TIMEOUT_SECS.to_string()));
    }
}
