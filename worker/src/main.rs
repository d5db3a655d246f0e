//! Standalone process for the offload worker topology (spec.md §4.6). Run
//! one or more of these alongside (instead of) `blockdb daemon`'s own
//! sync tick, all pointed at the same database and queue.

use std::env;
use std::sync::Arc;

use blockdb_daemon::config::Config;
use blockdb_daemon::core::codec::UnimplementedCodec;
use blockdb_daemon::core::storage::BlockchainDb;
use blockdb_worker::{run, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;
    let db = Arc::new(BlockchainDb::connect(&config.db).await?);

    let worker_config = WorkerConfig {
        amqp_url: env::var("AMQP_URL").unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string()),
        queue: env::var("AMQP_QUEUE").unwrap_or_else(|_| "blockdb.raw_blocks".to_string()),
    };

    run(db, Arc::new(UnimplementedCodec), worker_config).await?;
    Ok(())
}
