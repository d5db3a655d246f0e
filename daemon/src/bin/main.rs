//! CLI entrypoint (spec.md §6/§12): `daemon` runs the full synchronization
//! engine, the remaining subcommands operate directly on storage for
//! operational maintenance.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use blockdb_common::upstream::http::HttpUpstreamClient;
use blockdb_common::upstream::UpstreamClient;
use blockdb_daemon::config::Config;
use blockdb_daemon::core::codec::{CodecAdapter, UnimplementedCodec};
use blockdb_daemon::core::collector::Collector;
use blockdb_daemon::core::storage::BlockchainDb;

#[derive(Parser)]
#[command(name = "blockdb", about = "Relational mirror of a cryptocurrency blockchain")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the synchronization engine until terminated.
    Daemon,
    /// Delete every block at or above the given height.
    Rewind { height: u64 },
    /// Drop every mirrored block and start over from genesis.
    Reset,
    /// Run the consistency checker once and report the result.
    CheckConsistency,
}

// The offload worker (spec.md §4.6) is a separate topology: run the
// `blockdb-worker` binary from the `worker` crate as its own process,
// pointed at the same database and message queue.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::from_env().map_err(anyhow::Error::msg)?;
    let db = Arc::new(BlockchainDb::connect(&config.db).await?);

    match cli.command {
        Command::Daemon => run_daemon(db, &config).await,
        Command::Rewind { height } => {
            db.rewind(height).await?;
            println!("rewound to height {height}");
            Ok(())
        }
        Command::Reset => {
            db.reset().await?;
            println!("reset: mirror is empty, genesis will be re-bootstrapped on next daemon start");
            Ok(())
        }
        Command::CheckConsistency => {
            let (ok, inconsistent) = db.check_consistency().await?;
            if ok {
                println!("consistent");
            } else {
                println!("inconsistent: {} block(s) missing metadata, repairing", inconsistent.len());
                for hash in &inconsistent {
                    println!("  {hash}");
                }
                db.repair_consistency().await?;
                println!("repaired");
            }
            Ok(())
        }
    }
}

async fn run_daemon(db: Arc<BlockchainDb>, config: &blockdb_common::config::Config) -> anyhow::Result<()> {
    let upstream: Arc<dyn UpstreamClient> = Arc::new(HttpUpstreamClient::new(config.node.base_url()));
    let codec = Arc::new(CodecAdapter::new(Arc::new(UnimplementedCodec)));

    let collector = Collector::new(db, upstream, codec);
    collector.clone().init().await?;

    log::info!("daemon running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    collector.stop();
    Ok(())
}
