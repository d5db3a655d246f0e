//! Daemon-level constants layered on top of [`blockdb_common::config::Config`].

pub use blockdb_common::config::{Config, DbBackend, DbConfig, NodeConfig};

/// Upper bound on blocks requested per sync tick once batch sizing has
/// fully recovered (spec.md §4.5).
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Floor batch sizing converges to under sustained failure (spec.md §4.5).
pub const MIN_BATCH_SIZE: u32 = 2;

/// Period, in milliseconds, of the info/pool/sync tickers (spec.md §4.5).
pub const TICKER_PERIOD_MS: u64 = 5000;

/// Row-count chunk size for bulk INSERT statements (spec.md §4.3).
pub const BULK_INSERT_CHUNK: usize = 25;

/// Checkpoint dense prefix length (spec.md §4.3, `hashesForSync`).
pub const CHECKPOINT_DENSE_PREFIX: u64 = 11;

/// Header bulk range fetch chunk size (spec.md §4.5, header-fetch subroutine).
pub const HEADER_CHUNK: u64 = 30;

/// Global-index range fetch chunk size (spec.md §4.5, index-fetch subroutine).
pub const INDEX_CHUNK: u64 = 11;

/// Retry cap for the bulk headers RPC before falling back to sequential
/// single-header fetches (spec.md §4.5).
pub const HEADER_BULK_RETRY_LIMIT: u32 = 5;
