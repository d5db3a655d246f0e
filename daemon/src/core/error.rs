//! Error taxonomy for the storage layer and synchronization engine,
//! matching spec.md §7's table.

use blockdb_common::codec::CodecError;
use blockdb_common::error::UpstreamError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not available")]
    MethodNotAvailable,

    #[error("database is inconsistent at hash(es): {0:?}")]
    Inconsistent(Vec<String>),

    #[error("{0}")]
    Other(String),
}

pub type BlockchainResult<T> = Result<T, BlockchainError>;
