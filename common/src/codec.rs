//! The raw-block/transaction binary codec is an external collaborator
//! (spec.md §1, "Out of scope") — this crate only defines the trait the
//! core consumes, plus the hash-caching contract from spec.md §4.1.
//! A concrete implementation is supplied by whatever upstream-specific
//! decoding crate the deployment wires in.

use crate::model::{DecodedBlock, DecodedTransaction, RawBlock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to decode block: {0}")]
    Block(String),
    #[error("failed to decode transaction {index}: {source}")]
    Transaction { index: usize, source: String },
}

/// Decodes raw block/transaction blobs into the normalized model in
/// [`crate::model`]. Implementations must cache hashes internally so that
/// repeated decode requests for the same blob are O(1) (spec.md §4.1).
pub trait BlockCodec: Send + Sync {
    /// Decode a full raw block (block blob + transaction blobs) at a known
    /// height into a [`DecodedBlock`]. Fails the whole block if any single
    /// transaction fails to decode (spec.md §4.1).
    fn decode_block(&self, height: u64, raw: RawBlock) -> Result<DecodedBlock, CodecError>;

    /// Decode a single raw (mempool) transaction blob.
    fn decode_transaction(&self, blob: &[u8]) -> Result<DecodedTransaction, CodecError>;
}
