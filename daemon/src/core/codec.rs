//! Thin adapter around the external [`BlockCodec`], responsible only for
//! turning a decode failure into a descriptive, block-scoped error
//! (spec.md §4.1: "Decoding failure of any transaction fails the whole
//! block-load with a descriptive error").

use blockdb_common::codec::BlockCodec;
use blockdb_common::model::{DecodedBlock, DecodedTransaction, RawBlock};
use std::sync::Arc;

use super::error::BlockchainError;

pub struct CodecAdapter {
    codec: Arc<dyn BlockCodec>,
}

impl CodecAdapter {
    pub fn new(codec: Arc<dyn BlockCodec>) -> Self {
        Self { codec }
    }

    pub fn decode_block(&self, height: u64, raw: RawBlock) -> Result<DecodedBlock, BlockchainError> {
        self.codec
            .decode_block(height, raw)
            .map_err(|e| BlockchainError::Other(format!("failed to decode block at height {height}: {e}")))
    }

    pub fn decode_pool_transaction(&self, blob: &[u8]) -> Result<DecodedTransaction, BlockchainError> {
        self.codec
            .decode_transaction(blob)
            .map_err(|e| BlockchainError::Other(format!("failed to decode pool transaction: {e}")))
    }
}

/// Stand-in [`BlockCodec`] used until a real, upstream-specific binary
/// decoder is wired in (spec.md §1 puts the codec out of scope). Every
/// call fails descriptively rather than guessing at a wire format.
pub struct UnimplementedCodec;

impl BlockCodec for UnimplementedCodec {
    fn decode_block(&self, _height: u64, _raw: RawBlock) -> Result<DecodedBlock, blockdb_common::codec::CodecError> {
        Err(blockdb_common::codec::CodecError::Block("no block codec configured for this deployment".into()))
    }

    fn decode_transaction(&self, _blob: &[u8]) -> Result<DecodedTransaction, blockdb_common::codec::CodecError> {
        Err(blockdb_common::codec::CodecError::Transaction {
            index: 0,
            source: "no block codec configured for this deployment".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockdb_common::model::RawBlock;
    use std::sync::Arc;

    #[test]
    fn adapter_wraps_a_block_decode_failure_with_the_offending_height() {
        let adapter = CodecAdapter::new(Arc::new(UnimplementedCodec));
        let raw = RawBlock { block_blob: vec![], transaction_blobs: vec![] };

        let err = adapter.decode_block(42, raw).unwrap_err();
        assert!(matches!(err, BlockchainError::Other(msg) if msg.contains("height 42")));
    }

    #[test]
    fn adapter_wraps_a_pool_transaction_decode_failure() {
        let adapter = CodecAdapter::new(Arc::new(UnimplementedCodec));
        let err = adapter.decode_pool_transaction(&[]).unwrap_err();
        assert!(matches!(err, BlockchainError::Other(_)));
    }
}
