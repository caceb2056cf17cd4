//! The pluggable per-block callback driven by a [`SyncEngine`](crate::engine::SyncEngine).

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::BlockSummary;

/// A consumer that derives state from blocks, one block at a time.
///
/// `process_block` may be called again for a block it already handled (a
/// crash between processing and advancing the head); implementations must
/// make that replay a no-op at the storage layer.
#[async_trait]
pub trait BlockProcessor: Send + Sync {
    /// Consumer key, the name of the head this processor owns.
    fn key(&self) -> &str;

    /// Called once before the first block, when no head exists yet.
    async fn process_genesis(&self, _genesis: &BlockSummary) -> Result<(), IndexerError> {
        Ok(())
    }

    /// Apply every effect of `block`.
    async fn process_block(&self, block: &BlockSummary) -> Result<(), IndexerError>;

    /// Undo the effects of blocks `from` down to `to + 1`, newest first, so
    /// that processing can resume after `to` on a different chain.
    ///
    /// Blocks in that range that were never applied must be skipped, since
    /// `from` may lie past the head.
    async fn rewind(&self, from: u64, to: u64) -> Result<(), IndexerError>;
}
