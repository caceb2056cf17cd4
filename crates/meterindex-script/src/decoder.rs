//! [`ProtocolDecoder`]: the `"scriptengine"` consumer.
//!
//! Walks every clause of every successful transaction in block order, picks
//! out script-engine calls by their prefix, and hands each decoded call to
//! the auction or staking handler. Ordering matters: bid running totals
//! depend on the calls before them.

use async_trait::async_trait;
use std::sync::Arc;

use meterindex_core::error::IndexerError;
use meterindex_core::processor::BlockProcessor;
use meterindex_core::source::ChainSource;
use meterindex_core::store::{load_block_transactions, AuctionRepo, BlockRepo, StakingRepo};
use meterindex_core::types::{BlockSummary, Transaction};

use crate::auction::AuctionHandler;
use crate::envelope::{decode_script, is_script_data, ScriptCall};
use crate::staking::StakingHandler;

/// Consumer key of the protocol decoder.
pub const SCRIPT_KEY: &str = "scriptengine";

/// The repositories the protocol decoder reads and writes.
pub trait ScriptStore: BlockRepo + AuctionRepo + StakingRepo {}

impl<T: BlockRepo + AuctionRepo + StakingRepo> ScriptStore for T {}

/// Where a call was found: tagged onto every row it produces.
#[derive(Debug, Clone, Copy)]
pub struct ClauseRef<'a> {
    pub block: &'a BlockSummary,
    pub tx: &'a Transaction,
    pub clause_index: u32,
}

/// [`BlockProcessor`] applying auction and staking calls.
pub struct ProtocolDecoder {
    store: Arc<dyn ScriptStore>,
    auction: AuctionHandler,
    staking: StakingHandler,
}

impl ProtocolDecoder {
    pub fn new(store: Arc<dyn ScriptStore>, chain: Arc<dyn ChainSource>) -> Self {
        Self {
            auction: AuctionHandler::new(store.clone(), chain.clone()),
            staking: StakingHandler::new(store.clone(), chain),
            store,
        }
    }

    /// Decode one clause's data. Anything that is not a well-formed call to
    /// a tracked module is `None`.
    fn decode_clause(data: &str, tx_hash: &str, clause_index: usize) -> Option<ScriptCall> {
        let bytes = match hex::decode(data.trim_start_matches("0x")) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(tx = %tx_hash, clause = clause_index, error = %e, "clause data is not hex");
                return None;
            }
        };
        if !is_script_data(&bytes) {
            return None;
        }
        match decode_script(&bytes) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(tx = %tx_hash, clause = clause_index, error = %e, "skipping malformed script call");
                None
            }
        }
    }
}

#[async_trait]
impl BlockProcessor for ProtocolDecoder {
    fn key(&self) -> &str {
        SCRIPT_KEY
    }

    async fn process_block(&self, block: &BlockSummary) -> Result<(), IndexerError> {
        let txs = load_block_transactions(self.store.as_ref(), block).await?;

        let mut applied = 0usize;
        for tx in txs.iter().filter(|tx| !tx.reverted) {
            for (i, clause) in tx.clauses.iter().enumerate() {
                let Some(call) = Self::decode_clause(&clause.data, &tx.hash, i) else {
                    continue;
                };
                let at = ClauseRef {
                    block,
                    tx,
                    clause_index: i as u32,
                };
                match &call {
                    ScriptCall::Auction(body) => self.auction.apply(&at, body).await?,
                    ScriptCall::Staking(body) => self.staking.apply(&at, body).await?,
                }
                applied += 1;
            }
        }

        if applied > 0 {
            tracing::debug!(block = block.number, calls = applied, "script calls applied");
        }
        Ok(())
    }

    /// Every row this consumer writes carries its block number, so blocks
    /// are dropped by range rather than replayed in reverse.
    async fn rewind(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        tracing::info!(from, to, "rewinding script state");
        self.auction.rewind(to).await?;
        self.staking.rewind(to).await
    }
}
