//! Read-only access to chain data.
//!
//! [`BlockSource`] is what the sync engine polls. [`ChainSource`] adds the
//! chain-node query endpoints whose answers are authoritative (auction
//! snapshots, validator rewards, contract code). Every call is an idempotent
//! read; reconnection and retry policy belong to the implementations.

use async_trait::async_trait;
use alloy_primitives::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::IndexerError;
use crate::model::{DistributedLot, RewardEntry};
use crate::store::{BlockRepo, HeadStore};
use crate::types::{BidKind, BlockSummary};

/// Head key of the consumer that ingests raw blocks into the store.
pub const DEFAULT_UPSTREAM_KEY: &str = "pos";

/// A sequence of blocks with a moving "best" tip.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Number of the best block currently available.
    async fn best(&self) -> Result<u64, IndexerError>;

    /// Fetch a block by number; `None` if it is not (yet) available.
    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError>;
}

/// Chain-node queries. `revision` is the block number the query is made at.
#[async_trait]
pub trait ChainSource: BlockSource {
    /// Deployed bytecode of `address`, `None` for an externally owned account.
    async fn account_code(&self, address: &str, revision: u64) -> Result<Option<String>, IndexerError>;

    /// The auction accepting bids at `revision`, if any.
    async fn present_auction(&self, revision: u64) -> Result<Option<AuctionSnapshot>, IndexerError>;

    /// Summaries of every ended auction known at `revision`, oldest first.
    async fn auction_summaries(&self, revision: u64) -> Result<Vec<AuctionSummarySnapshot>, IndexerError>;

    /// Per-epoch validator reward breakdowns known at `revision`.
    async fn validator_rewards(&self, revision: u64) -> Result<Vec<ValidatorRewardSnapshot>, IndexerError>;
}

// ─── Snapshots ────────────────────────────────────────────────────────────────

/// One bid as the chain records it inside an auction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionTx {
    pub id: String,
    pub address: String,
    pub amount: U256,
    pub kind: BidKind,
    pub timestamp: u64,
    pub nonce: u64,
}

/// The chain's view of the present auction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionSnapshot {
    pub id: String,
    pub start_height: u64,
    pub start_epoch: u64,
    pub end_height: u64,
    pub end_epoch: u64,
    pub sequence: u64,
    pub released_mtrg: U256,
    pub reserved_mtrg: U256,
    pub reserved_price: Decimal,
    pub created_time: u64,
    pub received_mtr: U256,
    pub actual_price: Decimal,
    pub auction_txs: Vec<AuctionTx>,
}

/// The chain's final record of an ended auction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionSummarySnapshot {
    pub id: String,
    pub start_height: u64,
    pub start_epoch: u64,
    pub end_height: u64,
    pub end_epoch: u64,
    pub sequence: u64,
    pub released_mtrg: U256,
    pub reserved_mtrg: U256,
    pub reserved_price: Decimal,
    pub created_time: u64,
    pub received_mtr: U256,
    pub actual_price: Decimal,
    pub leftover: U256,
    pub txs: Vec<AuctionTx>,
    pub distributed: Vec<DistributedLot>,
}

/// The chain's reward distribution for one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRewardSnapshot {
    pub epoch: u64,
    pub base_reward: U256,
    pub total_reward: U256,
    pub rewards: Vec<RewardEntry>,
}

// ─── StoreBlockSource ─────────────────────────────────────────────────────────

/// Serves blocks already ingested into the ledger store.
///
/// "Best" is the upstream ingester's head, so downstream consumers never read
/// past what has been durably written.
pub struct StoreBlockSource {
    heads: Arc<dyn HeadStore>,
    blocks: Arc<dyn BlockRepo>,
    upstream_key: String,
}

impl StoreBlockSource {
    pub fn new(heads: Arc<dyn HeadStore>, blocks: Arc<dyn BlockRepo>) -> Self {
        Self {
            heads,
            blocks,
            upstream_key: DEFAULT_UPSTREAM_KEY.to_string(),
        }
    }

    /// Follow a different upstream consumer's head.
    pub fn with_upstream(mut self, key: impl Into<String>) -> Self {
        self.upstream_key = key.into();
        self
    }
}

#[async_trait]
impl BlockSource for StoreBlockSource {
    async fn best(&self) -> Result<u64, IndexerError> {
        Ok(self
            .heads
            .load(&self.upstream_key)
            .await?
            .map(|h| h.num)
            .unwrap_or(0))
    }

    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        self.blocks.block_by_number(number).await
    }
}
