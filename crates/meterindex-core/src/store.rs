//! Repository traits for the ledger store, plus an in-memory head store.
//!
//! The store is a thin keyed CRUD layer. Its uniqueness constraints are what
//! make re-processing a block safe: inserts keyed on an existing row are
//! no-ops, so a block replayed after a crash writes nothing twice.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::cursor::Head;
use crate::error::{IndexerError, IntegrityViolation};
use crate::model::{
    Account, Auction, AuctionSummary, Bid, EpochReward, EpochRewardSummary, FeeLedger, Known,
    TokenBalance, ValidatorReward,
};
use crate::types::{BlockSummary, Token, Transaction, Transfer};

/// Durable per-consumer cursors.
#[async_trait]
pub trait HeadStore: Send + Sync {
    /// Load the head for a consumer key.
    async fn load(&self, key: &str) -> Result<Option<Head>, IndexerError>;

    /// Save (upsert) a head. Saving a lower `num` than the stored one is a
    /// [`IntegrityViolation::HeadRegression`].
    async fn save(&self, head: &Head) -> Result<(), IndexerError>;

    /// Administrative rollback: move a head to `head.num`, even backwards.
    async fn rollback(&self, head: &Head) -> Result<(), IndexerError>;

    /// All stored heads, ordered by key.
    async fn list(&self) -> Result<Vec<Head>, IndexerError>;
}

/// Blocks and transactions written by the upstream ingester.
#[async_trait]
pub trait BlockRepo: Send + Sync {
    async fn block_by_number(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError>;

    async fn transaction(&self, hash: &str) -> Result<Option<Transaction>, IndexerError>;
}

#[async_trait]
pub trait TransferRepo: Send + Sync {
    /// Bulk insert, ignoring rows whose `(tx_hash, clause_index, log_index)`
    /// already exists. Returns the number of rows actually inserted.
    async fn insert_transfers(&self, transfers: &[Transfer]) -> Result<usize, IndexerError>;

    /// Delete transfers of the given token kinds above `block_number`.
    /// Returns the number removed.
    async fn delete_transfers_after(
        &self,
        block_number: u64,
        tokens: &[Token],
    ) -> Result<usize, IndexerError>;
}

#[async_trait]
pub trait AccountRepo: Send + Sync {
    async fn account(&self, address: &str) -> Result<Option<Account>, IndexerError>;

    /// Upsert a batch of accounts by address.
    async fn save_accounts(&self, accounts: &[Account]) -> Result<(), IndexerError>;

    async fn token_balance(
        &self,
        address: &str,
        token_address: &str,
    ) -> Result<Option<TokenBalance>, IndexerError>;

    /// Upsert a batch of token balances by `(address, token_address)`.
    async fn save_token_balances(&self, balances: &[TokenBalance]) -> Result<(), IndexerError>;

    async fn fee_ledger(&self, address: &str) -> Result<Option<FeeLedger>, IndexerError>;

    async fn save_fee_ledgers(&self, ledgers: &[FeeLedger]) -> Result<(), IndexerError>;
}

#[async_trait]
pub trait AuctionRepo: Send + Sync {
    /// The single auction with `pending = true`, if any.
    async fn present_auction(&self) -> Result<Option<Auction>, IndexerError>;

    async fn auction(&self, id: &str) -> Result<Option<Auction>, IndexerError>;

    /// Upsert an auction by id.
    async fn save_auction(&self, auction: &Auction) -> Result<(), IndexerError>;

    /// Insert `bid` and save `auction` as one unit. If the bid id already
    /// exists nothing is written and `false` is returned.
    async fn record_bid(&self, bid: &Bid, auction: &Auction) -> Result<bool, IndexerError>;

    async fn bid(&self, id: &str) -> Result<Option<Bid>, IndexerError>;

    async fn save_bid(&self, bid: &Bid) -> Result<(), IndexerError>;

    /// Insert unless a summary for the same auction id exists.
    async fn create_auction_summary(&self, summary: &AuctionSummary) -> Result<bool, IndexerError>;

    /// Every bid placed into `auction_id`.
    async fn auction_bids(&self, auction_id: &str) -> Result<Vec<Bid>, IndexerError>;

    /// Delete auctions started above `block_number`. Returns the number removed.
    async fn delete_auctions_after(&self, block_number: u64) -> Result<usize, IndexerError>;

    /// Delete bids placed above `block_number`, returning them.
    async fn delete_bids_after(&self, block_number: u64) -> Result<Vec<Bid>, IndexerError>;

    /// Delete summaries of auctions ended above `block_number`, returning them.
    async fn delete_auction_summaries_after(
        &self,
        block_number: u64,
    ) -> Result<Vec<AuctionSummary>, IndexerError>;
}

#[async_trait]
pub trait StakingRepo: Send + Sync {
    async fn known(&self, ecdsa_pk: &str) -> Result<Option<Known>, IndexerError>;

    async fn save_known(&self, known: &Known) -> Result<(), IndexerError>;

    /// Bulk insert, ignoring rows whose `(epoch, kind, subject)` exists.
    async fn insert_epoch_rewards(&self, rewards: &[EpochReward]) -> Result<usize, IndexerError>;

    /// Upsert by epoch.
    async fn save_validator_reward(&self, reward: &ValidatorReward) -> Result<(), IndexerError>;

    async fn epoch_reward_summary(
        &self,
        epoch: u64,
    ) -> Result<Option<EpochRewardSummary>, IndexerError>;

    /// Insert unless a summary for the epoch exists.
    async fn create_epoch_reward_summary(
        &self,
        summary: &EpochRewardSummary,
    ) -> Result<bool, IndexerError>;

    /// Delete epoch rewards, validator rewards, and epoch summaries written
    /// above `block_number`. Returns the number of rows removed.
    async fn delete_rewards_after(&self, block_number: u64) -> Result<usize, IndexerError>;
}

/// Load every transaction a block lists, in transaction-index order.
///
/// A listed hash with no stored row means the upstream ingester has not
/// finished writing the block; that is fatal for the current step.
pub async fn load_block_transactions<R>(
    repo: &R,
    block: &BlockSummary,
) -> Result<Vec<Transaction>, IndexerError>
where
    R: BlockRepo + ?Sized,
{
    let mut txs = Vec::with_capacity(block.tx_hashes.len());
    for hash in &block.tx_hashes {
        match repo.transaction(hash).await? {
            Some(tx) => txs.push(tx),
            None => {
                return Err(IntegrityViolation::MissingTransaction {
                    block_number: block.number,
                    tx_hash: hash.clone(),
                }
                .into())
            }
        }
    }
    txs.sort_by_key(|tx| tx.tx_index);
    Ok(txs)
}

// ─── In-memory head store (for testing) ──────────────────────────────────────

/// In-memory head store for tests and ephemeral consumers.
#[derive(Default)]
pub struct MemoryHeadStore {
    data: Mutex<HashMap<String, Head>>,
}

impl MemoryHeadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HeadStore for MemoryHeadStore {
    async fn load(&self, key: &str) -> Result<Option<Head>, IndexerError> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn save(&self, head: &Head) -> Result<(), IndexerError> {
        let mut data = self.data.lock().unwrap();
        if let Some(current) = data.get(&head.key) {
            if head.num < current.num {
                return Err(IntegrityViolation::HeadRegression {
                    key: head.key.clone(),
                    current: current.num,
                    requested: head.num,
                }
                .into());
            }
        }
        data.insert(head.key.clone(), head.clone());
        Ok(())
    }

    async fn rollback(&self, head: &Head) -> Result<(), IndexerError> {
        self.data.lock().unwrap().insert(head.key.clone(), head.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Head>, IndexerError> {
        let mut heads: Vec<Head> = self.data.lock().unwrap().values().cloned().collect();
        heads.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(heads)
    }
}
