//! In-memory storage backend.
//!
//! Implements every repository trait over plain maps, with the same
//! uniqueness keys a persistent store enforces. Useful for testing and for
//! short-lived indexers that don't need persistence.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use meterindex_core::cursor::Head;
use meterindex_core::error::IndexerError;
use meterindex_core::model::{
    Account, Auction, AuctionSummary, Bid, EpochReward, EpochRewardKey, EpochRewardSummary,
    FeeLedger, Known, TokenBalance, ValidatorReward,
};
use meterindex_core::store::{
    AccountRepo, AuctionRepo, BlockRepo, HeadStore, MemoryHeadStore, StakingRepo, TransferRepo,
};
use meterindex_core::types::{BlockSummary, Token, Transaction, Transfer, TransferKey};

/// In-memory ledger store.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    heads: MemoryHeadStore,
    blocks: Mutex<BTreeMap<u64, BlockSummary>>,
    transactions: Mutex<HashMap<String, Transaction>>,
    transfers: Mutex<BTreeMap<TransferKey, Transfer>>,
    accounts: Mutex<HashMap<String, Account>>,
    token_balances: Mutex<HashMap<(String, String), TokenBalance>>,
    fee_ledgers: Mutex<HashMap<String, FeeLedger>>,
    auctions: Mutex<HashMap<String, Auction>>,
    bids: Mutex<HashMap<String, Bid>>,
    auction_summaries: Mutex<HashMap<String, AuctionSummary>>,
    known: Mutex<HashMap<String, Known>>,
    epoch_rewards: Mutex<BTreeMap<EpochRewardKey, EpochReward>>,
    validator_rewards: Mutex<BTreeMap<u64, ValidatorReward>>,
    epoch_summaries: Mutex<BTreeMap<u64, EpochRewardSummary>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Upstream ingestion ──────────────────────────────────────────────────

    /// Record a block, as the upstream ingester would.
    pub fn insert_block(&self, block: BlockSummary) {
        self.blocks.lock().unwrap().insert(block.number, block);
    }

    /// Record a transaction, as the upstream ingester would.
    pub fn insert_transaction(&self, tx: Transaction) {
        self.transactions.lock().unwrap().insert(tx.hash.clone(), tx);
    }

    // ─── Inspection ──────────────────────────────────────────────────────────

    /// Every stored transfer, ordered by `(tx_hash, clause_index, log_index)`.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.transfers.lock().unwrap().values().cloned().collect()
    }

    /// Every account, ordered by address.
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<_> = self.accounts.lock().unwrap().values().cloned().collect();
        accounts.sort_by(|a, b| a.address.cmp(&b.address));
        accounts
    }

    pub fn token_balances(&self) -> Vec<TokenBalance> {
        let mut balances: Vec<_> = self.token_balances.lock().unwrap().values().cloned().collect();
        balances.sort_by(|a, b| (&a.token_address, &a.address).cmp(&(&b.token_address, &b.address)));
        balances
    }

    /// Every auction, ordered by sequence.
    pub fn auctions(&self) -> Vec<Auction> {
        let mut auctions: Vec<_> = self.auctions.lock().unwrap().values().cloned().collect();
        auctions.sort_by_key(|a| a.sequence);
        auctions
    }

    pub fn bids(&self) -> Vec<Bid> {
        let mut bids: Vec<_> = self.bids.lock().unwrap().values().cloned().collect();
        bids.sort_by(|a, b| (a.block.number, &a.tx_hash, a.clause_index).cmp(&(b.block.number, &b.tx_hash, b.clause_index)));
        bids
    }

    pub fn auction_summary(&self, auction_id: &str) -> Option<AuctionSummary> {
        self.auction_summaries.lock().unwrap().get(auction_id).cloned()
    }

    pub fn epoch_rewards(&self) -> Vec<EpochReward> {
        self.epoch_rewards.lock().unwrap().values().cloned().collect()
    }

    pub fn validator_reward(&self, epoch: u64) -> Option<ValidatorReward> {
        self.validator_rewards.lock().unwrap().get(&epoch).cloned()
    }
}

#[async_trait]
impl HeadStore for InMemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<Head>, IndexerError> {
        self.heads.load(key).await
    }

    async fn save(&self, head: &Head) -> Result<(), IndexerError> {
        self.heads.save(head).await
    }

    async fn rollback(&self, head: &Head) -> Result<(), IndexerError> {
        self.heads.rollback(head).await
    }

    async fn list(&self) -> Result<Vec<Head>, IndexerError> {
        self.heads.list().await
    }
}

#[async_trait]
impl BlockRepo for InMemoryStorage {
    async fn block_by_number(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        Ok(self.blocks.lock().unwrap().get(&number).cloned())
    }

    async fn transaction(&self, hash: &str) -> Result<Option<Transaction>, IndexerError> {
        Ok(self.transactions.lock().unwrap().get(hash).cloned())
    }
}

#[async_trait]
impl TransferRepo for InMemoryStorage {
    async fn insert_transfers(&self, transfers: &[Transfer]) -> Result<usize, IndexerError> {
        let mut rows = self.transfers.lock().unwrap();
        let mut inserted = 0;
        for t in transfers {
            if let std::collections::btree_map::Entry::Vacant(slot) = rows.entry(t.key()) {
                slot.insert(t.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn delete_transfers_after(
        &self,
        block_number: u64,
        tokens: &[Token],
    ) -> Result<usize, IndexerError> {
        let mut rows = self.transfers.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, t| t.block.number <= block_number || !tokens.contains(&t.token));
        Ok(before - rows.len())
    }
}

#[async_trait]
impl AccountRepo for InMemoryStorage {
    async fn account(&self, address: &str) -> Result<Option<Account>, IndexerError> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .get(&address.to_lowercase())
            .cloned())
    }

    async fn save_accounts(&self, accounts: &[Account]) -> Result<(), IndexerError> {
        let mut rows = self.accounts.lock().unwrap();
        for acc in accounts {
            rows.insert(acc.address.clone(), acc.clone());
        }
        Ok(())
    }

    async fn token_balance(
        &self,
        address: &str,
        token_address: &str,
    ) -> Result<Option<TokenBalance>, IndexerError> {
        let key = (address.to_lowercase(), token_address.to_lowercase());
        Ok(self.token_balances.lock().unwrap().get(&key).cloned())
    }

    async fn save_token_balances(&self, balances: &[TokenBalance]) -> Result<(), IndexerError> {
        let mut rows = self.token_balances.lock().unwrap();
        for b in balances {
            rows.insert((b.address.clone(), b.token_address.clone()), b.clone());
        }
        Ok(())
    }

    async fn fee_ledger(&self, address: &str) -> Result<Option<FeeLedger>, IndexerError> {
        Ok(self
            .fee_ledgers
            .lock()
            .unwrap()
            .get(&address.to_lowercase())
            .cloned())
    }

    async fn save_fee_ledgers(&self, ledgers: &[FeeLedger]) -> Result<(), IndexerError> {
        let mut rows = self.fee_ledgers.lock().unwrap();
        for l in ledgers {
            rows.insert(l.address.clone(), l.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl AuctionRepo for InMemoryStorage {
    async fn present_auction(&self) -> Result<Option<Auction>, IndexerError> {
        Ok(self
            .auctions
            .lock()
            .unwrap()
            .values()
            .find(|a| a.pending)
            .cloned())
    }

    async fn auction(&self, id: &str) -> Result<Option<Auction>, IndexerError> {
        Ok(self.auctions.lock().unwrap().get(id).cloned())
    }

    async fn save_auction(&self, auction: &Auction) -> Result<(), IndexerError> {
        self.auctions
            .lock()
            .unwrap()
            .insert(auction.id.clone(), auction.clone());
        Ok(())
    }

    async fn record_bid(&self, bid: &Bid, auction: &Auction) -> Result<bool, IndexerError> {
        // Lock order: bids, then auctions.
        let mut bids = self.bids.lock().unwrap();
        if bids.contains_key(&bid.id) {
            return Ok(false);
        }
        let mut auctions = self.auctions.lock().unwrap();
        bids.insert(bid.id.clone(), bid.clone());
        auctions.insert(auction.id.clone(), auction.clone());
        Ok(true)
    }

    async fn bid(&self, id: &str) -> Result<Option<Bid>, IndexerError> {
        Ok(self.bids.lock().unwrap().get(id).cloned())
    }

    async fn save_bid(&self, bid: &Bid) -> Result<(), IndexerError> {
        self.bids.lock().unwrap().insert(bid.id.clone(), bid.clone());
        Ok(())
    }

    async fn create_auction_summary(&self, summary: &AuctionSummary) -> Result<bool, IndexerError> {
        let mut rows = self.auction_summaries.lock().unwrap();
        if rows.contains_key(&summary.id) {
            return Ok(false);
        }
        rows.insert(summary.id.clone(), summary.clone());
        Ok(true)
    }

    async fn auction_bids(&self, auction_id: &str) -> Result<Vec<Bid>, IndexerError> {
        Ok(self
            .bids()
            .into_iter()
            .filter(|b| b.auction_id == auction_id)
            .collect())
    }

    async fn delete_auctions_after(&self, block_number: u64) -> Result<usize, IndexerError> {
        let mut rows = self.auctions.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, a| a.block.number <= block_number);
        Ok(before - rows.len())
    }

    async fn delete_bids_after(&self, block_number: u64) -> Result<Vec<Bid>, IndexerError> {
        let mut rows = self.bids.lock().unwrap();
        let removed: Vec<String> = rows
            .values()
            .filter(|b| b.block.number > block_number)
            .map(|b| b.id.clone())
            .collect();
        Ok(removed.iter().filter_map(|id| rows.remove(id)).collect())
    }

    async fn delete_auction_summaries_after(
        &self,
        block_number: u64,
    ) -> Result<Vec<AuctionSummary>, IndexerError> {
        let mut rows = self.auction_summaries.lock().unwrap();
        let removed: Vec<String> = rows
            .values()
            .filter(|s| s.block.number > block_number)
            .map(|s| s.id.clone())
            .collect();
        Ok(removed.iter().filter_map(|id| rows.remove(id)).collect())
    }
}

#[async_trait]
impl StakingRepo for InMemoryStorage {
    async fn known(&self, ecdsa_pk: &str) -> Result<Option<Known>, IndexerError> {
        Ok(self.known.lock().unwrap().get(ecdsa_pk).cloned())
    }

    async fn save_known(&self, known: &Known) -> Result<(), IndexerError> {
        self.known
            .lock()
            .unwrap()
            .insert(known.ecdsa_pk.clone(), known.clone());
        Ok(())
    }

    async fn insert_epoch_rewards(&self, rewards: &[EpochReward]) -> Result<usize, IndexerError> {
        let mut rows = self.epoch_rewards.lock().unwrap();
        let mut inserted = 0;
        for r in rewards {
            if let std::collections::btree_map::Entry::Vacant(slot) = rows.entry(r.key()) {
                slot.insert(r.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn save_validator_reward(&self, reward: &ValidatorReward) -> Result<(), IndexerError> {
        self.validator_rewards
            .lock()
            .unwrap()
            .insert(reward.epoch, reward.clone());
        Ok(())
    }

    async fn epoch_reward_summary(
        &self,
        epoch: u64,
    ) -> Result<Option<EpochRewardSummary>, IndexerError> {
        Ok(self.epoch_summaries.lock().unwrap().get(&epoch).cloned())
    }

    async fn create_epoch_reward_summary(
        &self,
        summary: &EpochRewardSummary,
    ) -> Result<bool, IndexerError> {
        let mut rows = self.epoch_summaries.lock().unwrap();
        if rows.contains_key(&summary.epoch) {
            return Ok(false);
        }
        rows.insert(summary.epoch, summary.clone());
        Ok(true)
    }

    async fn delete_rewards_after(&self, block_number: u64) -> Result<usize, IndexerError> {
        let mut removed = 0;
        {
            let mut rows = self.epoch_rewards.lock().unwrap();
            let before = rows.len();
            rows.retain(|_, r| r.block_number <= block_number);
            removed += before - rows.len();
        }
        {
            let mut rows = self.validator_rewards.lock().unwrap();
            let before = rows.len();
            rows.retain(|_, r| r.block_number <= block_number);
            removed += before - rows.len();
        }
        let mut rows = self.epoch_summaries.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, s| s.block_number <= block_number);
        Ok(removed + before - rows.len())
    }
}
