//! Derived read-model rows maintained by the processors.

use alloy_primitives::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::amount::{checked_add, ratio};
use crate::delta::{Delta, DeltaError};
use crate::error::IntegrityViolation;
use crate::types::{BidKind, BlockRef, Token};

// ─── Balances ─────────────────────────────────────────────────────────────────

/// Native-ledger state of one address. Primary key: lowercased address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub mtr_balance: U256,
    pub mtrg_balance: U256,
    pub mtr_bounded: U256,
    pub mtrg_bounded: U256,
    /// Contract bytecode, set once for contracts created on chain.
    pub code: Option<String>,
    /// Master key of a created contract.
    pub master: Option<String>,
    pub first_seen: BlockRef,
    /// Last block whose deltas were applied to this row.
    pub last_update: BlockRef,
}

impl Account {
    /// A fresh zero-balance account first touched at `seen`.
    pub fn new(address: &str, seen: BlockRef) -> Self {
        Self {
            address: address.to_lowercase(),
            mtr_balance: U256::ZERO,
            mtrg_balance: U256::ZERO,
            mtr_bounded: U256::ZERO,
            mtrg_bounded: U256::ZERO,
            code: None,
            master: None,
            first_seen: seen.clone(),
            last_update: seen,
        }
    }

    /// Balance for a native token kind. Generic tokens live in [`TokenBalance`].
    pub fn balance(&self, token: Token) -> U256 {
        match token {
            Token::Mtr => self.mtr_balance,
            Token::Mtrg => self.mtrg_balance,
            Token::Erc20 => U256::ZERO,
        }
    }

    /// Apply a block delta to the native balance of `token`, returning the
    /// new value. The balance is left untouched on error.
    pub fn apply(&mut self, token: Token, delta: &Delta) -> Result<U256, DeltaError> {
        let slot = match token {
            Token::Mtr => &mut self.mtr_balance,
            Token::Mtrg => &mut self.mtrg_balance,
            Token::Erc20 => return Ok(U256::ZERO),
        };
        *slot = delta.apply_to(*slot)?;
        Ok(*slot)
    }

    /// Whether deltas from block `number` were already applied.
    pub fn has_applied(&self, number: u64) -> bool {
        self.last_update.number >= number
    }
}

/// Balance of one address in one generic token contract.
/// Uniqueness key: `(address, token_address)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub address: String,
    pub token_address: String,
    pub balance: U256,
    pub first_seen: BlockRef,
    pub last_update: BlockRef,
}

impl TokenBalance {
    pub fn new(address: &str, token_address: &str, seen: BlockRef) -> Self {
        Self {
            address: address.to_lowercase(),
            token_address: token_address.to_lowercase(),
            balance: U256::ZERO,
            first_seen: seen.clone(),
            last_update: seen,
        }
    }
}

/// Gas charged to an address for contract calls, as counted by the token
/// reconciler's fee pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeLedger {
    pub address: String,
    pub charged: U256,
    pub calls: u64,
    pub last_update: BlockRef,
}

impl FeeLedger {
    pub fn new(address: &str, seen: BlockRef) -> Self {
        Self {
            address: address.to_lowercase(),
            charged: U256::ZERO,
            calls: 0,
            last_update: seen,
        }
    }
}

// ─── Auctions ─────────────────────────────────────────────────────────────────

/// An MTRG auction. At most one row is `pending` (the present auction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
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
    pub pending: bool,
    pub received_mtr: U256,
    pub actual_price: Decimal,
    pub leftover: U256,
    pub bid_count: u64,
    pub autobid_total: U256,
    pub userbid_total: U256,
    /// Block, tx, and clause that started the auction.
    pub block: BlockRef,
    pub tx_hash: String,
    pub clause_index: u32,
}

impl Auction {
    /// Account for an accepted bid and re-run price discovery.
    pub fn apply_bid(&mut self, kind: BidKind, amount: U256) -> Result<(), IntegrityViolation> {
        let context = format!("auction {} totals", self.id);
        let received = checked_add(self.received_mtr, amount, &context)?;
        match kind {
            BidKind::Autobid => {
                self.autobid_total = checked_add(self.autobid_total, amount, &context)?
            }
            BidKind::Userbid => {
                self.userbid_total = checked_add(self.userbid_total, amount, &context)?
            }
        }
        self.bid_count += 1;
        self.received_mtr = received;
        self.actual_price = discover_price(self.reserved_price, self.received_mtr, self.released_mtrg);
        Ok(())
    }
}

/// `max(reserved_price, received_mtr / released_mtrg)`, the chain's clearing
/// price formula. With nothing released the reserve price stands.
pub fn discover_price(reserved_price: Decimal, received_mtr: U256, released_mtrg: U256) -> Decimal {
    match ratio(received_mtr, released_mtrg) {
        Some(price) if price > reserved_price => price,
        _ => reserved_price,
    }
}

/// One MTRG lot handed out when an auction ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedLot {
    pub address: String,
    pub amount: U256,
}

/// Immutable snapshot of an ended auction, copied from the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionSummary {
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
    pub bid_count: u64,
    pub autobid_total: U256,
    pub userbid_total: U256,
    pub distributed: Vec<DistributedLot>,
    /// Block, tx, and clause that ended the auction.
    pub block: BlockRef,
    pub tx_hash: String,
    pub clause_index: u32,
}

/// One accepted bid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    /// Stable id derived from the bid's fields; matches the chain's id.
    pub id: String,
    pub auction_id: String,
    pub address: String,
    pub amount: U256,
    pub kind: BidKind,
    pub nonce: u64,
    pub timestamp: u64,
    pub block: BlockRef,
    pub tx_hash: String,
    pub clause_index: u32,
    /// `true` until the containing auction ends.
    pub pending: bool,
    pub hammer_price: Option<Decimal>,
    pub lot_amount: Option<U256>,
}

// ─── Staking rewards ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochRewardKind {
    /// Reward autobid into the present auction.
    Autobid,
    /// Reward transferred to a validator.
    Transfer,
}

/// One reward paid out at the end of an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochReward {
    pub epoch: u64,
    pub block_number: u64,
    pub tx_hash: String,
    pub clause_index: u32,
    pub address: String,
    pub amount: U256,
    pub kind: EpochRewardKind,
    /// Auction-tx id for autobids, validator address for transfers.
    pub subject: String,
}

/// Uniqueness key of an [`EpochReward`].
pub type EpochRewardKey = (u64, EpochRewardKind, String);

impl EpochReward {
    pub fn key(&self) -> EpochRewardKey {
        (self.epoch, self.kind, self.subject.clone())
    }
}

/// Per-epoch totals, written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRewardSummary {
    pub epoch: u64,
    pub block_number: u64,
    pub timestamp: i64,
    pub autobid_total: U256,
    pub autobid_count: u64,
    pub transfer_total: U256,
    pub transfer_count: u64,
}

impl EpochRewardSummary {
    /// Aggregate a set of reward rows for `epoch`.
    pub fn from_rewards(
        epoch: u64,
        block: &BlockRef,
        rewards: &[EpochReward],
    ) -> Result<Self, IntegrityViolation> {
        let mut summary = Self {
            epoch,
            block_number: block.number,
            timestamp: block.timestamp,
            autobid_total: U256::ZERO,
            autobid_count: 0,
            transfer_total: U256::ZERO,
            transfer_count: 0,
        };
        let context = format!("epoch {epoch} reward totals");
        for r in rewards.iter().filter(|r| r.epoch == epoch) {
            match r.kind {
                EpochRewardKind::Autobid => {
                    summary.autobid_total = checked_add(summary.autobid_total, r.amount, &context)?;
                    summary.autobid_count += 1;
                }
                EpochRewardKind::Transfer => {
                    summary.transfer_total = checked_add(summary.transfer_total, r.amount, &context)?;
                    summary.transfer_count += 1;
                }
            }
        }
        Ok(summary)
    }
}

/// One validator's share in an epoch's distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEntry {
    pub address: String,
    pub amount: U256,
}

/// Chain-reported validator reward breakdown for one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorReward {
    pub epoch: u64,
    pub block_number: u64,
    pub base_reward: U256,
    pub total_reward: U256,
    pub rewards: Vec<RewardEntry>,
}

/// A known validator candidate, keyed by its ECDSA public key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Known {
    pub ecdsa_pk: String,
    pub bls_pk: String,
    pub name: String,
    pub description: String,
    pub address: String,
    pub ip: String,
    pub port: u16,
}

impl Known {
    /// Partial update: every non-empty incoming field overwrites, empty means
    /// "unchanged".
    pub fn merge(&mut self, incoming: &Known) {
        fn take(slot: &mut String, value: &str) {
            if !value.is_empty() {
                *slot = value.to_string();
            }
        }
        take(&mut self.bls_pk, &incoming.bls_pk);
        take(&mut self.name, &incoming.name);
        take(&mut self.description, &incoming.description);
        take(&mut self.address, &incoming.address);
        take(&mut self.ip, &incoming.ip);
        if incoming.port != 0 {
            self.port = incoming.port;
        }
    }
}
