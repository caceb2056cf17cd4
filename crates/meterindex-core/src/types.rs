//! Chain input types: blocks, transactions, clauses, and extracted transfers.
//!
//! These are immutable once stored. The ingestion path (out of scope here)
//! writes them; the reconcilers and the protocol decoder only read them.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// The all-zero address, source of mints and sink of burns.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

// ─── BlockSummary ─────────────────────────────────────────────────────────────

/// A concise block: enough for the sync engine to track progress and for the
/// processors to find the block's transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
    /// PoS epoch the block belongs to.
    pub epoch: u64,
    /// Transaction hashes in index order.
    pub tx_hashes: Vec<String>,
}

impl BlockSummary {
    /// Returns `true` if `self` directly follows block `number` with hash
    /// `hash`. An empty hash on either side only checks the number.
    pub fn extends(&self, number: u64, hash: &str) -> bool {
        self.number == number + 1
            && (hash.is_empty() || self.parent_hash.is_empty() || self.parent_hash == hash)
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number,
            hash: self.hash.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// A pointer to a block, embedded in derived rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
    pub timestamp: i64,
}

// ─── Token ────────────────────────────────────────────────────────────────────

/// Which balance a value movement touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Token {
    /// Primary token, also used to pay gas.
    Mtr,
    /// Secondary (governance) token.
    Mtrg,
    /// Any other fungible-token contract.
    Erc20,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mtr => write!(f, "MTR"),
            Self::Mtrg => write!(f, "MTRG"),
            Self::Erc20 => write!(f, "ERC20"),
        }
    }
}

// ─── Transactions ─────────────────────────────────────────────────────────────

/// One clause of a transaction: a call or a plain value movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    /// Recipient; `None` for contract creation.
    pub to: Option<String>,
    pub value: U256,
    pub token: Token,
    /// Call data (`0x…`).
    pub data: String,
}

/// A log event emitted while executing a clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

/// A value movement performed by the chain itself while executing a clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeTransfer {
    pub sender: String,
    pub recipient: String,
    pub amount: U256,
    pub token: Token,
}

/// Execution result of one clause.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub contract_address: Option<String>,
    pub events: Vec<Event>,
    pub transfers: Vec<NativeTransfer>,
}

/// A stored transaction with its receipt outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block: BlockRef,
    /// Position within the block.
    pub tx_index: u32,
    pub origin: String,
    pub gas_payer: String,
    /// Fee paid, in MTR.
    pub paid: U256,
    pub reverted: bool,
    pub clauses: Vec<Clause>,
    /// One output per clause; empty when reverted.
    pub outputs: Vec<Output>,
}

impl Transaction {
    /// A transaction is transfer-only when none of its clauses emitted an
    /// event; an event means a contract was called.
    pub fn is_transfer_only(&self) -> bool {
        self.outputs.iter().all(|o| o.events.is_empty())
    }
}

// ─── Transfer ─────────────────────────────────────────────────────────────────

/// A detected value movement. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub from: String,
    pub to: String,
    pub amount: U256,
    pub token: Token,
    /// Emitting contract for event-derived transfers.
    pub token_address: Option<String>,
    pub block: BlockRef,
    pub tx_hash: String,
    pub clause_index: u32,
    pub log_index: u32,
}

/// Uniqueness key of a [`Transfer`].
pub type TransferKey = (String, u32, u32);

impl Transfer {
    pub fn key(&self) -> TransferKey {
        (self.tx_hash.clone(), self.clause_index, self.log_index)
    }

    /// Rows owned by the native ledger, as opposed to generic token rows.
    pub fn is_ledger(&self) -> bool {
        self.token != Token::Erc20
    }
}

/// Kind of auction bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidKind {
    /// Placed by a user transaction.
    Userbid,
    /// Placed by the chain's reward distribution.
    Autobid,
}

impl BidKind {
    pub fn from_option(option: u32) -> Option<Self> {
        match option {
            0 => Some(Self::Userbid),
            1 => Some(Self::Autobid),
            _ => None,
        }
    }

    pub fn as_option(&self) -> u32 {
        match self {
            Self::Userbid => 0,
            Self::Autobid => 1,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> BlockSummary {
        BlockSummary {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: (number * 2) as i64,
            epoch: 1,
            tx_hashes: vec![],
        }
    }

    fn tx_with_outputs(outputs: Vec<Output>) -> Transaction {
        Transaction {
            hash: "0xt".into(),
            block: BlockRef::default(),
            tx_index: 0,
            origin: "0xa".into(),
            gas_payer: "0xa".into(),
            paid: U256::from(1),
            reverted: false,
            clauses: vec![],
            outputs,
        }
    }

    #[test]
    fn block_extends_parent() {
        let child = block(101, "0xbbb", "0xaaa");
        assert!(child.extends(100, "0xaaa"));
        assert!(!child.extends(100, "0xfff"));
        assert!(!child.extends(99, "0xaaa"));
        assert!(!block(102, "0xccc", "0xaaa").extends(100, "0xaaa"));
    }

    #[test]
    fn missing_hashes_only_check_the_number() {
        assert!(block(5, "0x5", "").extends(4, "0x4"));
        assert!(block(5, "0x5", "0x4").extends(4, ""));
        assert!(!block(6, "0x6", "").extends(4, ""));
    }

    #[test]
    fn native_only_transaction_is_transfer_only() {
        let tx = tx_with_outputs(vec![Output {
            contract_address: None,
            events: vec![],
            transfers: vec![NativeTransfer {
                sender: "0xa".into(),
                recipient: "0xb".into(),
                amount: U256::from(100),
                token: Token::Mtr,
            }],
        }]);
        assert!(tx.is_transfer_only());
        assert!(tx_with_outputs(vec![]).is_transfer_only());
    }

    #[test]
    fn any_event_makes_a_contract_call() {
        let tx = tx_with_outputs(vec![
            Output::default(),
            Output {
                contract_address: None,
                events: vec![Event {
                    address: "0xc".into(),
                    topics: vec![],
                    data: "0x".into(),
                }],
                transfers: vec![],
            },
        ]);
        assert!(!tx.is_transfer_only());
    }

    #[test]
    fn token_display_and_serde() {
        assert_eq!(Token::Mtrg.to_string(), "MTRG");
        assert_eq!(serde_json::to_string(&Token::Erc20).unwrap(), "\"erc20\"");
    }
}
