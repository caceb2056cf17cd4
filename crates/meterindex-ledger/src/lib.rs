//! meterindex-ledger: balance reconciliation for MeterIndex.
//!
//! Two [`BlockProcessor`](meterindex_core::BlockProcessor)s share one
//! extraction step:
//!
//! - [`LedgerReconciler`] (`"account"`): native MTR/MTRG balances, fees,
//!   genesis allocations, contract creation.
//! - [`TokenReconciler`] (`"erc20"`): balances in every other token
//!   contract, plus the contract-call fee ledger.
//!
//! Both accumulate a block's movements into one net delta per key before
//! writing, and skip rows whose `last_update` already covers the block, so a
//! replayed block changes nothing.

pub mod extract;
pub mod reconciler;
pub mod token;

pub use extract::{TransferExtractor, MASTER_TOPIC, TRANSFER_TOPIC};
pub use reconciler::{LedgerReconciler, LedgerStore, LEDGER_KEY, LEDGER_TOKENS};
pub use token::{TokenReconciler, TOKEN_KEY, TOKEN_TOKENS};
