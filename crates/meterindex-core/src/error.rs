//! Error types for the meterindex pipeline.

use alloy_primitives::U256;
use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Source error: {0}")]
    Source(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Cooperative shutdown was requested; not a failure.
    #[error("Sync interrupted by shutdown request")]
    Interrupted,

    #[error("Integrity violation: {0}")]
    Integrity(#[from] IntegrityViolation),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Reorg detected at block {block_number}: expected parent {expected}, got {actual}")]
    ReorgDetected {
        block_number: u64,
        expected: String,
        actual: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error is the shutdown signal.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Returns `true` if the error is a data-integrity violation.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}

/// Derived state that contradicts what the pipeline expects.
///
/// These are fatal for the block being processed: the head is not advanced
/// and the step is retried (and fails again) until an operator intervenes.
#[derive(Debug, Error)]
pub enum IntegrityViolation {
    #[error("block {block_number} lists tx {tx_hash} but no transaction row exists")]
    MissingTransaction { block_number: u64, tx_hash: String },

    #[error("{address} would hold a negative {token} balance (short by {shortfall}) after block {block_number}")]
    NegativeBalance {
        address: String,
        token: String,
        shortfall: U256,
        block_number: u64,
    },

    #[error("amount overflow in {context}")]
    AmountOverflow { context: String },

    #[error("auction {incoming} started while auction {present} is still pending")]
    AuctionAlreadyPending { present: String, incoming: String },

    #[error("bid in tx {tx_hash} arrived with no present auction")]
    NoPresentAuction { tx_hash: String },

    #[error("auction {auction_id} ended but was never started")]
    UnknownAuction { auction_id: String },

    #[error("head '{key}' cannot move from {current} back to {requested}")]
    HeadRegression {
        key: String,
        current: u64,
        requested: u64,
    },
}

/// Errors that can occur while decoding a single event or clause payload.
///
/// A decode failure never aborts a block: it is logged and the event skipped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Clause data does not carry the script-engine header")]
    NotScriptData,

    #[error("RLP decode failed: {reason}")]
    Rlp { reason: String },

    #[error("Unknown {module} opcode {opcode}")]
    UnknownOpcode { module: &'static str, opcode: u32 },

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Value in '{field}' exceeds 256 bits")]
    Overflow { field: &'static str },

    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(IndexerError::Interrupted.is_interrupt());
        assert!(!IndexerError::Source("timeout".into()).is_interrupt());

        let err: IndexerError = IntegrityViolation::UnknownAuction {
            auction_id: "0x01".into(),
        }
        .into();
        assert!(err.is_integrity());
        assert!(!err.is_interrupt());
    }

    #[test]
    fn negative_balance_message_names_the_address() {
        let err = IntegrityViolation::NegativeBalance {
            address: "0xabc".into(),
            token: "MTR".into(),
            shortfall: U256::from(3),
            block_number: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xabc"));
        assert!(msg.contains("short by 3"));
    }
}
