//! Per-consumer head cursor: the last block a consumer has fully processed.

use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, IntegrityViolation};
use crate::types::BlockSummary;

/// A consumer's durable position in the chain.
///
/// One head exists per consumer key (e.g. `"account"`, `"scriptengine"`).
/// `num` only moves forward, except through an explicit rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    /// Consumer key.
    pub key: String,
    /// Last fully processed block number.
    pub num: u64,
    /// Last fully processed block hash.
    pub hash: String,
}

impl Head {
    pub fn new(key: impl Into<String>, num: u64, hash: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            num,
            hash: hash.into(),
        }
    }

    /// A head at block zero with no hash has never run genesis.
    pub fn needs_genesis(&self) -> bool {
        self.num == 0 && self.hash.is_empty()
    }

    /// Move the head to a processed block. Refuses to move backwards.
    pub fn advance(&mut self, block: &BlockSummary) -> Result<(), IndexerError> {
        if block.number < self.num {
            return Err(IntegrityViolation::HeadRegression {
                key: self.key.clone(),
                current: self.num,
                requested: block.number,
            }
            .into());
        }
        self.num = block.number;
        self.hash = block.hash.clone();
        Ok(())
    }

    /// Returns the next block to process (head + 1).
    pub fn next_block(&self) -> u64 {
        self.num + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str) -> BlockSummary {
        BlockSummary {
            number,
            hash: hash.into(),
            parent_hash: String::new(),
            timestamp: 0,
            epoch: 0,
            tx_hashes: vec![],
        }
    }

    #[test]
    fn head_advance() {
        let mut head = Head::new("account", 100, "0xaaa");
        head.advance(&block(101, "0xbbb")).unwrap();
        assert_eq!(head.num, 101);
        assert_eq!(head.hash, "0xbbb");
        assert_eq!(head.next_block(), 102);
    }

    #[test]
    fn head_refuses_to_regress() {
        let mut head = Head::new("account", 100, "0xaaa");
        let err = head.advance(&block(99, "0x999")).unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(head.num, 100);
    }

    #[test]
    fn genesis_detection() {
        assert!(Head::new("pos", 0, "").needs_genesis());
        assert!(!Head::new("pos", 0, "0xgenesis").needs_genesis());
    }
}
