//! Per-block net balance accumulator.
//!
//! Every value movement in a block is folded into one delta per key before
//! anything is written, so an address that sends and receives many times in
//! a block is written once with its net change.

use alloy_primitives::U256;
use std::collections::BTreeMap;

use crate::amount::checked_add;
use crate::error::IntegrityViolation;

/// Gross credits and debits for one key within a block.
///
/// Both sides are kept unsigned so that a net change spanning the full
/// `U256` range never needs a sign bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delta {
    pub credit: U256,
    pub debit: U256,
}

/// Why a [`Delta`] could not be applied to a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaError {
    /// The credit pushed the balance past `U256::MAX`.
    Overflow,
    /// The debit exceeds the balance plus credit by `shortfall`.
    Insufficient { shortfall: U256 },
}

impl DeltaError {
    /// The violation for `address`'s `token` balance at `block_number`.
    pub fn into_violation(self, address: &str, token: &str, block_number: u64) -> IntegrityViolation {
        match self {
            Self::Overflow => IntegrityViolation::AmountOverflow {
                context: format!("{token} balance of {address} at block {block_number}"),
            },
            Self::Insufficient { shortfall } => IntegrityViolation::NegativeBalance {
                address: address.to_string(),
                token: token.to_string(),
                shortfall,
                block_number,
            },
        }
    }
}

impl Delta {
    /// `true` when credits and debits cancel out.
    pub fn is_zero(&self) -> bool {
        self.credit == self.debit
    }

    /// The delta that undoes this one.
    pub fn reversed(&self) -> Self {
        Self {
            credit: self.debit,
            debit: self.credit,
        }
    }

    /// The new balance after applying this delta to `balance`.
    pub fn apply_to(&self, balance: U256) -> Result<U256, DeltaError> {
        if self.credit >= self.debit {
            balance
                .checked_add(self.credit - self.debit)
                .ok_or(DeltaError::Overflow)
        } else {
            let net = self.debit - self.credit;
            balance.checked_sub(net).ok_or(DeltaError::Insufficient {
                shortfall: net - balance,
            })
        }
    }
}

/// Net change per key. Iteration order is the key order.
#[derive(Debug, Clone)]
pub struct DeltaMap<K: Ord> {
    deltas: BTreeMap<K, Delta>,
}

impl<K: Ord> Default for DeltaMap<K> {
    fn default() -> Self {
        Self {
            deltas: BTreeMap::new(),
        }
    }
}

impl<K: Ord> DeltaMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` to `key`.
    pub fn credit(&mut self, key: K, amount: U256) -> Result<(), IntegrityViolation> {
        let delta = self.deltas.entry(key).or_default();
        delta.credit = checked_add(delta.credit, amount, "block credits")?;
        Ok(())
    }

    /// Subtract `amount` from `key`.
    pub fn debit(&mut self, key: K, amount: U256) -> Result<(), IntegrityViolation> {
        let delta = self.deltas.entry(key).or_default();
        delta.debit = checked_add(delta.debit, amount, "block debits")?;
        Ok(())
    }

    /// Record a movement of `amount` from `from` to `to`.
    pub fn transfer(&mut self, from: K, to: K, amount: U256) -> Result<(), IntegrityViolation> {
        self.debit(from, amount)?;
        self.credit(to, amount)
    }

    /// Delta for `key` (zero if untouched).
    pub fn get(&self, key: &K) -> Delta {
        self.deltas.get(key).copied().unwrap_or_default()
    }

    /// Every touched key, including ones whose net is zero.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &Delta)> {
        self.deltas.iter()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Sum of all net gains.
    pub fn total_credits(&self) -> U256 {
        self.deltas
            .values()
            .map(|d| d.credit.saturating_sub(d.debit))
            .fold(U256::ZERO, U256::saturating_add)
    }

    /// Sum of all net losses.
    pub fn total_debits(&self) -> U256 {
        self.deltas
            .values()
            .map(|d| d.debit.saturating_sub(d.credit))
            .fold(U256::ZERO, U256::saturating_add)
    }
}

impl<K: Ord> IntoIterator for DeltaMap<K> {
    type Item = (K, Delta);
    type IntoIter = std::collections::btree_map::IntoIter<K, Delta>;

    fn into_iter(self) -> Self::IntoIter {
        self.deltas.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(v: u64) -> U256 {
        U256::from(v)
    }

    #[test]
    fn nets_repeated_movements() {
        let mut map = DeltaMap::new();
        map.transfer("a", "b", u(10)).unwrap();
        map.transfer("b", "a", u(4)).unwrap();
        map.transfer("a", "c", u(1)).unwrap();
        assert_eq!(map.get(&"a").apply_to(u(20)), Ok(u(13)));
        assert_eq!(map.get(&"b").apply_to(U256::ZERO), Ok(u(6)));
        assert_eq!(map.get(&"c").apply_to(U256::ZERO), Ok(u(1)));
        assert!(map.get(&"z").is_zero());
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn transfers_conserve_value() {
        let mut map = DeltaMap::new();
        map.transfer("a", "b", u(100)).unwrap();
        map.transfer("b", "c", u(30)).unwrap();
        map.transfer("c", "a", u(5)).unwrap();
        assert_eq!(map.total_credits(), map.total_debits());
        assert_eq!(map.total_credits(), u(95));
    }

    #[test]
    fn zero_net_keys_stay_touched() {
        let mut map = DeltaMap::new();
        map.transfer("a", "b", u(3)).unwrap();
        map.transfer("b", "a", u(3)).unwrap();
        let keys: Vec<_> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(map.total_credits(), U256::ZERO);
    }

    #[test]
    fn debit_beyond_balance_reports_the_shortfall() {
        let mut map = DeltaMap::new();
        map.transfer("a", "b", u(10)).unwrap();
        assert_eq!(
            map.get(&"a").apply_to(u(7)),
            Err(DeltaError::Insufficient { shortfall: u(3) })
        );
    }

    #[test]
    fn reversed_delta_restores_the_balance() {
        let delta = Delta { credit: u(4), debit: u(10) };
        let after = delta.apply_to(u(20)).unwrap();
        assert_eq!(after, u(14));
        assert_eq!(delta.reversed().apply_to(after), Ok(u(20)));
    }

    #[test]
    fn wide_amounts_accumulate_without_panicking() {
        let big = U256::from(1u8) << 95;
        let mut map = DeltaMap::new();
        map.transfer("zero", "a", big).unwrap();
        map.transfer("zero", "a", big).unwrap();
        assert_eq!(map.get(&"a").apply_to(U256::ZERO), Ok(U256::from(1u8) << 96));

        let mut full = DeltaMap::new();
        full.credit("a", U256::MAX).unwrap();
        assert!(matches!(
            full.credit("a", u(1)),
            Err(IntegrityViolation::AmountOverflow { .. })
        ));
        assert_eq!(full.get(&"a").apply_to(u(1)), Err(DeltaError::Overflow));
    }
}
