//! The native ledger: MTR/MTRG balances per account.
//!
//! Per block:
//! 1. load the block's transactions (a missing row aborts the block)
//! 2. extract transfers and contract creations
//! 3. persist the ledger transfer rows (insert-or-ignore)
//! 4. fold transfers and fees into one [`DeltaMap`]
//! 5. apply each address's net delta once and save all touched accounts
//! 6. annotate created contracts with their master and code

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use meterindex_core::amount::U256;
use meterindex_core::config::{GenesisAllocation, SystemTokens};
use meterindex_core::delta::DeltaMap;
use meterindex_core::error::{IndexerError, IntegrityViolation};
use meterindex_core::model::Account;
use meterindex_core::processor::BlockProcessor;
use meterindex_core::source::ChainSource;
use meterindex_core::store::{load_block_transactions, AccountRepo, BlockRepo, TransferRepo};
use meterindex_core::types::{BlockRef, BlockSummary, Token, Transaction, Transfer, ZERO_ADDRESS};

use crate::extract::{ContractCreation, TransferExtractor};

/// Consumer key of the native ledger.
pub const LEDGER_KEY: &str = "account";

/// Transfer rows the native ledger owns.
pub const LEDGER_TOKENS: &[Token] = &[Token::Mtr, Token::Mtrg];

/// The repositories a ledger consumer reads and writes.
pub trait LedgerStore: BlockRepo + TransferRepo + AccountRepo {}

impl<T: BlockRepo + TransferRepo + AccountRepo> LedgerStore for T {}

/// Accounts touched by one block, loaded once and flushed as one batch.
struct AccountCache<'a> {
    store: &'a dyn LedgerStore,
    block: BlockRef,
    rows: HashMap<String, (Account, bool)>,
}

impl<'a> AccountCache<'a> {
    fn new(store: &'a dyn LedgerStore, block: BlockRef) -> Self {
        Self {
            store,
            block,
            rows: HashMap::new(),
        }
    }

    /// Load or create the account. The flag is `false` when this block's
    /// deltas were already applied to the stored row.
    async fn get(&mut self, address: &str) -> Result<&mut (Account, bool), IndexerError> {
        if !self.rows.contains_key(address) {
            let entry = match self.store.account(address).await? {
                Some(acc) => {
                    let fresh = !acc.has_applied(self.block.number);
                    (acc, fresh)
                }
                None => (Account::new(address, self.block.clone()), true),
            };
            self.rows.insert(address.to_string(), entry);
        }
        self.rows
            .get_mut(address)
            .ok_or_else(|| IndexerError::Other(format!("account cache lost {address}")))
    }

    fn into_rows(self) -> Vec<Account> {
        self.rows.into_values().map(|(acc, _)| acc).collect()
    }
}

/// [`BlockProcessor`] maintaining [`Account`] balances.
pub struct LedgerReconciler {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainSource>,
    extractor: TransferExtractor,
    genesis: Vec<GenesisAllocation>,
}

impl LedgerReconciler {
    pub fn new(store: Arc<dyn LedgerStore>, chain: Arc<dyn ChainSource>, tokens: &SystemTokens) -> Self {
        Self {
            store,
            chain,
            extractor: TransferExtractor::new(tokens),
            genesis: Vec::new(),
        }
    }

    /// Balances to seed when genesis is processed.
    pub fn with_genesis(mut self, allocations: Vec<GenesisAllocation>) -> Self {
        self.genesis = allocations;
        self
    }

    async fn apply_deltas(
        &self,
        block: &BlockSummary,
        deltas: DeltaMap<(String, Token)>,
        creations: &[ContractCreation],
    ) -> Result<usize, IndexerError> {
        let mut cache = AccountCache::new(self.store.as_ref(), block.block_ref());

        for ((address, token), delta) in deltas {
            if address == ZERO_ADDRESS {
                continue;
            }
            let (account, fresh) = cache.get(&address).await?;
            if !*fresh {
                continue;
            }
            account
                .apply(token, &delta)
                .map_err(|e| e.into_violation(&address, &token.to_string(), block.number))?;
        }

        for creation in creations {
            let (account, _) = cache.get(&creation.address).await?;
            if account.master.is_none() {
                account.master = Some(creation.master.clone());
            }
            if account.code.is_none() {
                account.code = self
                    .chain
                    .account_code(&creation.address, block.number)
                    .await?;
            }
            tracing::debug!(address = %creation.address, master = %creation.master, tx = %creation.tx_hash, "contract created");
        }

        let block_ref = block.block_ref();
        let mut rows = cache.into_rows();
        for acc in &mut rows {
            if acc.last_update.number < block_ref.number {
                acc.last_update = block_ref.clone();
            }
        }
        rows.sort_by(|a, b| a.address.cmp(&b.address));
        self.store.save_accounts(&rows).await?;
        Ok(rows.len())
    }

    /// Ledger transfers and contract creations of a block's transactions.
    fn effects(&self, txs: &[Transaction]) -> (Vec<Transfer>, Vec<ContractCreation>) {
        let mut transfers = Vec::new();
        let mut creations = Vec::new();
        for tx in txs {
            let effects = self.extractor.extract(tx);
            transfers.extend(effects.transfers.into_iter().filter(Transfer::is_ledger));
            creations.extend(effects.creations);
        }
        (transfers, creations)
    }

    /// Reverse one block's deltas on every account that had them applied.
    async fn unapply_block(
        &self,
        block: &BlockSummary,
        accounts: &mut HashMap<String, Account>,
    ) -> Result<(), IndexerError> {
        let txs = load_block_transactions(self.store.as_ref(), block).await?;
        let (transfers, _) = self.effects(&txs);
        let deltas = ledger_deltas(&transfers, fee_debits(&txs))?;

        for ((address, token), delta) in deltas {
            if address == ZERO_ADDRESS {
                continue;
            }
            if !accounts.contains_key(&address) {
                match self.store.account(&address).await? {
                    Some(acc) => accounts.insert(address.clone(), acc),
                    None => continue,
                };
            }
            let Some(account) = accounts.get_mut(&address) else {
                continue;
            };
            if !account.has_applied(block.number) {
                continue;
            }
            account
                .apply(token, &delta.reversed())
                .map_err(|e| e.into_violation(&address, &token.to_string(), block.number))?;
        }
        Ok(())
    }
}

/// Gas fees of a block's transactions, one debit per transaction payer.
fn fee_debits(txs: &[Transaction]) -> impl Iterator<Item = (&str, U256)> {
    txs.iter().map(|tx| (tx.gas_payer.as_str(), tx.paid))
}

/// Fold transfers and fees into per-`(address, token)` deltas.
pub(crate) fn ledger_deltas<'a>(
    transfers: impl IntoIterator<Item = &'a Transfer>,
    fees: impl IntoIterator<Item = (&'a str, U256)>,
) -> Result<DeltaMap<(String, Token)>, IntegrityViolation> {
    let mut deltas = DeltaMap::new();
    for t in transfers {
        deltas.transfer((t.from.clone(), t.token), (t.to.clone(), t.token), t.amount)?;
    }
    for (payer, paid) in fees {
        deltas.debit((payer.to_lowercase(), Token::Mtr), paid)?;
    }
    Ok(deltas)
}

#[async_trait]
impl BlockProcessor for LedgerReconciler {
    fn key(&self) -> &str {
        LEDGER_KEY
    }

    async fn process_genesis(&self, genesis: &BlockSummary) -> Result<(), IndexerError> {
        let mut seeded = Vec::new();
        for alloc in &self.genesis {
            if self.store.account(&alloc.address).await?.is_some() {
                continue;
            }
            let mut acc = Account::new(&alloc.address, genesis.block_ref());
            acc.mtr_balance = alloc.mtr;
            acc.mtrg_balance = alloc.mtrg;
            seeded.push(acc);
        }
        self.store.save_accounts(&seeded).await?;
        tracing::info!(accounts = seeded.len(), "genesis balances seeded");
        Ok(())
    }

    async fn process_block(&self, block: &BlockSummary) -> Result<(), IndexerError> {
        let txs = load_block_transactions(self.store.as_ref(), block).await?;
        let (transfers, creations) = self.effects(&txs);

        // Transfer rows land before balances move.
        let inserted = self.store.insert_transfers(&transfers).await?;

        let deltas = ledger_deltas(&transfers, fee_debits(&txs))?;
        let touched = self.apply_deltas(block, deltas, &creations).await?;

        tracing::debug!(
            block = block.number,
            txs = txs.len(),
            transfers = transfers.len(),
            inserted,
            accounts = touched,
            "ledger block reconciled"
        );
        Ok(())
    }

    async fn rewind(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let mut accounts = HashMap::new();
        for number in (to + 1..=from).rev() {
            let Some(block) = self.store.block_by_number(number).await? else {
                tracing::debug!(block = number, "block not stored, nothing to rewind");
                continue;
            };
            self.unapply_block(&block, &mut accounts).await?;
        }

        let target = match self.store.block_by_number(to).await? {
            Some(block) => block.block_ref(),
            None => BlockRef {
                number: to,
                ..BlockRef::default()
            },
        };
        let mut rows: Vec<Account> = accounts.into_values().collect();
        for acc in &mut rows {
            if acc.last_update.number > to {
                acc.last_update = target.clone();
            }
        }
        rows.sort_by(|a, b| a.address.cmp(&b.address));
        self.store.save_accounts(&rows).await?;

        let removed = self.store.delete_transfers_after(to, LEDGER_TOKENS).await?;
        tracing::info!(from, to, accounts = rows.len(), transfers = removed, "ledger rewound");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_transfer(from: &str, to: &str, amount: u64, token: Token) -> Transfer {
        Transfer {
            from: from.into(),
            to: to.into(),
            amount: U256::from(amount),
            token,
            token_address: None,
            block: BlockRef::default(),
            tx_hash: "0x".into(),
            clause_index: 0,
            log_index: 0,
        }
    }

    #[test]
    fn transfers_conserve_value_per_token() {
        let transfers = vec![
            ledger_transfer("0xa", "0xb", 100, Token::Mtr),
            ledger_transfer("0xb", "0xc", 40, Token::Mtr),
            ledger_transfer(ZERO_ADDRESS, "0xa", 7, Token::Mtrg),
            ledger_transfer("0xc", "0xa", 3, Token::Mtrg),
        ];
        let deltas = ledger_deltas(&transfers, std::iter::empty()).unwrap();
        for token in [Token::Mtr, Token::Mtrg] {
            let (credits, debits) = deltas
                .iter()
                .filter(|((_, t), _)| *t == token)
                .fold((U256::ZERO, U256::ZERO), |(c, d), (_, v)| (c + v.credit, d + v.debit));
            assert_eq!(credits, debits, "{token} not conserved");
        }
    }

    #[test]
    fn fees_are_a_separate_debit() {
        let deltas = ledger_deltas(std::iter::empty(), vec![("0xA", U256::from(5))]).unwrap();
        let fee = deltas.get(&("0xa".to_string(), Token::Mtr));
        assert_eq!((fee.credit, fee.debit), (U256::ZERO, U256::from(5)));
        assert_eq!(deltas.len(), 1);
    }
}
