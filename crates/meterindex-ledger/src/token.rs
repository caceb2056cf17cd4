//! Generic fungible-token balances, plus the contract-call fee ledger.
//!
//! Same delta discipline as the native ledger, restricted to `Transfer`
//! events from contracts other than the two system tokens. A transaction's
//! fee is counted against its payer only when it called a contract (any
//! clause emitted an event).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use meterindex_core::amount::{checked_add, U256};
use meterindex_core::config::SystemTokens;
use meterindex_core::delta::DeltaMap;
use meterindex_core::error::{IndexerError, IntegrityViolation};
use meterindex_core::model::{FeeLedger, TokenBalance};
use meterindex_core::processor::BlockProcessor;
use meterindex_core::store::load_block_transactions;
use meterindex_core::types::{BlockRef, BlockSummary, Token, Transaction, Transfer, ZERO_ADDRESS};

use crate::extract::TransferExtractor;
use crate::reconciler::LedgerStore;

/// Consumer key of the token reconciler.
pub const TOKEN_KEY: &str = "erc20";

/// Transfer rows the token reconciler owns.
pub const TOKEN_TOKENS: &[Token] = &[Token::Erc20];

/// Per-payer `(fees, calls)` for one block.
type FeeTotals = HashMap<String, (U256, u64)>;

/// [`BlockProcessor`] maintaining [`TokenBalance`] and [`FeeLedger`] rows.
pub struct TokenReconciler {
    store: Arc<dyn LedgerStore>,
    extractor: TransferExtractor,
}

/// Whether `tx` pays into the fee ledger.
pub fn is_fee_worthy(tx: &Transaction) -> bool {
    !tx.clauses.is_empty() && !tx.is_transfer_only()
}

impl TokenReconciler {
    pub fn new(store: Arc<dyn LedgerStore>, tokens: &SystemTokens) -> Self {
        Self {
            store,
            extractor: TransferExtractor::new(tokens),
        }
    }

    async fn apply_balances(
        &self,
        block: &BlockSummary,
        deltas: DeltaMap<(String, String)>,
    ) -> Result<usize, IndexerError> {
        let mut rows = Vec::with_capacity(deltas.len());
        for ((address, token_address), delta) in deltas {
            if address == ZERO_ADDRESS {
                continue;
            }
            let mut row = match self.store.token_balance(&address, &token_address).await? {
                Some(row) if row.last_update.number >= block.number => continue,
                Some(row) => row,
                None => TokenBalance::new(&address, &token_address, block.block_ref()),
            };
            row.balance = delta
                .apply_to(row.balance)
                .map_err(|e| e.into_violation(&address, &token_address, block.number))?;
            row.last_update = block.block_ref();
            rows.push(row);
        }
        self.store.save_token_balances(&rows).await?;
        Ok(rows.len())
    }

    async fn apply_fees(
        &self,
        block: &BlockSummary,
        fees: FeeTotals,
    ) -> Result<usize, IndexerError> {
        let mut rows = Vec::with_capacity(fees.len());
        for (payer, (paid, calls)) in fees {
            let mut row = match self.store.fee_ledger(&payer).await? {
                Some(row) if row.last_update.number >= block.number => continue,
                Some(row) => row,
                None => FeeLedger::new(&payer, block.block_ref()),
            };
            row.charged = checked_add(row.charged, paid, &format!("fees charged to {payer}"))?;
            row.calls += calls;
            row.last_update = block.block_ref();
            rows.push(row);
        }
        self.store.save_fee_ledgers(&rows).await?;
        Ok(rows.len())
    }

    /// Generic-token transfers and per-payer fees of a block's transactions.
    fn effects(&self, txs: &[Transaction]) -> Result<(Vec<Transfer>, FeeTotals), IndexerError> {
        let mut transfers: Vec<Transfer> = Vec::new();
        let mut fees = FeeTotals::new();
        for tx in txs {
            transfers.extend(
                self.extractor
                    .extract(tx)
                    .transfers
                    .into_iter()
                    .filter(|t| t.token == Token::Erc20),
            );
            if is_fee_worthy(tx) {
                let payer = tx.gas_payer.to_lowercase();
                let slot = fees.entry(payer.clone()).or_insert((U256::ZERO, 0));
                slot.0 = checked_add(slot.0, tx.paid, &format!("fees charged to {payer}"))?;
                slot.1 += 1;
            }
        }
        Ok((transfers, fees))
    }

    /// Reverse one block's balance and fee changes on rows that had them.
    async fn unapply_block(
        &self,
        block: &BlockSummary,
        balances: &mut HashMap<(String, String), TokenBalance>,
        ledgers: &mut HashMap<String, FeeLedger>,
    ) -> Result<(), IndexerError> {
        let txs = load_block_transactions(self.store.as_ref(), block).await?;
        let (transfers, fees) = self.effects(&txs)?;

        for ((address, token_address), delta) in token_deltas(&transfers)? {
            if address == ZERO_ADDRESS {
                continue;
            }
            let key = (address.clone(), token_address.clone());
            if !balances.contains_key(&key) {
                match self.store.token_balance(&address, &token_address).await? {
                    Some(row) => balances.insert(key.clone(), row),
                    None => continue,
                };
            }
            let Some(row) = balances.get_mut(&key) else {
                continue;
            };
            if row.last_update.number < block.number {
                continue;
            }
            row.balance = delta
                .reversed()
                .apply_to(row.balance)
                .map_err(|e| e.into_violation(&address, &token_address, block.number))?;
        }

        for (payer, (paid, calls)) in fees {
            if !ledgers.contains_key(&payer) {
                match self.store.fee_ledger(&payer).await? {
                    Some(row) => ledgers.insert(payer.clone(), row),
                    None => continue,
                };
            }
            let Some(row) = ledgers.get_mut(&payer) else {
                continue;
            };
            if row.last_update.number < block.number {
                continue;
            }
            row.charged = row.charged.checked_sub(paid).ok_or_else(|| {
                IntegrityViolation::AmountOverflow {
                    context: format!("fees charged to {payer} below zero at block {}", block.number),
                }
            })?;
            row.calls = row.calls.saturating_sub(calls);
        }
        Ok(())
    }
}

/// Fold generic-token transfers into per-`(address, contract)` deltas.
fn token_deltas(transfers: &[Transfer]) -> Result<DeltaMap<(String, String)>, IntegrityViolation> {
    let mut deltas = DeltaMap::new();
    for t in transfers {
        let contract = t.token_address.clone().unwrap_or_default();
        deltas.transfer((t.from.clone(), contract.clone()), (t.to.clone(), contract), t.amount)?;
    }
    Ok(deltas)
}

#[async_trait]
impl BlockProcessor for TokenReconciler {
    fn key(&self) -> &str {
        TOKEN_KEY
    }

    async fn process_block(&self, block: &BlockSummary) -> Result<(), IndexerError> {
        let txs = load_block_transactions(self.store.as_ref(), block).await?;
        let (transfers, fees) = self.effects(&txs)?;

        let inserted = self.store.insert_transfers(&transfers).await?;

        let deltas = token_deltas(&transfers)?;
        let balances = self.apply_balances(block, deltas).await?;
        let payers = self.apply_fees(block, fees).await?;

        tracing::debug!(
            block = block.number,
            transfers = transfers.len(),
            inserted,
            balances,
            payers,
            "token block reconciled"
        );
        Ok(())
    }

    async fn rewind(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let mut balances = HashMap::new();
        let mut ledgers = HashMap::new();
        for number in (to + 1..=from).rev() {
            let Some(block) = self.store.block_by_number(number).await? else {
                tracing::debug!(block = number, "block not stored, nothing to rewind");
                continue;
            };
            self.unapply_block(&block, &mut balances, &mut ledgers).await?;
        }

        let target = match self.store.block_by_number(to).await? {
            Some(block) => block.block_ref(),
            None => BlockRef {
                number: to,
                ..BlockRef::default()
            },
        };
        let mut balances: Vec<TokenBalance> = balances.into_values().collect();
        for row in balances.iter_mut().filter(|r| r.last_update.number > to) {
            row.last_update = target.clone();
        }
        let mut ledgers: Vec<FeeLedger> = ledgers.into_values().collect();
        for row in ledgers.iter_mut().filter(|r| r.last_update.number > to) {
            row.last_update = target.clone();
        }
        self.store.save_token_balances(&balances).await?;
        self.store.save_fee_ledgers(&ledgers).await?;

        let removed = self.store.delete_transfers_after(to, TOKEN_TOKENS).await?;
        tracing::info!(
            from,
            to,
            balances = balances.len(),
            payers = ledgers.len(),
            transfers = removed,
            "token balances rewound"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::tests::transfer_event;
    use meterindex_core::store::AccountRepo;
    use meterindex_core::types::{Clause, Event, NativeTransfer, Output};
    use meterindex_storage::InMemoryStorage;

    const CONTRACT: &str = "0x00000000000000000000000000000000000000e2";
    const HOLDER: &str = "0x00000000000000000000000000000000000000b1";
    const OTHER: &str = "0x00000000000000000000000000000000000000b2";

    fn tx(clauses: usize, outputs: Vec<Output>, reverted: bool) -> Transaction {
        Transaction {
            hash: "0xt".into(),
            block: BlockRef::default(),
            tx_index: 0,
            origin: "0xa".into(),
            gas_payer: "0xa".into(),
            paid: U256::from(2),
            reverted,
            clauses: (0..clauses)
                .map(|_| Clause {
                    to: Some("0xb".into()),
                    value: U256::ZERO,
                    token: Token::Mtr,
                    data: "0x".into(),
                })
                .collect(),
            outputs,
        }
    }

    #[test]
    fn native_transfer_is_not_fee_worthy() {
        let output = Output {
            contract_address: None,
            events: vec![],
            transfers: vec![NativeTransfer {
                sender: "0xa".into(),
                recipient: "0xb".into(),
                amount: U256::from(100),
                token: Token::Mtr,
            }],
        };
        assert!(!is_fee_worthy(&tx(1, vec![output], false)));
    }

    #[test]
    fn any_event_makes_the_fee_count() {
        let outputs = vec![
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
        ];
        assert!(is_fee_worthy(&tx(2, outputs, false)));
    }

    #[test]
    fn clauseless_and_reverted_transactions_pay_nothing_here() {
        assert!(!is_fee_worthy(&tx(0, vec![], false)));
        assert!(!is_fee_worthy(&tx(1, vec![], true)));
    }

    /// Store `events` as the single transaction of block `number`.
    fn store_block(store: &InMemoryStorage, number: u64, events: Vec<Event>) -> BlockSummary {
        let hash = format!("0x{number}");
        let mut tx = tx(
            1,
            vec![Output {
                contract_address: None,
                events,
                transfers: vec![],
            }],
            false,
        );
        tx.hash = format!("0xt{number}");
        tx.block = BlockRef {
            number,
            hash: hash.clone(),
            timestamp: number as i64,
        };
        let block = BlockSummary {
            number,
            hash,
            parent_hash: format!("0x{}", number - 1),
            timestamp: number as i64,
            epoch: 0,
            tx_hashes: vec![tx.hash.clone()],
        };
        store.insert_transaction(tx);
        store.insert_block(block.clone());
        block
    }

    #[tokio::test]
    async fn wide_mints_in_one_block_accumulate() {
        let store = Arc::new(InMemoryStorage::new());
        let half = 1u128 << 95;
        let block = store_block(
            &store,
            1,
            vec![
                transfer_event(CONTRACT, ZERO_ADDRESS, HOLDER, half),
                transfer_event(CONTRACT, ZERO_ADDRESS, HOLDER, half),
            ],
        );
        let reconciler = TokenReconciler::new(store.clone(), &SystemTokens::default());

        reconciler.process_block(&block).await.unwrap();

        let balances = store.token_balances();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].address, HOLDER);
        assert_eq!(balances[0].balance, U256::from(1u8) << 96);
    }

    #[tokio::test]
    async fn overdraft_is_an_integrity_error() {
        let store = Arc::new(InMemoryStorage::new());
        let block = store_block(&store, 1, vec![transfer_event(CONTRACT, HOLDER, OTHER, 5)]);
        let reconciler = TokenReconciler::new(store.clone(), &SystemTokens::default());

        let err = reconciler.process_block(&block).await.unwrap_err();
        assert!(matches!(
            err,
            IndexerError::Integrity(IntegrityViolation::NegativeBalance { shortfall, .. })
                if shortfall == U256::from(5)
        ));
        assert!(store.token_balances().is_empty());
    }

    #[tokio::test]
    async fn rewind_restores_balances_and_fees() {
        let store = Arc::new(InMemoryStorage::new());
        let reconciler = TokenReconciler::new(store.clone(), &SystemTokens::default());
        let mint = store_block(&store, 1, vec![transfer_event(CONTRACT, ZERO_ADDRESS, HOLDER, 100)]);
        let send = store_block(&store, 2, vec![transfer_event(CONTRACT, HOLDER, OTHER, 40)]);
        reconciler.process_block(&mint).await.unwrap();
        reconciler.process_block(&send).await.unwrap();
        assert_eq!(store.fee_ledger("0xa").await.unwrap().unwrap().calls, 2);

        reconciler.rewind(3, 1).await.unwrap();

        let balances: Vec<_> = store
            .token_balances()
            .into_iter()
            .map(|b| (b.address, b.balance, b.last_update.number))
            .collect();
        assert_eq!(
            balances,
            vec![
                (HOLDER.to_string(), U256::from(100), 1),
                (OTHER.to_string(), U256::ZERO, 1),
            ]
        );
        let fees = store.fee_ledger("0xa").await.unwrap().unwrap();
        assert_eq!((fees.charged, fees.calls), (U256::from(2), 1));
        assert!(store.transfers().iter().all(|t| t.block.number <= 1));

        // A different block 2 now applies on top of the rewound state.
        let replacement = store_block(&store, 2, vec![transfer_event(CONTRACT, HOLDER, OTHER, 7)]);
        reconciler.process_block(&replacement).await.unwrap();
        let holder = store.token_balance(HOLDER, CONTRACT).await.unwrap().unwrap();
        assert_eq!(holder.balance, U256::from(93));
    }
}
