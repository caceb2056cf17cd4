//! Transfer extraction from a transaction's clause outputs.
//!
//! Within one clause, native transfers take log indexes `0..n` and events
//! take `n + position`, so `(tx_hash, clause_index, log_index)` never
//! collides between the two kinds.

use meterindex_core::amount::{amount_from_be_bytes, U256};
use meterindex_core::config::SystemTokens;
use meterindex_core::error::DecodeError;
use meterindex_core::types::{Event, Token, Transaction, Transfer};

/// `keccak256("Transfer(address,address,uint256)")`
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// `keccak256("$Master(address)")`, emitted once by every newly created contract.
pub const MASTER_TOPIC: &str =
    "0xb35bf4274d4295009f1ec66ed3f579db287889444366c03d3a695539372e8951";

/// A contract created in a transaction, with its master key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCreation {
    pub address: String,
    pub master: String,
    pub tx_hash: String,
}

/// Everything the ledger needs from one transaction.
#[derive(Debug, Clone, Default)]
pub struct TxEffects {
    pub transfers: Vec<Transfer>,
    pub creations: Vec<ContractCreation>,
}

/// Maps raw outputs to [`Transfer`] rows.
#[derive(Debug, Clone)]
pub struct TransferExtractor {
    mtr: String,
    mtrg: String,
}

impl TransferExtractor {
    pub fn new(tokens: &SystemTokens) -> Self {
        Self {
            mtr: tokens.mtr.to_lowercase(),
            mtrg: tokens.mtrg.to_lowercase(),
        }
    }

    /// Classify a `Transfer` event by its emitting contract.
    fn token_of(&self, contract: &str) -> Token {
        let contract = contract.to_lowercase();
        if contract == self.mtr {
            Token::Mtr
        } else if contract == self.mtrg {
            Token::Mtrg
        } else {
            Token::Erc20
        }
    }

    /// Extract transfers and contract creations from `tx`. Reverted
    /// transactions move no value. A malformed event is logged and skipped.
    pub fn extract(&self, tx: &Transaction) -> TxEffects {
        let mut effects = TxEffects::default();
        if tx.reverted {
            return effects;
        }

        for (clause_index, output) in tx.outputs.iter().enumerate() {
            let clause_index = clause_index as u32;

            for (i, native) in output.transfers.iter().enumerate() {
                effects.transfers.push(Transfer {
                    from: native.sender.to_lowercase(),
                    to: native.recipient.to_lowercase(),
                    amount: native.amount,
                    token: native.token,
                    token_address: None,
                    block: tx.block.clone(),
                    tx_hash: tx.hash.clone(),
                    clause_index,
                    log_index: i as u32,
                });
            }

            let offset = output.transfers.len() as u32;
            for (i, event) in output.events.iter().enumerate() {
                let log_index = offset + i as u32;
                match event.topics.first().map(|t| t.to_lowercase()).as_deref() {
                    Some(TRANSFER_TOPIC) => match decode_transfer_event(event) {
                        Ok((from, to, amount)) => effects.transfers.push(Transfer {
                            from,
                            to,
                            amount,
                            token: self.token_of(&event.address),
                            token_address: Some(event.address.to_lowercase()),
                            block: tx.block.clone(),
                            tx_hash: tx.hash.clone(),
                            clause_index,
                            log_index,
                        }),
                        Err(e) => tracing::warn!(
                            tx = %tx.hash,
                            clause = clause_index,
                            log_index,
                            error = %e,
                            "skipping malformed Transfer event"
                        ),
                    },
                    Some(MASTER_TOPIC) => match word_address(&event.data, 0) {
                        Ok(master) => effects.creations.push(ContractCreation {
                            address: event.address.to_lowercase(),
                            master,
                            tx_hash: tx.hash.clone(),
                        }),
                        Err(e) => tracing::warn!(
                            tx = %tx.hash,
                            clause = clause_index,
                            error = %e,
                            "skipping malformed $Master event"
                        ),
                    },
                    _ => {}
                }
            }
        }
        effects
    }
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

/// Decode a 0x-prefixed hex string.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, DecodeError> {
    hex::decode(strip_0x(s)).map_err(|e| DecodeError::InvalidHex(format!("{s}: {e}")))
}

/// The address held in the low 20 bytes of the `index`-th 32-byte word.
fn word_address(data: &str, index: usize) -> Result<String, DecodeError> {
    let bytes = decode_hex(data)?;
    let word = bytes
        .get(index * 32..(index + 1) * 32)
        .ok_or_else(|| DecodeError::InvalidField {
            field: "address",
            reason: format!("expected word {index}, data is {} bytes", bytes.len()),
        })?;
    Ok(format!("0x{}", hex::encode(&word[12..])))
}

/// Decode `Transfer(address indexed from, address indexed to, uint256 value)`.
pub fn decode_transfer_event(event: &Event) -> Result<(String, String, U256), DecodeError> {
    if event.topics.len() != 3 {
        return Err(DecodeError::InvalidField {
            field: "topics",
            reason: format!("expected 3 topics, got {}", event.topics.len()),
        });
    }
    let from = word_address(&event.topics[1], 0)?;
    let to = word_address(&event.topics[2], 0)?;
    let data = decode_hex(&event.data)?;
    if data.len() != 32 {
        return Err(DecodeError::InvalidField {
            field: "value",
            reason: format!("expected a 32-byte word, got {} bytes", data.len()),
        });
    }
    let amount = amount_from_be_bytes(&data, "value")?;
    Ok((from, to, amount))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use meterindex_core::types::{BlockRef, NativeTransfer, Output};

    pub(crate) fn topic_for(address: &str) -> String {
        format!("0x{:0>64}", strip_0x(address))
    }

    pub(crate) fn word(value: u128) -> String {
        format!("0x{value:064x}")
    }

    pub(crate) fn transfer_event(contract: &str, from: &str, to: &str, value: u128) -> Event {
        Event {
            address: contract.into(),
            topics: vec![TRANSFER_TOPIC.into(), topic_for(from), topic_for(to)],
            data: word(value),
        }
    }

    fn tx(outputs: Vec<Output>, reverted: bool) -> Transaction {
        Transaction {
            hash: "0xt1".into(),
            block: BlockRef {
                number: 9,
                hash: "0x9".into(),
                timestamp: 90,
            },
            tx_index: 0,
            origin: "0xaa".into(),
            gas_payer: "0xaa".into(),
            paid: U256::from(1),
            reverted,
            clauses: vec![],
            outputs,
        }
    }

    const FROM: &str = "0x1111111111111111111111111111111111111111";
    const TO: &str = "0x2222222222222222222222222222222222222222";

    #[test]
    fn native_and_event_rows_get_disjoint_log_indexes() {
        let tokens = SystemTokens::default();
        let extractor = TransferExtractor::new(&tokens);
        let output = Output {
            contract_address: None,
            events: vec![
                transfer_event(&tokens.mtrg, FROM, TO, 50),
                transfer_event("0x00000000000000000000000000000000000000e2", FROM, TO, 7),
            ],
            transfers: vec![NativeTransfer {
                sender: FROM.into(),
                recipient: TO.into(),
                amount: U256::from(100),
                token: Token::Mtr,
            }],
        };

        let effects = extractor.extract(&tx(vec![output], false));
        let rows: Vec<_> = effects
            .transfers
            .iter()
            .map(|t| (t.log_index, t.token, t.amount))
            .collect();
        assert_eq!(
            rows,
            vec![
                (0, Token::Mtr, U256::from(100)),
                (1, Token::Mtrg, U256::from(50)),
                (2, Token::Erc20, U256::from(7)),
            ]
        );
        assert_eq!(effects.transfers[1].from, FROM);
        assert_eq!(effects.transfers[1].to, TO);
    }

    #[test]
    fn full_width_event_values_are_kept() {
        let mut event = transfer_event("0xe2", FROM, TO, 0);
        event.data = format!("0x{}", "ff".repeat(32));
        let (_, _, amount) = decode_transfer_event(&event).unwrap();
        assert_eq!(amount, U256::MAX);
    }

    #[test]
    fn reverted_transactions_move_nothing() {
        let extractor = TransferExtractor::new(&SystemTokens::default());
        let output = Output {
            contract_address: None,
            events: vec![],
            transfers: vec![NativeTransfer {
                sender: FROM.into(),
                recipient: TO.into(),
                amount: U256::from(100),
                token: Token::Mtr,
            }],
        };
        assert!(extractor.extract(&tx(vec![output], true)).transfers.is_empty());
    }

    #[test]
    fn malformed_events_are_skipped() {
        let extractor = TransferExtractor::new(&SystemTokens::default());
        let mut bad = transfer_event("0xe2", FROM, TO, 1);
        bad.data = "0xzz".into();
        let mut short = transfer_event("0xe2", FROM, TO, 1);
        short.topics.pop();
        let output = Output {
            contract_address: None,
            events: vec![bad, short, transfer_event("0xe2", FROM, TO, 3)],
            transfers: vec![],
        };

        let effects = extractor.extract(&tx(vec![output], false));
        assert_eq!(effects.transfers.len(), 1);
        assert_eq!(effects.transfers[0].log_index, 2);
    }

    #[test]
    fn master_event_marks_contract_creation() {
        let extractor = TransferExtractor::new(&SystemTokens::default());
        let output = Output {
            contract_address: Some("0xCCCC".into()),
            events: vec![Event {
                address: "0xCCCC".into(),
                topics: vec![MASTER_TOPIC.into()],
                data: topic_for(FROM),
            }],
            transfers: vec![],
        };

        let effects = extractor.extract(&tx(vec![output], false));
        assert_eq!(
            effects.creations,
            vec![ContractCreation {
                address: "0xcccc".into(),
                master: FROM.into(),
                tx_hash: "0xt1".into(),
            }]
        );
    }
}
