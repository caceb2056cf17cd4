//! Staking module: payload layout, validator registry and epoch rewards.

use std::collections::HashSet;
use std::sync::Arc;

use meterindex_core::amount::U256;
use meterindex_core::error::{DecodeError, IndexerError};
use meterindex_core::model::{
    EpochReward, EpochRewardKind, EpochRewardSummary, Known, ValidatorReward,
};
use meterindex_core::source::ChainSource;
use meterindex_core::types::BidKind;

use crate::decoder::{ClauseRef, ScriptStore};
use crate::rlp::{
    encode_amount, encode_bytes, encode_hex, encode_list, encode_u64, item_amount, item_bytes,
    item_fixed_hex, item_string, item_u16, item_u32, item_u64, item_u8, list_items,
};

/// Separates the ECDSA and BLS halves of a candidate public key.
pub const PUBKEY_SEPARATOR: &str = ":::";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakingOp {
    Bound,
    Unbound,
    Candidate,
    Uncandidate,
    Delegate,
    Undelegate,
    CandidateUpdate,
    BucketUpdate,
    DelegateStatistics,
    DelegateExitJail,
    FlushAllStatistics,
    Governing,
}

impl StakingOp {
    pub fn code(&self) -> u32 {
        match self {
            Self::Bound => 1,
            Self::Unbound => 2,
            Self::Candidate => 3,
            Self::Uncandidate => 4,
            Self::Delegate => 5,
            Self::Undelegate => 6,
            Self::CandidateUpdate => 7,
            Self::BucketUpdate => 8,
            Self::DelegateStatistics => 101,
            Self::DelegateExitJail => 102,
            Self::FlushAllStatistics => 103,
            Self::Governing => 10001,
        }
    }
}

impl TryFrom<u32> for StakingOp {
    type Error = DecodeError;

    fn try_from(code: u32) -> Result<Self, DecodeError> {
        Ok(match code {
            1 => Self::Bound,
            2 => Self::Unbound,
            3 => Self::Candidate,
            4 => Self::Uncandidate,
            5 => Self::Delegate,
            6 => Self::Undelegate,
            7 => Self::CandidateUpdate,
            8 => Self::BucketUpdate,
            101 => Self::DelegateStatistics,
            102 => Self::DelegateExitJail,
            103 => Self::FlushAllStatistics,
            10001 => Self::Governing,
            opcode => {
                return Err(DecodeError::UnknownOpcode {
                    module: "staking",
                    opcode,
                })
            }
        })
    }
}

/// Staking payload, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakingBody {
    pub opcode: StakingOp,
    pub version: u32,
    pub option: u32,
    pub holder_addr: String,
    pub cand_addr: String,
    pub cand_name: String,
    pub cand_description: String,
    /// `"<ecdsa>:::<bls>"`.
    pub cand_pub_key: String,
    pub cand_ip: String,
    pub cand_port: u16,
    pub staking_id: String,
    pub amount: U256,
    pub token: u8,
    pub autobid: u8,
    pub timestamp: u64,
    pub nonce: u64,
    pub extra_data: Vec<u8>,
}

const STAKING_FIELDS: usize = 17;

impl StakingBody {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let f = list_items(payload)?;
        if f.len() != STAKING_FIELDS {
            return Err(DecodeError::Rlp {
                reason: format!("staking body has {} fields, expected {STAKING_FIELDS}", f.len()),
            });
        }
        Ok(Self {
            opcode: StakingOp::try_from(item_u32(f[0], "opcode")?)?,
            version: item_u32(f[1], "version")?,
            option: item_u32(f[2], "option")?,
            holder_addr: item_fixed_hex(f[3], 20, "holder_addr")?,
            cand_addr: item_fixed_hex(f[4], 20, "cand_addr")?,
            cand_name: item_string(f[5], "cand_name")?,
            cand_description: item_string(f[6], "cand_description")?,
            cand_pub_key: item_string(f[7], "cand_pub_key")?,
            cand_ip: item_string(f[8], "cand_ip")?,
            cand_port: item_u16(f[9], "cand_port")?,
            staking_id: item_fixed_hex(f[10], 32, "staking_id")?,
            amount: item_amount(f[11], "amount")?,
            token: item_u8(f[12], "token")?,
            autobid: item_u8(f[13], "autobid")?,
            timestamp: item_u64(f[14], "timestamp")?,
            nonce: item_u64(f[15], "nonce")?,
            extra_data: item_bytes(f[16])?.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_list(&[
            encode_u64(u64::from(self.opcode.code())),
            encode_u64(u64::from(self.version)),
            encode_u64(u64::from(self.option)),
            encode_hex(&self.holder_addr),
            encode_hex(&self.cand_addr),
            encode_bytes(self.cand_name.as_bytes()),
            encode_bytes(self.cand_description.as_bytes()),
            encode_bytes(self.cand_pub_key.as_bytes()),
            encode_bytes(self.cand_ip.as_bytes()),
            encode_u64(u64::from(self.cand_port)),
            encode_hex(&self.staking_id),
            encode_amount(self.amount),
            encode_u64(u64::from(self.token)),
            encode_u64(u64::from(self.autobid)),
            encode_u64(self.timestamp),
            encode_u64(self.nonce),
            encode_bytes(&self.extra_data),
        ])
    }

    /// The candidate fields as a [`Known`] record. Empty fields stay empty so
    /// that [`Known::merge`] treats them as unchanged.
    pub fn known(&self) -> Known {
        let (ecdsa_pk, bls_pk) = split_pub_key(&self.cand_pub_key);
        let zero_addr = self.cand_addr.trim_start_matches("0x").bytes().all(|b| b == b'0');
        Known {
            ecdsa_pk: ecdsa_pk.to_string(),
            bls_pk: bls_pk.to_string(),
            name: self.cand_name.clone(),
            description: self.cand_description.clone(),
            address: if zero_addr { String::new() } else { self.cand_addr.clone() },
            ip: self.cand_ip.clone(),
            port: self.cand_port,
        }
    }
}

/// Split `"<ecdsa>:::<bls>"`. A key without the separator is all ECDSA.
pub fn split_pub_key(key: &str) -> (&str, &str) {
    key.split_once(PUBKEY_SEPARATOR).unwrap_or((key, ""))
}

/// Applies staking calls to the store.
pub struct StakingHandler {
    store: Arc<dyn ScriptStore>,
    chain: Arc<dyn ChainSource>,
}

impl StakingHandler {
    pub fn new(store: Arc<dyn ScriptStore>, chain: Arc<dyn ChainSource>) -> Self {
        Self { store, chain }
    }

    pub async fn apply(&self, at: &ClauseRef<'_>, body: &StakingBody) -> Result<(), IndexerError> {
        match body.opcode {
            StakingOp::Candidate => self.candidate(body, false).await,
            StakingOp::CandidateUpdate => self.candidate(body, true).await,
            StakingOp::Governing => self.governing(at).await,
            op => {
                tracing::debug!(op = ?op, tx = %at.tx.hash, "staking call has no indexed state");
                Ok(())
            }
        }
    }

    async fn candidate(&self, body: &StakingBody, partial: bool) -> Result<(), IndexerError> {
        let incoming = body.known();
        if incoming.ecdsa_pk.is_empty() {
            tracing::warn!(name = %incoming.name, "candidate call without a public key, skipping");
            return Ok(());
        }

        let record = match self.store.known(&incoming.ecdsa_pk).await? {
            Some(mut existing) if partial => {
                existing.merge(&incoming);
                existing
            }
            _ => incoming,
        };
        self.store.save_known(&record).await?;
        tracing::debug!(pk = %record.ecdsa_pk, name = %record.name, "validator record saved");
        Ok(())
    }

    async fn governing(&self, at: &ClauseRef<'_>) -> Result<(), IndexerError> {
        let block = at.block;
        let epoch = block.epoch;
        let mut rewards = self.autobid_rewards(at).await?;

        let breakdown = self
            .chain
            .validator_rewards(block.number)
            .await?
            .into_iter()
            .find(|r| r.epoch == epoch);
        match breakdown {
            Some(snapshot) => {
                rewards.extend(snapshot.rewards.iter().map(|entry| EpochReward {
                    epoch,
                    block_number: block.number,
                    tx_hash: at.tx.hash.clone(),
                    clause_index: at.clause_index,
                    address: entry.address.to_lowercase(),
                    amount: entry.amount,
                    kind: EpochRewardKind::Transfer,
                    subject: entry.address.to_lowercase(),
                }));
                self.store
                    .save_validator_reward(&ValidatorReward {
                        epoch,
                        block_number: block.number,
                        base_reward: snapshot.base_reward,
                        total_reward: snapshot.total_reward,
                        rewards: snapshot.rewards,
                    })
                    .await?;
            }
            None => tracing::debug!(epoch, block = block.number, "no validator reward breakdown"),
        }

        let inserted = self.store.insert_epoch_rewards(&rewards).await?;

        if self.store.epoch_reward_summary(epoch).await?.is_none() {
            let summary = EpochRewardSummary::from_rewards(epoch, &block.block_ref(), &rewards)?;
            self.store.create_epoch_reward_summary(&summary).await?;
            tracing::info!(
                epoch,
                autobids = summary.autobid_count,
                autobid_total = %summary.autobid_total,
                transfers = summary.transfer_count,
                transfer_total = %summary.transfer_total,
                "epoch rewards summarized"
            );
        } else {
            tracing::debug!(epoch, inserted, "epoch already summarized");
        }
        Ok(())
    }

    /// Drop rewards written above block `to`. Validator records are kept.
    pub async fn rewind(&self, to: u64) -> Result<(), IndexerError> {
        let removed = self.store.delete_rewards_after(to).await?;
        tracing::info!(to, rows = removed, "staking rewards rewound");
        Ok(())
    }

    /// Autobids that appear in the present auction at this block but not at
    /// the one before it.
    async fn autobid_rewards(&self, at: &ClauseRef<'_>) -> Result<Vec<EpochReward>, IndexerError> {
        let block = at.block;
        let Some(after) = self.chain.present_auction(block.number).await? else {
            return Ok(Vec::new());
        };
        let seen: HashSet<String> = match block.number.checked_sub(1) {
            Some(prev) => self
                .chain
                .present_auction(prev)
                .await?
                .map(|a| a.auction_txs.into_iter().map(|t| t.id).collect())
                .unwrap_or_default(),
            None => HashSet::new(),
        };

        let mut rewards = Vec::new();
        for tx in after
            .auction_txs
            .into_iter()
            .filter(|t| t.kind == BidKind::Autobid && !seen.contains(&t.id))
        {
            let (tx_hash, clause_index) = match self.store.bid(&tx.id).await? {
                Some(bid) => (bid.tx_hash, bid.clause_index),
                None => (at.tx.hash.clone(), at.clause_index),
            };
            rewards.push(EpochReward {
                epoch: block.epoch,
                block_number: block.number,
                tx_hash,
                clause_index,
                address: tx.address.to_lowercase(),
                amount: tx.amount,
                kind: EpochRewardKind::Autobid,
                subject: tx.id,
            });
        }
        Ok(rewards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(opcode: StakingOp) -> StakingBody {
        StakingBody {
            opcode,
            version: 0,
            option: 0,
            holder_addr: "0x00000000000000000000000000000000000000a1".into(),
            cand_addr: "0x00000000000000000000000000000000000000c1".into(),
            cand_name: "alpha".into(),
            cand_description: "first validator".into(),
            cand_pub_key: "BKx2:::Ab9f".into(),
            cand_ip: "10.0.0.1".into(),
            cand_port: 8670,
            staking_id: format!("0x{}", "00".repeat(32)),
            amount: U256::from(2_000),
            token: 1,
            autobid: 100,
            timestamp: 1_700_000_000,
            nonce: 3,
            extra_data: vec![],
        }
    }

    #[test]
    fn body_roundtrips() {
        let body = candidate(StakingOp::Candidate);
        assert_eq!(StakingBody::decode(&body.encode()).unwrap(), body);

        let gov = StakingBody {
            cand_pub_key: String::new(),
            extra_data: vec![0xde, 0xad],
            ..candidate(StakingOp::Governing)
        };
        assert_eq!(StakingBody::decode(&gov.encode()).unwrap().opcode, StakingOp::Governing);
    }

    #[test]
    fn pub_key_splits_on_separator() {
        assert_eq!(split_pub_key("ecdsa:::bls"), ("ecdsa", "bls"));
        assert_eq!(split_pub_key("ecdsa"), ("ecdsa", ""));

        let known = candidate(StakingOp::Candidate).known();
        assert_eq!(known.ecdsa_pk, "BKx2");
        assert_eq!(known.bls_pk, "Ab9f");
        assert_eq!(known.port, 8670);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(matches!(
            StakingOp::try_from(9),
            Err(DecodeError::UnknownOpcode { module: "staking", opcode: 9 })
        ));
        assert_eq!(StakingOp::try_from(10001).unwrap(), StakingOp::Governing);
    }
}
