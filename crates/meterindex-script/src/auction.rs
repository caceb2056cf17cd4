//! Auction module: payload layout and the present-auction state machine.
//!
//! `NoPresentAuction --Start--> Pending --Bid*--> Pending --End--> Ended`
//!
//! Start and End take their amounts from the chain's own snapshots; Bid
//! keeps provisional running totals that End overwrites with the chain's
//! final figures.

use std::collections::BTreeSet;
use std::sync::Arc;
use tiny_keccak::{Hasher, Keccak};

use meterindex_core::amount::{checked_add, div_by_price, U256};
use meterindex_core::error::{DecodeError, IndexerError, IntegrityViolation};
use meterindex_core::model::{Auction, AuctionSummary, Bid};
use meterindex_core::source::{AuctionSummarySnapshot, ChainSource};
use meterindex_core::types::BidKind;

use crate::decoder::{ClauseRef, ScriptStore};
use crate::rlp::{
    encode_amount, encode_hex, encode_list, encode_u64, item_amount, item_fixed_hex, item_u32,
    item_u64, item_u8, list_items,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionOp {
    Start,
    End,
    Bid,
}

impl AuctionOp {
    pub fn code(&self) -> u32 {
        match self {
            Self::Start => 1,
            Self::End => 2,
            Self::Bid => 3,
        }
    }
}

impl TryFrom<u32> for AuctionOp {
    type Error = DecodeError;

    fn try_from(code: u32) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(Self::Start),
            2 => Ok(Self::End),
            3 => Ok(Self::Bid),
            opcode => Err(DecodeError::UnknownOpcode {
                module: "auction",
                opcode,
            }),
        }
    }
}

/// Auction payload, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuctionBody {
    pub opcode: AuctionOp,
    pub version: u32,
    /// For Bid: `0` userbid, `1` autobid.
    pub option: u32,
    pub start_height: u64,
    pub start_epoch: u64,
    pub end_height: u64,
    pub end_epoch: u64,
    pub sequence: u64,
    /// 32-byte auction id, `0x` hex.
    pub auction_id: String,
    /// 20-byte bidder address, `0x` hex.
    pub bidder: String,
    pub amount: U256,
    pub reserve_amount: U256,
    pub token: u8,
    pub timestamp: u64,
    pub nonce: u64,
}

const AUCTION_FIELDS: usize = 15;

impl AuctionBody {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let f = list_items(payload)?;
        if f.len() != AUCTION_FIELDS {
            return Err(DecodeError::Rlp {
                reason: format!("auction body has {} fields, expected {AUCTION_FIELDS}", f.len()),
            });
        }
        let body = Self {
            opcode: AuctionOp::try_from(item_u32(f[0], "opcode")?)?,
            version: item_u32(f[1], "version")?,
            option: item_u32(f[2], "option")?,
            start_height: item_u64(f[3], "start_height")?,
            start_epoch: item_u64(f[4], "start_epoch")?,
            end_height: item_u64(f[5], "end_height")?,
            end_epoch: item_u64(f[6], "end_epoch")?,
            sequence: item_u64(f[7], "sequence")?,
            auction_id: item_fixed_hex(f[8], 32, "auction_id")?,
            bidder: item_fixed_hex(f[9], 20, "bidder")?,
            amount: item_amount(f[10], "amount")?,
            reserve_amount: item_amount(f[11], "reserve_amount")?,
            token: item_u8(f[12], "token")?,
            timestamp: item_u64(f[13], "timestamp")?,
            nonce: item_u64(f[14], "nonce")?,
        };
        if body.opcode == AuctionOp::Bid && BidKind::from_option(body.option).is_none() {
            return Err(DecodeError::InvalidField {
                field: "option",
                reason: format!("unknown bid option {}", body.option),
            });
        }
        Ok(body)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_list(&[
            encode_u64(u64::from(self.opcode.code())),
            encode_u64(u64::from(self.version)),
            encode_u64(u64::from(self.option)),
            encode_u64(self.start_height),
            encode_u64(self.start_epoch),
            encode_u64(self.end_height),
            encode_u64(self.end_epoch),
            encode_u64(self.sequence),
            encode_hex(&self.auction_id),
            encode_hex(&self.bidder),
            encode_amount(self.amount),
            encode_amount(self.reserve_amount),
            encode_u64(u64::from(self.token)),
            encode_u64(self.timestamp),
            encode_u64(self.nonce),
        ])
    }

    /// Bid kind from `option`. Validated at decode time for Bid calls.
    pub fn bid_kind(&self) -> BidKind {
        BidKind::from_option(self.option).unwrap_or(BidKind::Userbid)
    }

    fn is_zero_id(&self) -> bool {
        self.auction_id.trim_start_matches("0x").bytes().all(|b| b == b'0')
    }
}

/// The chain's id for a bid:
/// `keccak256(rlp([address, amount, kind, timestamp, nonce]))`.
pub fn bid_id(address: &str, amount: U256, kind: BidKind, timestamp: u64, nonce: u64) -> String {
    let encoded = encode_list(&[
        encode_hex(address),
        encode_amount(amount),
        encode_u64(u64::from(kind.as_option())),
        encode_u64(timestamp),
        encode_u64(nonce),
    ]);
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(&encoded);
    hasher.finalize(&mut output);
    format!("0x{}", hex::encode(output))
}

/// Applies auction calls to the store.
pub struct AuctionHandler {
    store: Arc<dyn ScriptStore>,
    chain: Arc<dyn ChainSource>,
}

impl AuctionHandler {
    pub fn new(store: Arc<dyn ScriptStore>, chain: Arc<dyn ChainSource>) -> Self {
        Self { store, chain }
    }

    pub async fn apply(&self, at: &ClauseRef<'_>, body: &AuctionBody) -> Result<(), IndexerError> {
        match body.opcode {
            AuctionOp::Start => self.start(at).await,
            AuctionOp::Bid => self.bid(at, body).await,
            AuctionOp::End => self.end(at, body).await,
        }
    }

    async fn start(&self, at: &ClauseRef<'_>) -> Result<(), IndexerError> {
        let snapshot = self
            .chain
            .present_auction(at.block.number)
            .await?
            .ok_or_else(|| {
                IndexerError::Source(format!("no present auction at block {}", at.block.number))
            })?;

        if let Some(present) = self.store.present_auction().await? {
            if present.id == snapshot.id {
                tracing::debug!(auction = %present.id, "auction start already recorded");
                return Ok(());
            }
            return Err(IntegrityViolation::AuctionAlreadyPending {
                present: present.id,
                incoming: snapshot.id,
            }
            .into());
        }
        if self.store.auction(&snapshot.id).await?.is_some() {
            tracing::debug!(auction = %snapshot.id, "auction already ended, start ignored");
            return Ok(());
        }

        let auction = Auction {
            id: snapshot.id,
            start_height: snapshot.start_height,
            start_epoch: snapshot.start_epoch,
            end_height: snapshot.end_height,
            end_epoch: snapshot.end_epoch,
            sequence: snapshot.sequence,
            released_mtrg: snapshot.released_mtrg,
            reserved_mtrg: snapshot.reserved_mtrg,
            reserved_price: snapshot.reserved_price,
            created_time: snapshot.created_time,
            pending: true,
            received_mtr: U256::ZERO,
            actual_price: snapshot.reserved_price,
            leftover: U256::ZERO,
            bid_count: 0,
            autobid_total: U256::ZERO,
            userbid_total: U256::ZERO,
            block: at.block.block_ref(),
            tx_hash: at.tx.hash.clone(),
            clause_index: at.clause_index,
        };
        self.store.save_auction(&auction).await?;
        tracing::info!(
            auction = %auction.id,
            sequence = auction.sequence,
            released = %auction.released_mtrg,
            "auction started"
        );
        Ok(())
    }

    async fn bid(&self, at: &ClauseRef<'_>, body: &AuctionBody) -> Result<(), IndexerError> {
        let kind = body.bid_kind();
        let id = bid_id(&body.bidder, body.amount, kind, body.timestamp, body.nonce);

        // A replayed block may hold the bid and the End that closed its auction.
        if self.store.bid(&id).await?.is_some() {
            tracing::debug!(bid = %id, "bid already recorded");
            return Ok(());
        }

        let mut auction = self
            .store
            .present_auction()
            .await?
            .ok_or_else(|| IntegrityViolation::NoPresentAuction {
                tx_hash: at.tx.hash.clone(),
            })?;

        auction.apply_bid(kind, body.amount)?;
        let bid = Bid {
            id,
            auction_id: auction.id.clone(),
            address: body.bidder.clone(),
            amount: body.amount,
            kind,
            nonce: body.nonce,
            timestamp: body.timestamp,
            block: at.block.block_ref(),
            tx_hash: at.tx.hash.clone(),
            clause_index: at.clause_index,
            pending: true,
            hammer_price: None,
            lot_amount: None,
        };

        if self.store.record_bid(&bid, &auction).await? {
            tracing::debug!(
                auction = %auction.id,
                bid = %bid.id,
                amount = %bid.amount,
                price = %auction.actual_price,
                "bid recorded"
            );
        } else {
            tracing::debug!(bid = %bid.id, "bid already recorded");
        }
        Ok(())
    }

    async fn end(&self, at: &ClauseRef<'_>, body: &AuctionBody) -> Result<(), IndexerError> {
        let target = if body.is_zero_id() {
            match self.store.present_auction().await? {
                Some(present) => present.id,
                None => {
                    tracing::warn!(tx = %at.tx.hash, "auction end with no present auction, skipping");
                    return Ok(());
                }
            }
        } else {
            body.auction_id.clone()
        };

        let mut auction = self
            .store
            .auction(&target)
            .await?
            .ok_or_else(|| IntegrityViolation::UnknownAuction {
                auction_id: target.clone(),
            })?;
        if !auction.pending {
            tracing::warn!(auction = %auction.id, tx = %at.tx.hash, "auction already ended, skipping");
            return Ok(());
        }

        let snapshot = self
            .chain
            .auction_summaries(at.block.number)
            .await?
            .into_iter()
            .find(|s| s.id == target)
            .ok_or_else(|| {
                IndexerError::Source(format!(
                    "no summary for auction {target} at block {}",
                    at.block.number
                ))
            })?;

        let (autobid_total, userbid_total) = split_totals(&snapshot)?;
        let summary = AuctionSummary {
            id: snapshot.id.clone(),
            start_height: snapshot.start_height,
            start_epoch: snapshot.start_epoch,
            end_height: snapshot.end_height,
            end_epoch: snapshot.end_epoch,
            sequence: snapshot.sequence,
            released_mtrg: snapshot.released_mtrg,
            reserved_mtrg: snapshot.reserved_mtrg,
            reserved_price: snapshot.reserved_price,
            created_time: snapshot.created_time,
            received_mtr: snapshot.received_mtr,
            actual_price: snapshot.actual_price,
            leftover: snapshot.leftover,
            bid_count: snapshot.txs.len() as u64,
            autobid_total,
            userbid_total,
            distributed: snapshot.distributed.clone(),
            block: at.block.block_ref(),
            tx_hash: at.tx.hash.clone(),
            clause_index: at.clause_index,
        };
        if !self.store.create_auction_summary(&summary).await? {
            tracing::debug!(auction = %summary.id, "auction summary already exists");
        }

        for tx in &snapshot.txs {
            let Some(mut bid) = self.store.bid(&tx.id).await? else {
                tracing::warn!(auction = %target, bid = %tx.id, "settled bid not indexed locally");
                continue;
            };
            bid.pending = false;
            bid.hammer_price = Some(snapshot.actual_price);
            bid.lot_amount = div_by_price(bid.amount, snapshot.actual_price);
            self.store.save_bid(&bid).await?;
        }

        auction.pending = false;
        auction.end_height = snapshot.end_height;
        auction.end_epoch = snapshot.end_epoch;
        auction.released_mtrg = snapshot.released_mtrg;
        auction.reserved_mtrg = snapshot.reserved_mtrg;
        auction.received_mtr = snapshot.received_mtr;
        auction.actual_price = snapshot.actual_price;
        auction.leftover = snapshot.leftover;
        auction.bid_count = snapshot.txs.len() as u64;
        auction.autobid_total = autobid_total;
        auction.userbid_total = userbid_total;
        self.store.save_auction(&auction).await?;

        tracing::info!(
            auction = %auction.id,
            received = %auction.received_mtr,
            price = %auction.actual_price,
            bids = auction.bid_count,
            "auction ended"
        );
        Ok(())
    }

    /// Drop auction rows written above block `to`. Auctions that started at
    /// or below `to` get their totals rebuilt from the bids that remain, and
    /// reopen if their end was removed.
    pub async fn rewind(&self, to: u64) -> Result<(), IndexerError> {
        let bids = self.store.delete_bids_after(to).await?;
        let summaries = self.store.delete_auction_summaries_after(to).await?;
        let started = self.store.delete_auctions_after(to).await?;

        let reopened: BTreeSet<String> = summaries.into_iter().map(|s| s.id).collect();
        let touched: BTreeSet<String> = bids
            .iter()
            .map(|b| b.auction_id.clone())
            .chain(reopened.iter().cloned())
            .collect();

        for id in &touched {
            let Some(mut auction) = self.store.auction(id).await? else {
                continue;
            };
            let reopen = reopened.contains(id);
            if !auction.pending && !reopen {
                continue;
            }

            auction.pending = true;
            auction.received_mtr = U256::ZERO;
            auction.autobid_total = U256::ZERO;
            auction.userbid_total = U256::ZERO;
            auction.bid_count = 0;
            auction.leftover = U256::ZERO;
            auction.actual_price = auction.reserved_price;
            for mut bid in self.store.auction_bids(id).await? {
                auction.apply_bid(bid.kind, bid.amount)?;
                if !bid.pending {
                    bid.pending = true;
                    bid.hammer_price = None;
                    bid.lot_amount = None;
                    self.store.save_bid(&bid).await?;
                }
            }
            self.store.save_auction(&auction).await?;
            tracing::debug!(auction = %id, bids = auction.bid_count, reopened = reopen, "auction rebuilt");
        }

        tracing::info!(
            to,
            bids = bids.len(),
            reopened = reopened.len(),
            removed = started,
            "auctions rewound"
        );
        Ok(())
    }
}

/// `(autobid_total, userbid_total)` over a summary's bids.
fn split_totals(snapshot: &AuctionSummarySnapshot) -> Result<(U256, U256), IntegrityViolation> {
    let context = format!("bid totals of auction {}", snapshot.id);
    snapshot
        .txs
        .iter()
        .try_fold((U256::ZERO, U256::ZERO), |(auto, user), tx| match tx.kind {
            BidKind::Autobid => Ok((checked_add(auto, tx.amount, &context)?, user)),
            BidKind::Userbid => Ok((auto, checked_add(user, tx.amount, &context)?)),
        })
}
