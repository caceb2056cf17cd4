//! meterindex-script: script-engine calls for MeterIndex.
//!
//! Clause data starting with [`SCRIPT_PREFIX`] carries an RLP envelope
//! addressed to the auction or staking module. [`ProtocolDecoder`] decodes
//! those calls in block order and maintains:
//!
//! - auctions, bids and auction summaries (auction module)
//! - known validators, epoch rewards and validator rewards (staking module)

pub mod auction;
pub mod decoder;
pub mod envelope;
pub mod rlp;
pub mod staking;

pub use auction::{bid_id, AuctionBody, AuctionHandler, AuctionOp};
pub use decoder::{ClauseRef, ProtocolDecoder, ScriptStore, SCRIPT_KEY};
pub use envelope::{decode_script, is_script_data, ScriptCall, AUCTION_MODULE, SCRIPT_PREFIX, STAKING_MODULE};
pub use staking::{split_pub_key, StakingBody, StakingHandler, StakingOp};
