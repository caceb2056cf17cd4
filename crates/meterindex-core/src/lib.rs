//! meterindex-core: foundation for the Meter explorer's block consumers.
//!
//! # Architecture
//!
//! ```text
//! Supervisor
//!   └── SyncEngine (one per consumer key)
//!         ├── BlockSource     (best block + block by number)
//!         ├── HeadStore       (durable per-consumer cursor)
//!         └── BlockProcessor  (ledger reconciler, protocol decoder, ...)
//!                   └── repository traits (accounts, transfers, auctions, staking)
//! ```
//!
//! Each consumer advances its own head only after a block has been fully
//! applied, so consumers run concurrently without coordinating.

pub mod amount;
pub mod builder;
pub mod config;
pub mod cursor;
pub mod delta;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod model;
pub mod processor;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod types;

pub use amount::U256;
pub use builder::SyncConfigBuilder;
pub use config::{GenesisAllocation, IndexerConfig, LogConfig, SystemTokens};
pub use cursor::Head;
pub use delta::{Delta, DeltaError, DeltaMap};
pub use engine::SyncEngine;
pub use error::{DecodeError, IndexerError, IntegrityViolation};
pub use indexer::{EngineState, SyncConfig};
pub use processor::BlockProcessor;
pub use source::{BlockSource, ChainSource, StoreBlockSource};
pub use store::{AccountRepo, AuctionRepo, BlockRepo, HeadStore, StakingRepo, TransferRepo};
pub use supervisor::Supervisor;
pub use types::{BlockRef, BlockSummary, Token, Transaction, Transfer};
