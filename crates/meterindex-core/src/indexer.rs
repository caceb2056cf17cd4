//! Sync engine configuration and state types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::IndexerError;

/// Configuration for one sync engine (one consumer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Consumer key; names the head cursor this engine owns.
    pub key: String,
    /// Maximum number of blocks processed per poll cycle.
    pub window: u64,
    /// Poll interval while far behind the best block (milliseconds).
    pub fast_forward_interval_ms: u64,
    /// Poll interval once caught up (milliseconds).
    pub steady_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            key: "default".into(),
            window: 1000,
            fast_forward_interval_ms: 500,
            steady_interval_ms: 2000,
        }
    }
}

impl SyncConfig {
    /// Sleep before the next cycle, by mode.
    pub fn interval(&self, fast_forward: bool) -> Duration {
        if fast_forward {
            Duration::from_millis(self.fast_forward_interval_ms)
        } else {
            Duration::from_millis(self.steady_interval_ms)
        }
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.key.is_empty() {
            return Err(IndexerError::Config("consumer key must not be empty".into()));
        }
        if self.window == 0 {
            return Err(IndexerError::Config(format!("'{}': window must be > 0", self.key)));
        }
        if self.fast_forward_interval_ms == 0 || self.steady_interval_ms == 0 {
            return Err(IndexerError::Config(format!(
                "'{}': poll intervals must be > 0",
                self.key
            )));
        }
        Ok(())
    }
}

/// Runtime state of a sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// No head yet; genesis not processed.
    Uninitialized,
    /// Genesis processed, no block window run yet.
    GenesisProcessed,
    /// Far behind the best block; windows are clipped by `window`.
    CatchingUp,
    /// Following the best block.
    Steady,
    /// Loop exited.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::GenesisProcessed => write!(f, "genesis-processed"),
            Self::CatchingUp => write!(f, "catching-up"),
            Self::Steady => write!(f, "steady"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
