//! Fluent builder API for sync engine configuration.
//!
//! # Example
//!
//! ```rust
//! use meterindex_core::builder::SyncConfigBuilder;
//!
//! let config = SyncConfigBuilder::new()
//!     .key("account")
//!     .window(500)
//!     .fast_forward_interval_ms(250)
//!     .build();
//! assert_eq!(config.window, 500);
//! ```

use crate::indexer::SyncConfig;

/// Fluent builder for `SyncConfig`.
#[derive(Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    /// Set the consumer key (names the head cursor).
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.config.key = key.into();
        self
    }

    /// Set the maximum number of blocks per poll cycle.
    pub fn window(mut self, window: u64) -> Self {
        self.config.window = window;
        self
    }

    /// Set the poll interval used while catching up, in milliseconds.
    pub fn fast_forward_interval_ms(mut self, ms: u64) -> Self {
        self.config.fast_forward_interval_ms = ms;
        self
    }

    /// Set the poll interval used once caught up, in milliseconds.
    pub fn steady_interval_ms(mut self, ms: u64) -> Self {
        self.config.steady_interval_ms = ms;
        self
    }

    /// Build the `SyncConfig`.
    pub fn build(self) -> SyncConfig {
        self.config
    }
}
