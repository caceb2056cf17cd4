//! Process-level configuration, loaded from a JSON file.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::IndexerError;
use crate::indexer::SyncConfig;

/// Top-level indexer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Database location (SQLite path or URL).
    pub database: String,
    pub log: LogConfig,
    /// One entry per consumer; keys must be unique.
    pub consumers: Vec<SyncConfig>,
    pub system_tokens: SystemTokens,
    /// Pre-allocated balances seeded by the ledger's genesis step.
    pub genesis: Vec<GenesisAllocation>,
}

impl IndexerConfig {
    /// Read and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IndexerError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| IndexerError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        let mut seen = HashSet::new();
        for consumer in &self.consumers {
            consumer.validate()?;
            if !seen.insert(consumer.key.as_str()) {
                return Err(IndexerError::Config(format!(
                    "duplicate consumer key '{}'",
                    consumer.key
                )));
            }
        }
        Ok(())
    }
}

/// Log level per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

/// Addresses of the two system-token contracts whose `Transfer` events move
/// native balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemTokens {
    pub mtr: String,
    pub mtrg: String,
}

impl Default for SystemTokens {
    fn default() -> Self {
        Self {
            mtr: "0x687a6294d0d6d63e751a059bf1ca68e4ae7b13e2".into(),
            mtrg: "0x228ebbee999c6a7ad74a6130e81b12f9fe237ba3".into(),
        }
    }
}

/// A balance allocated at genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub address: String,
    #[serde(default, with = "crate::amount::decimal_string")]
    pub mtr: U256,
    #[serde(default, with = "crate::amount::decimal_string")]
    pub mtrg: U256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_a_valid_config() {
        let cfg: IndexerConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.consumers.is_empty());
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.system_tokens, SystemTokens::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duplicate_consumer_keys_are_rejected() {
        let cfg: IndexerConfig = serde_json::from_str(
            r#"{"consumers":[{"key":"account"},{"key":"account","window":10}]}"#,
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(IndexerError::Config(_))));
    }

    #[test]
    fn genesis_allocations_parse_decimal_strings() {
        let cfg: IndexerConfig = serde_json::from_str(
            r#"{"genesis":[{"address":"0xabc","mtr":"1000000000000000000"},
                           {"address":"0xdef","mtrg":"200000000000000000000000000000000"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.genesis[0].mtr, U256::from(1_000_000_000_000_000_000u64));
        assert_eq!(cfg.genesis[0].mtrg, U256::ZERO);
        assert_eq!(
            cfg.genesis[1].mtrg,
            U256::from(2u8) * U256::from(10u8).pow(U256::from(32))
        );
    }
}
