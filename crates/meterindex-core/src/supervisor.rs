//! Runs several sync engines side by side and stops them together.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;

use crate::engine::SyncEngine;
use crate::error::IndexerError;

/// Owns a set of engines with disjoint head keys.
#[derive(Default)]
pub struct Supervisor {
    engines: Vec<Arc<SyncEngine>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an engine. Two engines may not share a head key.
    pub fn add(&mut self, engine: SyncEngine) -> Result<(), IndexerError> {
        if self.engines.iter().any(|e| e.key() == engine.key()) {
            return Err(IndexerError::Config(format!(
                "an engine with key '{}' is already supervised",
                engine.key()
            )));
        }
        self.engines.push(Arc::new(engine));
        Ok(())
    }

    pub fn keys(&self) -> Vec<&str> {
        self.engines.iter().map(|e| e.key()).collect()
    }

    pub fn engine(&self, key: &str) -> Option<Arc<SyncEngine>> {
        self.engines.iter().find(|e| e.key() == key).cloned()
    }

    pub async fn start_all(&self) {
        for engine in &self.engines {
            engine.start().await;
        }
    }

    /// Stop every engine concurrently and wait for all loops to exit.
    /// Returns the first error, after every engine has been asked to stop.
    pub async fn stop_all(&self) -> Result<(), IndexerError> {
        let results = join_all(self.engines.iter().map(|e| e.stop())).await;
        let mut first = None;
        for (engine, result) in self.engines.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(key = %engine.key(), error = %e, "engine did not stop cleanly");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => {
                tracing::info!(engines = self.engines.len(), "all engines stopped");
                Ok(())
            }
        }
    }

    /// Start every engine, wait for `signal`, then stop them all.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), IndexerError>
    where
        F: Future<Output = ()>,
    {
        self.start_all().await;
        signal.await;
        tracing::info!("shutdown requested");
        self.stop_all().await
    }

    /// [`run_until`](Self::run_until) the process receives Ctrl-C.
    pub async fn run_until_ctrl_c(&self) -> Result<(), IndexerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SyncConfigBuilder;
    use crate::indexer::EngineState;
    use crate::processor::BlockProcessor;
    use crate::source::BlockSource;
    use crate::store::{HeadStore, MemoryHeadStore};
    use crate::types::BlockSummary;
    use async_trait::async_trait;
    use std::time::Duration;

    struct TwoBlocks;

    #[async_trait]
    impl BlockSource for TwoBlocks {
        async fn best(&self) -> Result<u64, IndexerError> {
            Ok(1)
        }

        async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
            Ok((number <= 1).then(|| BlockSummary {
                number,
                hash: format!("0x{number}"),
                parent_hash: if number == 0 { String::new() } else { "0x0".into() },
                timestamp: 0,
                epoch: 0,
                tx_hashes: vec![],
            }))
        }
    }

    struct Named(&'static str);

    #[async_trait]
    impl BlockProcessor for Named {
        fn key(&self) -> &str {
            self.0
        }

        async fn process_block(&self, _block: &BlockSummary) -> Result<(), IndexerError> {
            Ok(())
        }

        async fn rewind(&self, _from: u64, _to: u64) -> Result<(), IndexerError> {
            Ok(())
        }
    }

    fn engine(key: &'static str, heads: Arc<MemoryHeadStore>) -> SyncEngine {
        let config = SyncConfigBuilder::new()
            .key(key)
            .fast_forward_interval_ms(2)
            .steady_interval_ms(2)
            .build();
        SyncEngine::new(config, Arc::new(TwoBlocks), heads, Arc::new(Named(key))).unwrap()
    }

    #[tokio::test]
    async fn duplicate_keys_are_rejected() {
        let heads = Arc::new(MemoryHeadStore::new());
        let mut sup = Supervisor::new();
        sup.add(engine("account", heads.clone())).unwrap();
        assert!(sup.add(engine("account", heads)).is_err());
        assert_eq!(sup.keys(), vec!["account"]);
    }

    #[tokio::test]
    async fn run_until_drives_every_engine_to_the_tip() {
        let heads = Arc::new(MemoryHeadStore::new());
        let mut sup = Supervisor::new();
        sup.add(engine("account", heads.clone())).unwrap();
        sup.add(engine("scriptengine", heads.clone())).unwrap();

        sup.run_until(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        for key in ["account", "scriptengine"] {
            assert_eq!(heads.load(key).await.unwrap().unwrap().num, 1);
            assert_eq!(sup.engine(key).unwrap().state(), EngineState::Stopped);
        }
    }
}
