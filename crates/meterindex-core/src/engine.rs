//! The sync engine: one named head, one processor, one polling task.
//!
//! # Poll cycle
//! 1. Sleep for the mode's interval (raced against shutdown).
//! 2. Load the head; with no head, run genesis and persist head = (0, hash).
//! 3. Read the source's best block and compute the window
//!    `[head + 1, min(head + window, best)]`.
//! 4. For each block in the window: check shutdown, fetch the block, verify
//!    it extends the head, process it, then advance and persist the head.
//!
//! The head only moves after `process_block` returns `Ok`, so a crash at any
//! point re-runs at most the block that was in flight.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::cursor::Head;
use crate::error::IndexerError;
use crate::indexer::{EngineState, SyncConfig};
use crate::processor::BlockProcessor;
use crate::source::BlockSource;
use crate::store::HeadStore;

/// Drives one [`BlockProcessor`] through the chain, owning its head.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct EngineInner {
    config: SyncConfig,
    source: Arc<dyn BlockSource>,
    heads: Arc<dyn HeadStore>,
    processor: Arc<dyn BlockProcessor>,
    shutdown: watch::Sender<bool>,
    state: watch::Sender<EngineState>,
}

impl SyncEngine {
    /// Build an engine. `config.key` must name the processor's head.
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn BlockSource>,
        heads: Arc<dyn HeadStore>,
        processor: Arc<dyn BlockProcessor>,
    ) -> Result<Self, IndexerError> {
        config.validate()?;
        if config.key != processor.key() {
            return Err(IndexerError::Config(format!(
                "engine key '{}' does not match processor key '{}'",
                config.key,
                processor.key()
            )));
        }
        let (shutdown, _) = watch::channel(false);
        let (state, _) = watch::channel(EngineState::Uninitialized);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                source,
                heads,
                processor,
                shutdown,
                state,
            }),
            task: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &str {
        &self.inner.config.key
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Spawn the poll loop. Calling `start` on a running engine does nothing.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!(key = %self.inner.config.key, "engine already running");
            return;
        }
        self.inner.shutdown.send_replace(false);
        let shutdown = self.inner.shutdown.subscribe();
        let inner = Arc::clone(&self.inner);
        tracing::info!(key = %inner.config.key, window = inner.config.window, "starting sync engine");
        *task = Some(tokio::spawn(inner.run(shutdown)));
    }

    /// Request shutdown and wait until the loop has exited. The block in
    /// flight, if any, is finished first.
    pub async fn stop(&self) -> Result<(), IndexerError> {
        self.inner.shutdown.send_replace(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| IndexerError::Other(format!("sync task for '{}' failed: {e}", self.key())))?;
        }
        self.inner.state.send_replace(EngineState::Stopped);
        Ok(())
    }

    /// Run a single poll cycle without sleeping. Returns `true` when the
    /// window was clipped by `window` (fast-forward mode).
    pub async fn sync_once(&self) -> Result<bool, IndexerError> {
        self.inner.cycle().await
    }

    /// Undo everything the processor derived above block `to` and move the
    /// head back to `to`. The engine must not be running.
    pub async fn rollback(&self, to: u64) -> Result<Head, IndexerError> {
        let task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(IndexerError::Config(format!(
                "stop '{}' before rolling it back",
                self.key()
            )));
        }
        self.inner.rollback(to).await
    }
}

impl EngineInner {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let key = self.config.key.clone();
        let mut fast_forward = false;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval(fast_forward)) => {}
                _ = shutdown.changed() => {}
            }

            match self.cycle().await {
                Ok(ff) => fast_forward = ff,
                Err(IndexerError::Interrupted) => {
                    tracing::info!(key = %key, "closed");
                    break;
                }
                Err(e) if e.is_integrity() => {
                    tracing::error!(key = %key, error = %e, "integrity violation, head not advanced");
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "sync cycle failed, retrying");
                }
            }
        }
        self.state.send_replace(EngineState::Stopped);
    }

    fn check_shutdown(&self) -> Result<(), IndexerError> {
        if *self.shutdown.borrow() {
            return Err(IndexerError::Interrupted);
        }
        Ok(())
    }

    async fn cycle(&self) -> Result<bool, IndexerError> {
        self.check_shutdown()?;

        let mut head = match self.heads.load(&self.config.key).await? {
            Some(head) if !head.needs_genesis() => head,
            _ => self.genesis().await?,
        };

        let best = self.source.best().await?;
        if best <= head.num {
            self.state.send_replace(EngineState::Steady);
            return Ok(false);
        }

        let clip = head.num.saturating_add(self.config.window);
        let fast_forward = clip < best;
        let to = clip.min(best);
        self.state.send_replace(if fast_forward {
            EngineState::CatchingUp
        } else {
            EngineState::Steady
        });
        tracing::debug!(
            key = %self.config.key,
            from = head.next_block(),
            to,
            best,
            fast_forward,
            "sync window"
        );

        for number in head.next_block()..=to {
            self.check_shutdown()?;

            let Some(block) = self.source.block(number).await? else {
                tracing::debug!(key = %self.config.key, number, "block not yet available");
                break;
            };

            if !block.extends(head.num, &head.hash) {
                return Err(IndexerError::ReorgDetected {
                    block_number: block.number,
                    expected: head.hash.clone(),
                    actual: block.parent_hash.clone(),
                });
            }

            self.processor.process_block(&block).await?;
            head.advance(&block)?;
            self.heads.save(&head).await?;
            tracing::debug!(
                key = %self.config.key,
                block = block.number,
                txs = block.tx_hashes.len(),
                "block applied"
            );
        }

        Ok(fast_forward)
    }

    async fn rollback(&self, to: u64) -> Result<Head, IndexerError> {
        let key = &self.config.key;
        let current = self
            .heads
            .load(key)
            .await?
            .ok_or_else(|| IndexerError::Config(format!("no head recorded for '{key}'")))?;
        if to > current.num {
            return Err(IndexerError::Config(format!(
                "'{key}' is at block {}, cannot roll forward to {to}",
                current.num
            )));
        }

        // The block after the head may have been partly applied before a crash.
        self.processor.rewind(current.next_block(), to).await?;

        let hash = self.source.block(to).await?.map(|b| b.hash).unwrap_or_default();
        let head = Head::new(key.clone(), to, hash);
        self.heads.rollback(&head).await?;
        tracing::warn!(key = %key, from = current.num, to, "head rolled back");
        Ok(head)
    }

    async fn genesis(&self) -> Result<Head, IndexerError> {
        let genesis = self
            .source
            .block(0)
            .await?
            .ok_or_else(|| IndexerError::Source("genesis block not available".into()))?;

        self.processor.process_genesis(&genesis).await?;

        let head = Head::new(self.config.key.clone(), 0, genesis.hash.clone());
        self.heads.save(&head).await?;
        self.state.send_replace(EngineState::GenesisProcessed);
        tracing::info!(key = %self.config.key, hash = %genesis.hash, "genesis processed");
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SyncConfigBuilder;
    use crate::store::MemoryHeadStore;
    use crate::types::BlockSummary;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn hash(n: u64) -> String {
        format!("0x{n:04x}")
    }

    fn chain(len: u64) -> Vec<BlockSummary> {
        (0..len)
            .map(|n| BlockSummary {
                number: n,
                hash: hash(n),
                parent_hash: if n == 0 { String::new() } else { hash(n - 1) },
                timestamp: n as i64 * 10,
                epoch: n / 100,
                tx_hashes: vec![],
            })
            .collect()
    }

    struct MockSource {
        blocks: StdMutex<Vec<BlockSummary>>,
        best: AtomicU64,
    }

    impl MockSource {
        fn new(blocks: Vec<BlockSummary>) -> Self {
            let best = blocks.len().saturating_sub(1) as u64;
            Self {
                blocks: StdMutex::new(blocks),
                best: AtomicU64::new(best),
            }
        }
    }

    #[async_trait]
    impl BlockSource for MockSource {
        async fn best(&self) -> Result<u64, IndexerError> {
            Ok(self.best.load(Ordering::SeqCst))
        }

        async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
            Ok(self.blocks.lock().unwrap().get(number as usize).cloned())
        }
    }

    #[derive(Default)]
    struct Recorder {
        genesis: StdMutex<Vec<u64>>,
        seen: StdMutex<Vec<u64>>,
        rewound: StdMutex<Vec<(u64, u64)>>,
        fail_at: Option<u64>,
    }

    #[async_trait]
    impl BlockProcessor for Recorder {
        fn key(&self) -> &str {
            "account"
        }

        async fn process_genesis(&self, genesis: &BlockSummary) -> Result<(), IndexerError> {
            self.genesis.lock().unwrap().push(genesis.number);
            Ok(())
        }

        async fn process_block(&self, block: &BlockSummary) -> Result<(), IndexerError> {
            if self.fail_at == Some(block.number) {
                return Err(IndexerError::Storage("write failed".into()));
            }
            self.seen.lock().unwrap().push(block.number);
            Ok(())
        }

        async fn rewind(&self, from: u64, to: u64) -> Result<(), IndexerError> {
            self.rewound.lock().unwrap().push((from, to));
            Ok(())
        }
    }

    fn config(window: u64) -> SyncConfig {
        SyncConfigBuilder::new()
            .key("account")
            .window(window)
            .fast_forward_interval_ms(5)
            .steady_interval_ms(10)
            .build()
    }

    fn engine(
        window: u64,
        source: Arc<MockSource>,
        heads: Arc<MemoryHeadStore>,
        processor: Arc<Recorder>,
    ) -> SyncEngine {
        SyncEngine::new(config(window), source, heads, processor).unwrap()
    }

    #[tokio::test]
    async fn genesis_then_full_window() {
        let source = Arc::new(MockSource::new(chain(6)));
        let heads = Arc::new(MemoryHeadStore::new());
        let recorder = Arc::new(Recorder::default());
        let engine = engine(100, source, heads.clone(), recorder.clone());

        assert_eq!(engine.state(), EngineState::Uninitialized);
        let fast_forward = engine.sync_once().await.unwrap();

        assert!(!fast_forward);
        assert_eq!(engine.state(), EngineState::Steady);
        assert_eq!(*recorder.genesis.lock().unwrap(), vec![0]);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        let head = heads.load("account").await.unwrap().unwrap();
        assert_eq!(head.num, 5);
        assert_eq!(head.hash, hash(5));
    }

    #[tokio::test]
    async fn window_clipping_selects_fast_forward() {
        let source = Arc::new(MockSource::new(chain(8)));
        let heads = Arc::new(MemoryHeadStore::new());
        let recorder = Arc::new(Recorder::default());
        let engine = engine(3, source, heads.clone(), recorder.clone());

        assert!(engine.sync_once().await.unwrap());
        assert_eq!(engine.state(), EngineState::CatchingUp);
        assert_eq!(heads.load("account").await.unwrap().unwrap().num, 3);

        assert!(engine.sync_once().await.unwrap());
        assert_eq!(heads.load("account").await.unwrap().unwrap().num, 6);

        // 6 + 3 > 7: clipped by best, not by the window.
        assert!(!engine.sync_once().await.unwrap());
        assert_eq!(heads.load("account").await.unwrap().unwrap().num, 7);
        assert_eq!(recorder.genesis.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_block_does_not_advance_head() {
        let source = Arc::new(MockSource::new(chain(6)));
        let heads = Arc::new(MemoryHeadStore::new());
        let recorder = Arc::new(Recorder {
            fail_at: Some(3),
            ..Default::default()
        });
        let engine = engine(100, source, heads.clone(), recorder.clone());

        let err = engine.sync_once().await.unwrap_err();
        assert!(matches!(err, IndexerError::Storage(_)));
        assert_eq!(heads.load("account").await.unwrap().unwrap().num, 2);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn missing_block_ends_window_early() {
        let source = Arc::new(MockSource::new(chain(4)));
        source.best.store(9, Ordering::SeqCst);
        let heads = Arc::new(MemoryHeadStore::new());
        let engine = engine(100, source, heads.clone(), Arc::new(Recorder::default()));

        assert!(engine.sync_once().await.is_ok());
        assert_eq!(heads.load("account").await.unwrap().unwrap().num, 3);
    }

    #[tokio::test]
    async fn broken_parent_link_is_a_reorg() {
        let mut blocks = chain(5);
        blocks[3].parent_hash = "0xdead".into();
        let source = Arc::new(MockSource::new(blocks));
        let heads = Arc::new(MemoryHeadStore::new());
        let engine = engine(100, source, heads.clone(), Arc::new(Recorder::default()));

        let err = engine.sync_once().await.unwrap_err();
        match err {
            IndexerError::ReorgDetected {
                block_number,
                expected,
                actual,
            } => {
                assert_eq!(block_number, 3);
                assert_eq!(expected, hash(2));
                assert_eq!(actual, "0xdead");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(heads.load("account").await.unwrap().unwrap().num, 2);
    }

    #[tokio::test]
    async fn out_of_sequence_block_is_rejected() {
        let mut blocks = chain(5);
        blocks[3].number = 7;
        let source = Arc::new(MockSource::new(blocks));
        let heads = Arc::new(MemoryHeadStore::new());
        let recorder = Arc::new(Recorder::default());
        let engine = engine(100, source, heads.clone(), recorder.clone());

        let err = engine.sync_once().await.unwrap_err();
        assert!(matches!(err, IndexerError::ReorgDetected { block_number: 7, .. }));
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(heads.load("account").await.unwrap().unwrap().num, 2);
    }

    #[tokio::test]
    async fn rollback_rewinds_past_the_head_and_replays() {
        let source = Arc::new(MockSource::new(chain(6)));
        let heads = Arc::new(MemoryHeadStore::new());
        let recorder = Arc::new(Recorder::default());
        let engine = engine(100, source, heads.clone(), recorder.clone());
        engine.sync_once().await.unwrap();

        let head = engine.rollback(3).await.unwrap();
        assert_eq!(head, Head::new("account", 3, hash(3)));
        assert_eq!(*recorder.rewound.lock().unwrap(), vec![(6, 3)]);
        assert_eq!(heads.load("account").await.unwrap().unwrap(), head);

        engine.sync_once().await.unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 2, 3, 4, 5, 4, 5]);
    }

    #[tokio::test]
    async fn rollback_cannot_move_forward() {
        let source = Arc::new(MockSource::new(chain(3)));
        let heads = Arc::new(MemoryHeadStore::new());
        let recorder = Arc::new(Recorder::default());
        let engine = engine(100, source, heads.clone(), recorder.clone());
        engine.sync_once().await.unwrap();

        assert!(matches!(engine.rollback(9).await, Err(IndexerError::Config(_))));
        assert!(recorder.rewound.lock().unwrap().is_empty());
        assert_eq!(heads.load("account").await.unwrap().unwrap().num, 2);
    }

    #[tokio::test]
    async fn resumes_from_persisted_head() {
        let source = Arc::new(MockSource::new(chain(6)));
        let heads = Arc::new(MemoryHeadStore::new());
        heads.save(&Head::new("account", 4, hash(4))).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let engine = engine(100, source, heads, recorder.clone());

        engine.sync_once().await.unwrap();
        assert!(recorder.genesis.lock().unwrap().is_empty());
        assert_eq!(*recorder.seen.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn mismatched_keys_are_rejected() {
        let source = Arc::new(MockSource::new(chain(1)));
        let cfg = SyncConfigBuilder::new().key("scriptengine").build();
        let result = SyncEngine::new(
            cfg,
            source,
            Arc::new(MemoryHeadStore::new()),
            Arc::new(Recorder::default()),
        );
        assert!(matches!(result, Err(IndexerError::Config(_))));
    }

    #[tokio::test]
    async fn start_follows_the_chain_and_stop_exits() {
        let source = Arc::new(MockSource::new(chain(4)));
        let heads = Arc::new(MemoryHeadStore::new());
        let engine = engine(100, source.clone(), heads.clone(), Arc::new(Recorder::default()));

        engine.start().await;
        engine.start().await;

        {
            let mut blocks = source.blocks.lock().unwrap();
            *blocks = chain(10);
        }
        source.best.store(9, Ordering::SeqCst);

        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(head) = heads.load("account").await.unwrap() {
                    if head.num == 9 {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "engine never reached block 9");

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.sync_once().await.unwrap_err().is_interrupt());
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let source = Arc::new(MockSource::new(chain(2)));
        let engine = engine(10, source, Arc::new(MemoryHeadStore::new()), Arc::new(Recorder::default()));
        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
