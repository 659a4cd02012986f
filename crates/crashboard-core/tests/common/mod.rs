//! Shared setup for crashboard integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

pub mod fixtures;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};

use crashboard_core::{
    CrashAggregator, CrashboardConfig, MemoryIssueTracker, MemorySearchIndex, ShardSelector,
};
use crashboard_state::{MemoryCache, MemoryKv, MemoryQueue, StateProvider};

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Hands out shards in turn so concurrent writers never share one.
#[derive(Default)]
pub struct SequentialSelector {
    next: AtomicU32,
}

impl ShardSelector for SequentialSelector {
    fn select(&self, _name: &str, shards: u32) -> u32 {
        self.next.fetch_add(1, Ordering::SeqCst) % shards
    }
}

/// A fully wired in-memory crashboard.
pub struct TestBoard {
    pub board: CrashAggregator,
    pub kv: Arc<MemoryKv>,
    pub cache: Arc<MemoryCache>,
    pub queue: Arc<MemoryQueue>,
    pub index: Arc<MemorySearchIndex>,
    pub tracker: Arc<MemoryIssueTracker>,
}

impl TestBoard {
    pub fn new() -> Self {
        Self::with_config(CrashboardConfig::default())
    }

    /// Board with the issue tracker switched on and rechecks due immediately.
    pub fn with_notifier() -> Self {
        let mut config = CrashboardConfig::default();
        config.notifier.enabled = true;
        config.notifier.defer_delay_secs = 0;
        Self::with_config(config)
    }

    pub fn with_config(config: CrashboardConfig) -> Self {
        Self::build(config, None)
    }

    /// Board whose writes land on shards 0, 1, 2, ... in order.
    pub fn sequential(config: CrashboardConfig) -> Self {
        Self::build(config, Some(Arc::new(SequentialSelector::default())))
    }

    fn build(config: CrashboardConfig, selector: Option<Arc<dyn ShardSelector>>) -> Self {
        init_tracing();

        let kv = Arc::new(MemoryKv::new());
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(MemoryQueue::new());
        let index = Arc::new(MemorySearchIndex::new());
        let tracker = Arc::new(MemoryIssueTracker::new());

        let state = StateProvider::new()
            .with_kv(kv.clone())
            .with_cache(cache.clone())
            .with_queue(queue.clone());

        let mut builder = CrashAggregator::builder(config)
            .state(state)
            .search_index(index.clone())
            .issue_tracker(tracker.clone());
        if let Some(selector) = selector {
            builder = builder.selector(selector);
        }

        Self {
            board: builder.build().unwrap(),
            kv,
            cache,
            queue,
            index,
            tracker,
        }
    }
}

/// Config with `shards` counter shards per crash.
pub fn config_with_shards(shards: u32) -> CrashboardConfig {
    let mut config = CrashboardConfig::default();
    config.sharding.shards_per_crash = shards;
    config
}
