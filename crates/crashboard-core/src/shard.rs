//! Shard routing for crash counters.
//!
//! Every logical crash is spread over a fixed number of counter records so
//! concurrent writers rarely touch the same one.

use std::sync::Arc;
use std::time::Duration;

use crashboard_state::{CacheBackend, KvBackend};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{shard_config_cache_key, shard_config_key, ShardConfig};

/// Picks the shard a write lands on.
pub trait ShardSelector: Send + Sync {
    /// Returns an index in `[0, shards)`.
    fn select(&self, name: &str, shards: u32) -> u32;
}

/// Uniformly random shard choice.
pub struct UniformShardSelector {
    rng: Mutex<SmallRng>,
}

impl UniformShardSelector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Reproducible selector for tests.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }
}

impl Default for UniformShardSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardSelector for UniformShardSelector {
    fn select(&self, _name: &str, shards: u32) -> u32 {
        if shards <= 1 {
            return 0;
        }
        self.rng.lock().gen_range(0..shards)
    }
}

pub struct ShardRouter {
    kv: Arc<dyn KvBackend>,
    cache: Arc<dyn CacheBackend>,
    selector: Arc<dyn ShardSelector>,
    default_shards: u32,
    config_ttl: Duration,
}

impl ShardRouter {
    pub fn new(
        kv: Arc<dyn KvBackend>,
        cache: Arc<dyn CacheBackend>,
        selector: Arc<dyn ShardSelector>,
        default_shards: u32,
        config_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            cache,
            selector,
            default_shards: default_shards.max(1),
            config_ttl,
        }
    }

    /// Shard configuration for `name`, created with the default shard count
    /// on first use. The stored count never changes afterwards.
    #[tracing::instrument(skip(self))]
    pub async fn config(&self, name: &str) -> Result<ShardConfig> {
        let cache_key = shard_config_cache_key(name);

        match self.cache.get(&cache_key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<ShardConfig>(&bytes) {
                Ok(config) => return Ok(config),
                Err(e) => warn!(error = %e, "discarding malformed cached shard config"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "shard config cache lookup failed"),
        }

        let initial = serde_json::to_vec(&ShardConfig {
            name: name.to_string(),
            shards: self.default_shards,
        })?;
        let stored = self.kv.get_or_insert(&shard_config_key(name), &initial).await?;
        let config: ShardConfig = serde_json::from_slice(&stored)?;
        debug!(shards = config.shards, "loaded shard config");

        if let Err(e) = self
            .cache
            .set(&cache_key, &stored, Some(self.config_ttl))
            .await
        {
            warn!(error = %e, "failed to cache shard config");
        }

        Ok(config)
    }

    /// Shard index for the next write to `name`.
    pub async fn shard_for(&self, name: &str) -> Result<u32> {
        let config = self.config(name).await?;
        let shards = config.shards.max(1);
        Ok(self.selector.select(name, shards).min(shards - 1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crashboard_state::{MemoryCache, MemoryKv};
    use std::collections::HashSet;

    fn router(kv: Arc<MemoryKv>, cache: Arc<MemoryCache>, shards: u32) -> ShardRouter {
        ShardRouter::new(
            kv,
            cache,
            Arc::new(UniformShardSelector::seeded(7)),
            shards,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn uniform_selector_stays_in_range() {
        let selector = UniformShardSelector::seeded(1);
        let picks: HashSet<u32> = (0..1_000).map(|_| selector.select("n", 20)).collect();
        assert!(picks.iter().all(|&s| s < 20));
        // 1000 draws over 20 buckets should reach nearly all of them.
        assert!(picks.len() > 15);
        assert_eq!(selector.select("n", 1), 0);
        assert_eq!(selector.select("n", 0), 0);
    }

    #[tokio::test]
    async fn config_created_once_and_cached() {
        let kv = Arc::new(MemoryKv::new());
        let cache = Arc::new(MemoryCache::new());
        let router = router(kv.clone(), cache.clone(), 20);

        let config = router.config("crash-1").await.unwrap();
        assert_eq!(config.shards, 20);
        assert!(kv
            .get(&shard_config_key("crash-1"))
            .await
            .unwrap()
            .is_some());
        assert!(cache
            .get(&shard_config_cache_key("crash-1"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn shard_count_never_changes() {
        let kv = Arc::new(MemoryKv::new());
        let cache = Arc::new(MemoryCache::new());
        router(kv.clone(), cache.clone(), 20)
            .config("crash-1")
            .await
            .unwrap();
        cache.flush().await;

        // A router with a different default keeps the stored count.
        let other = router(kv, cache, 3);
        assert_eq!(other.config("crash-1").await.unwrap().shards, 20);
        assert_eq!(other.config("crash-2").await.unwrap().shards, 3);
    }

    #[tokio::test]
    async fn shard_for_is_within_config() {
        let router = router(Arc::new(MemoryKv::new()), Arc::new(MemoryCache::new()), 4);
        for _ in 0..50 {
            assert!(router.shard_for("crash-9").await.unwrap() < 4);
        }
    }
}
