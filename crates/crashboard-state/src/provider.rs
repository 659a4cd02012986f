use std::sync::Arc;

use crate::config::{CacheConfig, KvConfig, QueueConfig, StateConfig};
use crate::error::StateError;
use crate::traits::{CacheBackend, KvBackend, QueueBackend};

#[cfg(feature = "memory")]
use crate::memory::{MemoryCache, MemoryKv, MemoryQueue};

#[cfg(feature = "valkey")]
use crate::valkey::{ValkeyCache, ValkeyKv};

#[derive(Clone, Default)]
pub struct StateProvider {
    kv: Option<Arc<dyn KvBackend>>,
    cache: Option<Arc<dyn CacheBackend>>,
    queue: Option<Arc<dyn QueueBackend>>,
}

impl StateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_config(config: &StateConfig) -> Result<Self, StateError> {
        let kv = match &config.kv {
            Some(c) => Some(Self::create_kv_backend(c).await?),
            None => None,
        };

        let cache = match &config.cache {
            Some(c) => Some(Self::create_cache_backend(c).await?),
            None => None,
        };

        let queue = match &config.queue {
            Some(c) => Some(Self::create_queue_backend(c)?),
            None => None,
        };

        Ok(Self { kv, cache, queue })
    }

    pub fn with_kv(mut self, kv: Arc<dyn KvBackend>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueBackend>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn kv(&self) -> Result<Arc<dyn KvBackend>, StateError> {
        self.kv
            .clone()
            .ok_or(StateError::NotConfigured("kv".to_string()))
    }

    pub fn cache(&self) -> Result<Arc<dyn CacheBackend>, StateError> {
        self.cache
            .clone()
            .ok_or(StateError::NotConfigured("cache".to_string()))
    }

    pub fn queue(&self) -> Result<Arc<dyn QueueBackend>, StateError> {
        self.queue
            .clone()
            .ok_or(StateError::NotConfigured("queue".to_string()))
    }

    async fn create_kv_backend(config: &KvConfig) -> Result<Arc<dyn KvBackend>, StateError> {
        match config {
            #[cfg(feature = "memory")]
            KvConfig::Memory => Ok(Arc::new(MemoryKv::new())),

            #[cfg(feature = "valkey")]
            KvConfig::Valkey {
                url,
                namespace,
                pool_size,
            } => {
                let kv = ValkeyKv::new(url, namespace.clone(), *pool_size)
                    .await
                    .map_err(|e| StateError::Connection(e.to_string()))?;
                Ok(Arc::new(kv))
            }

            #[allow(unreachable_patterns)]
            _ => Err(StateError::UnsupportedBackend(
                "No suitable KV backend enabled".to_string(),
            )),
        }
    }

    async fn create_cache_backend(
        config: &CacheConfig,
    ) -> Result<Arc<dyn CacheBackend>, StateError> {
        match config {
            #[cfg(feature = "memory")]
            CacheConfig::Memory => Ok(Arc::new(MemoryCache::new())),

            #[cfg(feature = "valkey")]
            CacheConfig::Valkey {
                url,
                namespace,
                pool_size,
            } => {
                let cache = ValkeyCache::new(url, namespace.clone(), *pool_size)
                    .await
                    .map_err(|e| StateError::Connection(e.to_string()))?;
                Ok(Arc::new(cache))
            }

            #[allow(unreachable_patterns)]
            _ => Err(StateError::UnsupportedBackend(
                "No suitable cache backend enabled".to_string(),
            )),
        }
    }

    fn create_queue_backend(config: &QueueConfig) -> Result<Arc<dyn QueueBackend>, StateError> {
        match config {
            #[cfg(feature = "memory")]
            QueueConfig::Memory => Ok(Arc::new(MemoryQueue::new())),

            #[allow(unreachable_patterns)]
            _ => Err(StateError::UnsupportedBackend(
                "No suitable queue backend enabled".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for StateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProvider")
            .field("kv", &self.kv.is_some())
            .field("cache", &self.cache.is_some())
            .field("queue", &self.queue.is_some())
            .finish()
    }
}
