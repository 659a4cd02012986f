use serde::Deserialize;

/// Backend selection for the durable store, the cache and the job queue.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StateConfig {
    #[serde(default)]
    pub kv: Option<KvConfig>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub queue: Option<QueueConfig>,
}

impl StateConfig {
    /// Every backend in process memory.
    pub fn in_memory() -> Self {
        Self {
            kv: Some(KvConfig::Memory),
            cache: Some(CacheConfig::Memory),
            queue: Some(QueueConfig::Memory),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum KvConfig {
    #[default]
    Memory,
    #[cfg(feature = "valkey")]
    Valkey {
        url: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CacheConfig {
    #[default]
    Memory,
    #[cfg(feature = "valkey")]
    Valkey {
        url: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum QueueConfig {
    #[default]
    Memory,
}

#[cfg(feature = "valkey")]
fn default_pool_size() -> usize {
    10
}
