//! Crashboard configuration.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working in-memory setup.

use std::time::Duration;

use crashboard_state::StateConfig;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{CrashboardError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct CrashboardConfig {
    #[serde(default)]
    pub fingerprint: FingerprintSettings,

    #[serde(default)]
    pub sharding: ShardingSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub trending: TrendingSettings,

    #[serde(default)]
    pub notifier: NotifierSettings,

    /// Storage backends.
    #[serde(default = "default_state")]
    pub state: StateConfig,
}

impl CrashboardConfig {
    /// Load configuration from file and environment.
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. `crashboard.toml` in the current directory (if present)
    /// 3. The given config file (if provided)
    /// 4. Environment variables with the `CRASHBOARD_` prefix, nested with `__`
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("crashboard.toml"));

        if let Some(p) = path {
            figment = figment.merge(Toml::file(p));
        }

        let config: Self = figment
            .merge(Env::prefixed("CRASHBOARD_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = Figment::new().merge(Toml::string(content)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fingerprint.token_limit == 0 {
            return Err(CrashboardError::Config(
                "fingerprint.token_limit must be positive".to_string(),
            ));
        }
        if self.sharding.shards_per_crash == 0 {
            return Err(CrashboardError::Config(
                "sharding.shards_per_crash must be positive".to_string(),
            ));
        }
        if self.trending.scan_batch_size == 0 {
            return Err(CrashboardError::Config(
                "trending.scan_batch_size must be positive".to_string(),
            ));
        }
        if self.notifier.notify_frequency == 0 {
            return Err(CrashboardError::Config(
                "notifier.notify_frequency must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CrashboardConfig {
    fn default() -> Self {
        Self {
            fingerprint: FingerprintSettings::default(),
            sharding: ShardingSettings::default(),
            cache: CacheSettings::default(),
            trending: TrendingSettings::default(),
            notifier: NotifierSettings::default(),
            state: default_state(),
        }
    }
}

fn default_state() -> StateConfig {
    StateConfig::in_memory()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintSettings {
    /// Maximum number of distinct tokens folded into a fingerprint.
    #[serde(default = "default_token_limit")]
    pub token_limit: usize,
}

impl Default for FingerprintSettings {
    fn default() -> Self {
        Self {
            token_limit: default_token_limit(),
        }
    }
}

const fn default_token_limit() -> usize {
    512
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardingSettings {
    /// Shards allocated to a crash when it is first seen.
    #[serde(default = "default_shards_per_crash")]
    pub shards_per_crash: u32,

    #[serde(default = "default_config_ttl_secs")]
    pub config_ttl_secs: u64,
}

impl ShardingSettings {
    pub fn config_ttl(&self) -> Duration {
        Duration::from_secs(self.config_ttl_secs)
    }
}

impl Default for ShardingSettings {
    fn default() -> Self {
        Self {
            shards_per_crash: default_shards_per_crash(),
            config_ttl_secs: default_config_ttl_secs(),
        }
    }
}

const fn default_shards_per_crash() -> u32 {
    20
}

const fn default_config_ttl_secs() -> u64 {
    86_400
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Lifetime of a cached total count.
    #[serde(default = "default_count_ttl_secs")]
    pub count_ttl_secs: u64,

    /// Lifetime of a cached most-recent field value.
    #[serde(default = "default_field_ttl_secs")]
    pub field_ttl_secs: u64,
}

impl CacheSettings {
    pub fn count_ttl(&self) -> Duration {
        Duration::from_secs(self.count_ttl_secs)
    }

    pub fn field_ttl(&self) -> Duration {
        Duration::from_secs(self.field_ttl_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            count_ttl_secs: default_count_ttl_secs(),
            field_ttl_secs: default_field_ttl_secs(),
        }
    }
}

const fn default_count_ttl_secs() -> u64 {
    600
}

const fn default_field_ttl_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrendingSettings {
    #[serde(default = "default_trending_limit")]
    pub default_limit: usize,

    /// Shard records fetched per store round trip.
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,

    /// Skip resolved crashes.
    #[serde(default = "default_true")]
    pub unresolved_only: bool,
}

impl Default for TrendingSettings {
    fn default() -> Self {
        Self {
            default_limit: default_trending_limit(),
            scan_batch_size: default_scan_batch_size(),
            unresolved_only: true,
        }
    }
}

const fn default_trending_limit() -> usize {
    20
}

const fn default_scan_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierSettings {
    /// Open issues in the tracker for new crashes.
    #[serde(default)]
    pub enabled: bool,

    /// Post a recurrence comment every this many occurrences.
    #[serde(default = "default_notify_frequency")]
    pub notify_frequency: i64,

    #[serde(default = "default_defer_delay_secs")]
    pub defer_delay_secs: u64,

    #[serde(default = "default_max_rechecks")]
    pub max_rechecks: u32,

    #[serde(default = "default_queue")]
    pub queue: String,

    /// Base URL used when linking back to a crash.
    #[serde(default = "default_reporter_host")]
    pub reporter_host: String,
}

impl NotifierSettings {
    pub fn defer_delay(&self) -> Duration {
        Duration::from_secs(self.defer_delay_secs)
    }
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            notify_frequency: default_notify_frequency(),
            defer_delay_secs: default_defer_delay_secs(),
            max_rechecks: default_max_rechecks(),
            queue: default_queue(),
            reporter_host: default_reporter_host(),
        }
    }
}

const fn default_notify_frequency() -> i64 {
    1
}

const fn default_defer_delay_secs() -> u64 {
    10
}

const fn default_max_rechecks() -> u32 {
    5
}

fn default_queue() -> String {
    "issues".to_string()
}

fn default_reporter_host() -> String {
    "http://localhost:8080".to_string()
}

const fn default_true() -> bool {
    true
}
