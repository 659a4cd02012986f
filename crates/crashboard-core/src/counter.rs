//! Sharded occurrence counters with a cache-aside read path.
//!
//! Shard records in the durable store are authoritative. Totals and
//! most-recent attribute values are cached per crash and rebuilt by scanning
//! the shard records whenever the cache misses.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crashboard_state::{CacheBackend, KvBackend};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::model::{
    count_cache_key, logical_name, recent_cache_key, record_key, records_prefix, CrashShardRecord,
    CrashState, FieldValue, RecentField,
};
use crate::shard::ShardRouter;

const RECORD_SCAN_BATCH: usize = 64;

/// A single report occurrence to be counted.
#[derive(Debug, Clone)]
pub struct Occurrence {
    pub fingerprint: Fingerprint,
    pub text: String,
    pub labels: Vec<String>,
    pub argv: Vec<String>,
    /// Issue carried into a newly created shard record.
    pub issue: Option<String>,
}

impl Occurrence {
    pub fn new(fingerprint: Fingerprint, text: impl Into<String>) -> Self {
        Self {
            fingerprint,
            text: text.into(),
            labels: Vec::new(),
            argv: Vec::new(),
            issue: None,
        }
    }

    fn template(&self, name: String, shard: u32) -> CrashShardRecord {
        CrashShardRecord {
            name,
            shard,
            text: self.text.clone(),
            fingerprint: self.fingerprint,
            labels: self.labels.clone(),
            timestamp: Utc::now(),
            count: 0,
            state: CrashState::Unresolved,
            issue: self.issue.clone(),
            argv: self.argv.clone(),
        }
    }
}

pub struct CounterStore {
    kv: Arc<dyn KvBackend>,
    cache: Arc<dyn CacheBackend>,
    router: ShardRouter,
    count_ttl: Duration,
    field_ttl: Duration,
}

impl CounterStore {
    pub fn new(
        kv: Arc<dyn KvBackend>,
        cache: Arc<dyn CacheBackend>,
        router: ShardRouter,
        count_ttl: Duration,
        field_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            cache,
            router,
            count_ttl,
            field_ttl,
        }
    }

    /// Adds (or removes) `delta` occurrences on a randomly chosen shard.
    ///
    /// The shard record is created on first use. A cached total is adjusted in
    /// place when present; a failed adjustment leaves it stale until it expires.
    #[tracing::instrument(skip(self, occurrence), fields(fingerprint = %occurrence.fingerprint))]
    pub async fn apply(
        &self,
        occurrence: &Occurrence,
        delta: i64,
        is_add: bool,
    ) -> Result<CrashShardRecord> {
        let name = logical_name(occurrence.fingerprint);
        let shard = self.router.shard_for(&name).await?;
        let key = record_key(&name, shard);

        let initial = serde_json::to_vec(&occurrence.template(name.clone(), shard))?;
        let stored = self.kv.get_or_insert(&key, &initial).await?;
        if stored == initial {
            info!(%name, shard, "created shard record");
        }

        let mut record: CrashShardRecord = serde_json::from_slice(&stored)?;
        if is_add {
            record.count += delta;
        } else {
            record.count -= delta;
        }
        self.kv.put(&key, &serde_json::to_vec(&record)?).await?;

        let count_key = count_cache_key(&name);
        let adjusted = if is_add {
            self.cache.incr(&count_key, delta).await
        } else {
            self.cache.decr(&count_key, delta).await
        };
        match adjusted {
            Ok(Some(total)) => debug!(total, "adjusted cached total"),
            Ok(None) => debug!("no cached total to adjust"),
            Err(e) => warn!(error = %e, "failed to adjust cached total"),
        }

        self.invalidate_fields(&name).await;
        Ok(record)
    }

    /// Every shard record of `name`, in shard order.
    pub async fn shard_records(&self, name: &str) -> Result<Vec<CrashShardRecord>> {
        let prefix = records_prefix(name);
        let mut records = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let batch = self
                .kv
                .scan(&prefix, after.as_deref(), RECORD_SCAN_BATCH)
                .await?;
            let exhausted = batch.len() < RECORD_SCAN_BATCH;

            for (key, bytes) in batch {
                match serde_json::from_slice::<CrashShardRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(%key, error = %e, "skipping unreadable shard record"),
                }
                after = Some(key);
            }

            if exhausted {
                break;
            }
        }

        Ok(records)
    }

    /// Lowest-indexed shard record of `name`, if the crash exists.
    pub async fn first_record(&self, name: &str) -> Result<Option<CrashShardRecord>> {
        let batch = self.kv.scan(&records_prefix(name), None, 1).await?;
        match batch.into_iter().next() {
            Some((_, bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persists updated shard records in one batch.
    pub async fn put_records(&self, records: &[CrashShardRecord]) -> Result<()> {
        let entries = records
            .iter()
            .map(|r| -> Result<(String, Vec<u8>)> { Ok((r.storage_key(), serde_json::to_vec(r)?)) })
            .collect::<Result<Vec<_>>>()?;
        self.kv.put_batch(&entries).await?;
        Ok(())
    }

    /// Total occurrences of `name` across all shards.
    #[tracing::instrument(skip(self))]
    pub async fn count(&self, name: &str) -> Result<i64> {
        let key = count_cache_key(name);

        match self.cache.get(&key).await {
            Ok(Some(bytes)) => match parse_total(&bytes) {
                Some(total) => {
                    debug!(total, "count cache hit");
                    return Ok(total);
                }
                None => warn!("discarding malformed cached total"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "count cache lookup failed"),
        }

        let total: i64 = self
            .shard_records(name)
            .await?
            .iter()
            .map(|r| r.count)
            .sum();
        debug!(total, "count recomputed from shards");

        if let Err(e) = self
            .cache
            .set(&key, total.to_string().as_bytes(), Some(self.count_ttl))
            .await
        {
            warn!(error = %e, "failed to cache total");
        }

        Ok(total)
    }

    /// Value of `field` on the shard record with the latest timestamp.
    ///
    /// Ties go to the record scanned last.
    #[tracing::instrument(skip(self))]
    pub async fn most_recent(&self, name: &str, field: RecentField) -> Result<FieldValue> {
        let key = recent_cache_key(name, field);

        match self.cache.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<FieldValue>(&bytes) {
                Ok(value) => return Ok(value),
                Err(e) => warn!(error = %e, "discarding malformed cached field"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "field cache lookup failed"),
        }

        let records = self.shard_records(name).await?;
        let value = latest(&records)
            .map(|record| field.extract(record))
            .unwrap_or_else(|| field.default_value());

        if let Err(e) = self
            .cache
            .set(&key, &serde_json::to_vec(&value)?, Some(self.field_ttl))
            .await
        {
            warn!(error = %e, "failed to cache field");
        }

        Ok(value)
    }

    pub async fn most_recent_timestamp(&self, name: &str) -> Result<i64> {
        match self.most_recent(name, RecentField::Timestamp).await? {
            FieldValue::Timestamp(ms) => Ok(ms),
            _ => Ok(0),
        }
    }

    pub async fn most_recent_state(&self, name: &str) -> Result<CrashState> {
        match self.most_recent(name, RecentField::State).await? {
            FieldValue::State(state) => Ok(state),
            _ => Ok(CrashState::default()),
        }
    }

    pub async fn most_recent_labels(&self, name: &str) -> Result<Vec<String>> {
        match self.most_recent(name, RecentField::Labels).await? {
            FieldValue::Labels(labels) => Ok(labels),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn most_recent_issue(&self, name: &str) -> Result<Option<String>> {
        match self.most_recent(name, RecentField::Issue).await? {
            FieldValue::Issue(issue) => Ok(issue),
            _ => Ok(None),
        }
    }

    pub async fn most_recent_argv(&self, name: &str) -> Result<Vec<String>> {
        match self.most_recent(name, RecentField::Argv).await? {
            FieldValue::Argv(argv) => Ok(argv),
            _ => Ok(Vec::new()),
        }
    }

    /// Drops the cached total and every cached field of `name`.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, name: &str) {
        let mut keys = field_keys(name);
        keys.push(count_cache_key(name));
        self.delete_keys(&keys).await;
    }

    async fn invalidate_fields(&self, name: &str) {
        self.delete_keys(&field_keys(name)).await;
    }

    async fn delete_keys(&self, keys: &[String]) {
        match self.cache.delete_multi(keys).await {
            Ok(removed) => debug!(removed, "invalidated cache entries"),
            Err(e) => warn!(error = %e, "cache invalidation failed"),
        }
    }
}

fn field_keys(name: &str) -> Vec<String> {
    RecentField::ALL
        .iter()
        .map(|field| recent_cache_key(name, *field))
        .collect()
}

fn latest(records: &[CrashShardRecord]) -> Option<&CrashShardRecord> {
    records.iter().fold(None, |best, record| match best {
        Some(current) if record.timestamp < current.timestamp => Some(current),
        _ => Some(record),
    })
}

fn parse_total(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::shard::ShardSelector;
    use chrono::{TimeZone, Utc};
    use crashboard_state::{MemoryCache, MemoryKv};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RoundRobin(AtomicU32);

    impl ShardSelector for RoundRobin {
        fn select(&self, _name: &str, shards: u32) -> u32 {
            self.0.fetch_add(1, Ordering::SeqCst) % shards
        }
    }

    struct Fixture {
        kv: Arc<MemoryKv>,
        cache: Arc<MemoryCache>,
        store: CounterStore,
    }

    fn fixture(shards: u32) -> Fixture {
        let kv = Arc::new(MemoryKv::new());
        let cache = Arc::new(MemoryCache::new());
        let router = ShardRouter::new(
            kv.clone(),
            cache.clone(),
            Arc::new(RoundRobin(AtomicU32::new(0))),
            shards,
            Duration::from_secs(60),
        );
        let store = CounterStore::new(
            kv.clone(),
            cache.clone(),
            router,
            Duration::from_secs(600),
            Duration::from_secs(120),
        );
        Fixture { kv, cache, store }
    }

    fn occurrence() -> Occurrence {
        Occurrence::new(Fingerprint::new(11), "boom at main")
    }

    #[tokio::test]
    async fn apply_creates_then_increments() {
        let f = fixture(1);
        let first = f.store.apply(&occurrence(), 1, true).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.state, CrashState::Unresolved);

        let second = f.store.apply(&occurrence(), 1, true).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.timestamp, first.timestamp);
        assert_eq!(f.kv.len().await, 2); // one shard record plus its config
    }

    #[tokio::test]
    async fn count_sums_all_shards() {
        let f = fixture(3);
        for _ in 0..7 {
            f.store.apply(&occurrence(), 1, true).await.unwrap();
        }
        let name = logical_name(Fingerprint::new(11));
        assert_eq!(f.store.shard_records(&name).await.unwrap().len(), 3);
        assert_eq!(f.store.count(&name).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn cached_total_is_adjusted_not_created() {
        let f = fixture(2);
        let name = logical_name(Fingerprint::new(11));

        f.store.apply(&occurrence(), 1, true).await.unwrap();
        // No total cached yet, so incr must not have created one.
        assert!(f.cache.get(&count_cache_key(&name)).await.unwrap().is_none());

        assert_eq!(f.store.count(&name).await.unwrap(), 1);
        f.store.apply(&occurrence(), 4, true).await.unwrap();
        let cached = f.cache.get(&count_cache_key(&name)).await.unwrap().unwrap();
        assert_eq!(cached, b"5");

        f.store.apply(&occurrence(), 2, false).await.unwrap();
        assert_eq!(f.store.count(&name).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn stale_total_heals_after_invalidate() {
        let f = fixture(1);
        let name = logical_name(Fingerprint::new(11));
        f.store.apply(&occurrence(), 1, true).await.unwrap();
        f.cache
            .set(&count_cache_key(&name), b"99", None)
            .await
            .unwrap();
        assert_eq!(f.store.count(&name).await.unwrap(), 99);

        f.store.invalidate(&name).await;
        assert_eq!(f.store.count(&name).await.unwrap(), 1);
        f.store.invalidate(&name).await;
        f.store.invalidate(&name).await;
        assert_eq!(f.store.count(&name).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn most_recent_picks_latest_timestamp() {
        let f = fixture(2);
        let name = logical_name(Fingerprint::new(11));
        f.store.apply(&occurrence(), 1, true).await.unwrap();
        f.store.apply(&occurrence(), 1, true).await.unwrap();

        let mut records = f.store.shard_records(&name).await.unwrap();
        records[0].timestamp = Utc.timestamp_millis_opt(2_000).unwrap();
        records[0].state = CrashState::Pending;
        records[1].timestamp = Utc.timestamp_millis_opt(1_000).unwrap();
        records[1].state = CrashState::Submitted;
        f.store.put_records(&records).await.unwrap();
        f.store.invalidate(&name).await;

        assert_eq!(
            f.store.most_recent_state(&name).await.unwrap(),
            CrashState::Pending
        );
        assert_eq!(f.store.most_recent_timestamp(&name).await.unwrap(), 2_000);
    }

    #[tokio::test]
    async fn most_recent_ties_go_to_later_record() {
        let f = fixture(2);
        let name = logical_name(Fingerprint::new(11));
        f.store.apply(&occurrence(), 1, true).await.unwrap();
        f.store.apply(&occurrence(), 1, true).await.unwrap();

        let mut records = f.store.shard_records(&name).await.unwrap();
        let ts = Utc.timestamp_millis_opt(5_000).unwrap();
        records[0].timestamp = ts;
        records[0].issue = Some("1".to_string());
        records[1].timestamp = ts;
        records[1].issue = Some("2".to_string());
        f.store.put_records(&records).await.unwrap();
        f.store.invalidate(&name).await;

        assert_eq!(
            f.store.most_recent_issue(&name).await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn unknown_crash_reads_defaults() {
        let f = fixture(2);
        assert_eq!(f.store.count("crash-0").await.unwrap(), 0);
        assert_eq!(
            f.store.most_recent_state("crash-0").await.unwrap(),
            CrashState::Unresolved
        );
        assert!(f.store.most_recent_labels("crash-0").await.unwrap().is_empty());
        assert!(f.store.most_recent_issue("crash-0").await.unwrap().is_none());
        assert!(f.store.most_recent_argv("crash-0").await.unwrap().is_empty());
        assert_eq!(f.store.most_recent_timestamp("crash-0").await.unwrap(), 0);
        assert!(f.store.first_record("crash-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_clears_cached_fields() {
        let f = fixture(1);
        let name = logical_name(Fingerprint::new(11));
        f.store.apply(&occurrence(), 1, true).await.unwrap();
        f.store.most_recent_state(&name).await.unwrap();
        let key = recent_cache_key(&name, RecentField::State);
        assert!(f.cache.get(&key).await.unwrap().is_some());

        f.store.apply(&occurrence(), 1, true).await.unwrap();
        assert!(f.cache.get(&key).await.unwrap().is_none());
    }
}
