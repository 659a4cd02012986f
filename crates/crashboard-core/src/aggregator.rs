//! Public entry point for recording and querying crashes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crashboard_state::{CacheBackend, KvBackend, StateProvider};
use tracing::{debug, info, warn};

use crate::config::{CrashboardConfig, TrendingSettings};
use crate::counter::{CounterStore, Occurrence};
use crate::error::{CrashboardError, Result};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::model::{
    logical_name, AttributeDelta, CrashShardRecord, CrashState, MergedView, SHARD_PREFIX,
};
use crate::notify::{IssueOrchestrator, IssueTracker};
use crate::search::{CrashDocument, SearchIndex, SearchPage, DEFAULT_SEARCH_LIMIT};
use crate::shard::{ShardRouter, ShardSelector, UniformShardSelector};

pub struct CrashAggregator {
    pub(crate) fingerprinter: Fingerprinter,
    pub(crate) counter: CounterStore,
    pub(crate) kv: Arc<dyn KvBackend>,
    pub(crate) index: Option<Arc<dyn SearchIndex>>,
    pub(crate) notifier: Option<Arc<IssueOrchestrator>>,
    pub(crate) trending: TrendingSettings,
}

impl CrashAggregator {
    pub fn builder(config: CrashboardConfig) -> CrashAggregatorBuilder {
        CrashAggregatorBuilder::new(config)
    }

    /// Builds an aggregator over the backends named in `config`.
    pub async fn from_config(config: CrashboardConfig) -> Result<Self> {
        let state = StateProvider::from_config(&config.state).await?;
        Self::builder(config).state(state).build()
    }

    pub fn counter(&self) -> &CounterStore {
        &self.counter
    }

    pub fn notifier(&self) -> Option<&Arc<IssueOrchestrator>> {
        self.notifier.as_ref()
    }

    /// Drains queued issue-tracker work. Returns the number of jobs handled.
    pub async fn run_notifications(&self) -> Result<usize> {
        match &self.notifier {
            Some(notifier) => notifier.run_pending(self).await,
            None => Ok(0),
        }
    }

    /// Records one occurrence of a report.
    ///
    /// Returns `None` when the report has no tokens to fingerprint.
    #[tracing::instrument(skip_all)]
    pub async fn record(
        &self,
        text: &str,
        labels: &[String],
        argv: &[String],
    ) -> Result<Option<MergedView>> {
        let text = text.trim();
        let Some(fingerprint) = self.fingerprinter.fingerprint(Some(text)) else {
            debug!("report has no fingerprint");
            return Ok(None);
        };
        let name = logical_name(fingerprint);

        // Carry an existing issue into any shard created now.
        let issue = self.counter.most_recent_issue(&name).await?;
        let occurrence = Occurrence {
            fingerprint,
            text: text.to_string(),
            labels: labels.to_vec(),
            argv: argv.to_vec(),
            issue,
        };
        let record = self.counter.apply(&occurrence, 1, true).await?;

        let count = self.counter.count(&name).await?;
        self.index_records(std::slice::from_ref(&record), count).await;

        let view = self.view_by_name(&name).await?;
        if let (Some(view), Some(notifier)) = (&view, &self.notifier) {
            if let Err(e) = notifier.manage(view).await {
                warn!(%fingerprint, error = %e, "failed to schedule issue work");
            }
        }
        Ok(view)
    }

    /// Removes `delta` occurrences of a report.
    #[tracing::instrument(skip(self, text))]
    pub async fn remove(&self, text: &str, delta: i64) -> Result<Option<MergedView>> {
        let text = text.trim();
        let Some(fingerprint) = self.fingerprinter.fingerprint(Some(text)) else {
            return Ok(None);
        };
        let name = logical_name(fingerprint);

        let issue = self.counter.most_recent_issue(&name).await?;
        let occurrence = Occurrence {
            issue,
            ..Occurrence::new(fingerprint, text)
        };
        let record = self.counter.apply(&occurrence, delta, false).await?;

        let count = self.counter.count(&name).await?;
        self.index_records(std::slice::from_ref(&record), count).await;
        self.view_by_name(&name).await
    }

    pub async fn get_crash(&self, fingerprint: Fingerprint) -> Result<Option<MergedView>> {
        self.view_by_name(&logical_name(fingerprint)).await
    }

    pub(crate) async fn view_by_name(&self, name: &str) -> Result<Option<MergedView>> {
        let Some(first) = self.counter.first_record(name).await? else {
            return Ok(None);
        };

        Ok(Some(MergedView {
            key: first.key(),
            argv: self.counter.most_recent_argv(name).await?,
            labels: self.counter.most_recent_labels(name).await?,
            fingerprint: first.fingerprint,
            timestamp: self.counter.most_recent_timestamp(name).await?,
            count: self.counter.count(name).await?,
            state: self.counter.most_recent_state(name).await?,
            issue: self.counter.most_recent_issue(name).await?,
            text: first.text,
        }))
    }

    /// Applies `delta` to every shard record of the crash.
    ///
    /// Shards are written in one batch but readers may still observe a
    /// partially applied update. Returns `None` for an unknown fingerprint.
    #[tracing::instrument(skip(self, delta))]
    pub async fn update_attributes(
        &self,
        fingerprint: Fingerprint,
        delta: &AttributeDelta,
    ) -> Result<Option<MergedView>> {
        let name = logical_name(fingerprint);
        let mut records = self.counter.shard_records(&name).await?;
        if records.is_empty() {
            debug!("update for unknown crash");
            return Ok(None);
        }

        for record in &mut records {
            delta.apply_to(record);
        }
        self.counter.put_records(&records).await?;
        self.counter.invalidate(&name).await;
        info!(shards = records.len(), ?delta, "updated crash attributes");

        let count = self.counter.count(&name).await?;
        self.index_records(&records, count).await;
        self.view_by_name(&name).await
    }

    pub async fn update_state(
        &self,
        fingerprint: Fingerprint,
        state: CrashState,
    ) -> Result<Option<MergedView>> {
        self.update_attributes(fingerprint, &AttributeDelta::state(state))
            .await
    }

    pub async fn update_issue(
        &self,
        fingerprint: Fingerprint,
        issue: impl Into<String>,
    ) -> Result<Option<MergedView>> {
        self.update_attributes(fingerprint, &AttributeDelta::issue(issue))
            .await
    }

    /// Drops every cached aggregate of the crash.
    pub async fn clear_cache(&self, fingerprint: Fingerprint) {
        self.counter.invalidate(&logical_name(fingerprint)).await;
    }

    /// Free-text search over indexed crashes, one hit per crash.
    ///
    /// Returns `None` for a blank query or when no index is configured.
    #[tracing::instrument(skip(self))]
    pub async fn search(
        &self,
        query: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Option<SearchPage>> {
        let Some(index) = &self.index else {
            return Ok(None);
        };
        if query.trim().is_empty() {
            return Ok(None);
        }

        let page = index
            .search(query, cursor, limit.unwrap_or(DEFAULT_SEARCH_LIMIT))
            .await?;

        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(page.results.len());
        for mut doc in page.results {
            if !seen.insert(doc.fingerprint) {
                continue;
            }
            doc.count = self.counter.count(&logical_name(doc.fingerprint)).await?;
            results.push(doc);
        }

        Ok(Some(SearchPage {
            results,
            cursor: page.cursor,
        }))
    }

    /// Re-feeds every shard record to the search index, `batch_size` at a
    /// time. Returns the number of documents written.
    #[tracing::instrument(skip(self))]
    pub async fn reindex(&self, batch_size: usize) -> Result<usize> {
        let Some(index) = &self.index else {
            return Ok(0);
        };
        let batch_size = batch_size.max(1);
        let mut counts: HashMap<String, i64> = HashMap::new();
        let mut after: Option<String> = None;
        let mut written = 0;

        loop {
            let batch = self.kv.scan(SHARD_PREFIX, after.as_deref(), batch_size).await?;
            let exhausted = batch.len() < batch_size;

            let mut documents = Vec::with_capacity(batch.len());
            for (key, bytes) in batch {
                after = Some(key);
                let record: CrashShardRecord = serde_json::from_slice(&bytes)?;
                let count = match counts.get(&record.name) {
                    Some(count) => *count,
                    None => {
                        let count = self.counter.count(&record.name).await?;
                        counts.insert(record.name.clone(), count);
                        count
                    }
                };
                documents.push(CrashDocument::from_record(&record, count));
            }

            if !documents.is_empty() {
                index.put(&documents).await?;
                written += documents.len();
                debug!(written, "reindexed batch");
            }
            if exhausted {
                break;
            }
        }

        info!(written, "reindex complete");
        Ok(written)
    }

    async fn index_records(&self, records: &[CrashShardRecord], count: i64) {
        let Some(index) = &self.index else {
            return;
        };
        let documents: Vec<CrashDocument> = records
            .iter()
            .map(|record| CrashDocument::from_record(record, count))
            .collect();
        if let Err(e) = index.put(&documents).await {
            warn!(error = %e, "failed to index crash documents");
        }
    }
}

pub struct CrashAggregatorBuilder {
    config: CrashboardConfig,
    state: StateProvider,
    selector: Option<Arc<dyn ShardSelector>>,
    index: Option<Arc<dyn SearchIndex>>,
    tracker: Option<Arc<dyn IssueTracker>>,
}

impl CrashAggregatorBuilder {
    pub fn new(config: CrashboardConfig) -> Self {
        Self {
            config,
            state: StateProvider::new(),
            selector: None,
            index: None,
            tracker: None,
        }
    }

    pub fn state(mut self, state: StateProvider) -> Self {
        self.state = state;
        self
    }

    pub fn kv(mut self, kv: Arc<dyn KvBackend>) -> Self {
        self.state = self.state.with_kv(kv);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.state = self.state.with_cache(cache);
        self
    }

    /// Overrides random shard placement.
    pub fn selector(mut self, selector: Arc<dyn ShardSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn search_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn issue_tracker(mut self, tracker: Arc<dyn IssueTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<CrashAggregator> {
        self.config.validate()?;
        let kv = self.state.kv()?;
        let cache = self.state.cache()?;
        let config = self.config;

        let selector = self
            .selector
            .unwrap_or_else(|| Arc::new(UniformShardSelector::new()));
        let router = ShardRouter::new(
            kv.clone(),
            cache.clone(),
            selector,
            config.sharding.shards_per_crash,
            config.sharding.config_ttl(),
        );
        let counter = CounterStore::new(
            kv.clone(),
            cache,
            router,
            config.cache.count_ttl(),
            config.cache.field_ttl(),
        );

        let notifier = match (config.notifier.enabled, self.tracker) {
            (true, Some(tracker)) => Some(Arc::new(IssueOrchestrator::new(
                self.state.queue()?,
                tracker,
                config.notifier.clone(),
            ))),
            (true, None) => {
                return Err(CrashboardError::Config(
                    "notifier enabled without an issue tracker".to_string(),
                ))
            }
            (false, _) => None,
        };

        Ok(CrashAggregator {
            fingerprinter: Fingerprinter::new(config.fingerprint.token_limit),
            counter,
            kv,
            index: self.index,
            notifier,
            trending: config.trending,
        })
    }
}
