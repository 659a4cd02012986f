//! Ranked, paginated listing of distinct crashes.
//!
//! Shard records are walked in key order. Because every shard of a crash
//! shares its name as a key prefix, a crash's records are contiguous and the
//! key of its last scanned record is an exact continuation point.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregator::CrashAggregator;
use crate::error::Result;
use crate::model::{CrashShardRecord, MergedView, SHARD_PREFIX};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendingPage {
    pub items: Vec<MergedView>,
    /// Opaque continuation token for the next page.
    pub cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TrendingOptions {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    /// Skip resolved crashes; defaults to the configured behaviour.
    pub unresolved_only: Option<bool>,
}

/// Names selected for one page plus where the scan stopped.
struct ScanOutcome {
    names: Vec<String>,
    cursor: Option<String>,
    has_more: bool,
}

impl CrashAggregator {
    /// Crashes ordered by total count, `limit` per page (the configured
    /// default when `None`).
    pub async fn trending(&self, cursor: Option<&str>, limit: Option<usize>) -> Result<TrendingPage> {
        self.trending_with(TrendingOptions {
            cursor: cursor.map(String::from),
            limit,
            unresolved_only: None,
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn trending_with(&self, options: TrendingOptions) -> Result<TrendingPage> {
        let limit = options.limit.unwrap_or(self.trending.default_limit).max(1);
        let unresolved_only = options
            .unresolved_only
            .unwrap_or(self.trending.unresolved_only);

        let outcome = self
            .scan_names(options.cursor.as_deref(), limit, unresolved_only)
            .await?;

        let mut items = Vec::with_capacity(outcome.names.len());
        for name in &outcome.names {
            if let Some(view) = self.view_by_name(name).await? {
                items.push(view);
            }
        }
        items.sort_by(|a, b| b.count.cmp(&a.count));
        debug!(items = items.len(), has_more = outcome.has_more, "trending page");

        Ok(TrendingPage {
            items,
            cursor: outcome.cursor,
            has_more: outcome.has_more,
        })
    }

    async fn scan_names(
        &self,
        cursor: Option<&str>,
        limit: usize,
        unresolved_only: bool,
    ) -> Result<ScanOutcome> {
        let batch_size = self.trending.scan_batch_size.max(1);
        let mut after = cursor.map(|c| format!("{}{}", SHARD_PREFIX, c));
        let mut seen = HashSet::new();
        let mut outcome = ScanOutcome {
            names: Vec::new(),
            cursor: cursor.map(String::from),
            has_more: false,
        };

        'scan: loop {
            let batch = self
                .kv
                .scan(SHARD_PREFIX, after.as_deref(), batch_size)
                .await?;
            let exhausted = batch.len() < batch_size;

            for (key, bytes) in batch {
                after = Some(key.clone());
                let record: CrashShardRecord = match serde_json::from_slice(&bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(%key, error = %e, "skipping unreadable shard record");
                        continue;
                    }
                };
                if unresolved_only && record.state.is_terminal() {
                    continue;
                }

                if !seen.contains(&record.name) {
                    if outcome.names.len() == limit {
                        outcome.has_more = true;
                        break 'scan;
                    }
                    seen.insert(record.name.clone());
                    outcome.names.push(record.name.clone());
                }
                outcome.cursor = Some(record.key());
            }

            if exhausted {
                break;
            }
        }

        Ok(outcome)
    }
}
