//! Stored entities, the merged view and the key layout.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CrashboardError, Result};
use crate::fingerprint::Fingerprint;

/// Prefix of every shard record in the durable store.
pub const SHARD_PREFIX: &str = "shard/";

/// Prefix of every shard configuration in the durable store.
pub const SHARD_CONFIG_PREFIX: &str = "shardcfg/";

/// Name shared by every shard record of one logical crash.
pub fn logical_name(fingerprint: Fingerprint) -> String {
    format!("crash-{}", fingerprint)
}

/// Identity of one shard record; also the search document id.
///
/// Zero padding keeps a crash's shards in index order under key ordering.
pub fn shard_key(name: &str, shard: u32) -> String {
    format!("{}/{:05}", name, shard)
}

pub fn record_key(name: &str, shard: u32) -> String {
    format!("{}{}", SHARD_PREFIX, shard_key(name, shard))
}

/// Prefix matching exactly the shard records of `name`.
pub fn records_prefix(name: &str) -> String {
    format!("{}{}/", SHARD_PREFIX, name)
}

pub fn shard_config_key(name: &str) -> String {
    format!("{}{}", SHARD_CONFIG_PREFIX, name)
}

pub fn count_cache_key(name: &str) -> String {
    format!("total/{}", name)
}

pub fn recent_cache_key(name: &str, field: RecentField) -> String {
    format!("recent/{}/{}", name, field)
}

pub fn shard_config_cache_key(name: &str) -> String {
    format!("shardcfg/{}", name)
}

/// Lifecycle of a crash. Any state may move to any other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashState {
    #[default]
    Unresolved,
    Pending,
    Submitted,
    Resolved,
}

impl CrashState {
    pub const ALL: [CrashState; 4] = [
        CrashState::Unresolved,
        CrashState::Pending,
        CrashState::Submitted,
        CrashState::Resolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Resolved => "resolved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved)
    }
}

impl fmt::Display for CrashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrashState {
    type Err = CrashboardError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CrashboardError::InvalidState(s.to_string()))
    }
}

/// One counter shard of a logical crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashShardRecord {
    pub name: String,
    pub shard: u32,
    pub text: String,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub labels: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Signed delta; the shards of a crash sum to its occurrence count.
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub state: CrashState,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub argv: Vec<String>,
}

impl CrashShardRecord {
    pub fn key(&self) -> String {
        shard_key(&self.name, self.shard)
    }

    pub fn storage_key(&self) -> String {
        record_key(&self.name, self.shard)
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Number of counter shards allocated to a logical crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub name: String,
    pub shards: u32,
}

/// A crash reconciled across all of its shard records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedView {
    pub key: String,
    #[serde(rename = "crash")]
    pub text: String,
    pub argv: Vec<String>,
    pub labels: Vec<String>,
    pub fingerprint: Fingerprint,
    /// Most recent occurrence, in milliseconds since the epoch.
    #[serde(rename = "time")]
    pub timestamp: i64,
    pub count: i64,
    pub state: CrashState,
    pub issue: Option<String>,
}

/// Mutable attributes tracked per crash, each cached independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecentField {
    Timestamp,
    State,
    Labels,
    Issue,
    Argv,
}

impl RecentField {
    pub const ALL: [RecentField; 5] = [
        RecentField::Timestamp,
        RecentField::State,
        RecentField::Labels,
        RecentField::Issue,
        RecentField::Argv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::State => "state",
            Self::Labels => "labels",
            Self::Issue => "issue",
            Self::Argv => "argv",
        }
    }

    /// Value reported when a crash has no shard records.
    pub fn default_value(&self) -> FieldValue {
        match self {
            Self::Timestamp => FieldValue::Timestamp(0),
            Self::State => FieldValue::State(CrashState::Unresolved),
            Self::Labels => FieldValue::Labels(Vec::new()),
            Self::Issue => FieldValue::Issue(None),
            Self::Argv => FieldValue::Argv(Vec::new()),
        }
    }

    pub fn extract(&self, record: &CrashShardRecord) -> FieldValue {
        match self {
            Self::Timestamp => FieldValue::Timestamp(record.timestamp_millis()),
            Self::State => FieldValue::State(record.state),
            Self::Labels => FieldValue::Labels(record.labels.clone()),
            Self::Issue => FieldValue::Issue(record.issue.clone()),
            Self::Argv => FieldValue::Argv(record.argv.clone()),
        }
    }
}

impl fmt::Display for RecentField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Timestamp(i64),
    State(CrashState),
    Labels(Vec<String>),
    Issue(Option<String>),
    Argv(Vec<String>),
}

/// Partial update of a crash's mutable attributes.
///
/// Unrecognised attribute names are rejected rather than ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, alias = "date_time", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Replaces the count of every shard record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CrashState>,
}

impl AttributeDelta {
    pub const FIELDS: [&'static str; 5] = ["labels", "timestamp", "count", "issue", "state"];

    pub fn state(state: CrashState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn issue(issue: impl Into<String>) -> Self {
        Self {
            issue: Some(issue.into()),
            ..Self::default()
        }
    }

    /// Builds a delta from loosely typed name/value pairs.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, serde_json::Value)>,
    {
        let mut object = serde_json::Map::new();
        for (name, value) in pairs {
            let canonical = match name {
                "date_time" => "timestamp",
                other => other,
            };
            if !Self::FIELDS.contains(&canonical) {
                return Err(CrashboardError::UnknownField(name.to_string()));
            }
            if canonical == "timestamp" {
                object.insert(canonical.to_string(), normalise_timestamp(value));
            } else {
                object.insert(canonical.to_string(), value);
            }
        }
        Ok(serde_json::from_value(serde_json::Value::Object(object))?)
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_none()
            && self.timestamp.is_none()
            && self.count.is_none()
            && self.issue.is_none()
            && self.state.is_none()
    }

    pub fn apply_to(&self, record: &mut CrashShardRecord) {
        if let Some(labels) = &self.labels {
            record.labels = labels.clone();
        }
        if let Some(timestamp) = self.timestamp {
            record.timestamp = timestamp;
        }
        if let Some(count) = self.count {
            record.count = count;
        }
        if let Some(issue) = &self.issue {
            record.issue = Some(issue.clone());
        }
        if let Some(state) = self.state {
            record.state = state;
        }
    }
}

// Millisecond timestamps are accepted alongside RFC 3339 strings.
fn normalise_timestamp(value: serde_json::Value) -> serde_json::Value {
    match value.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
        Some(dt) => serde_json::Value::String(dt.to_rfc3339()),
        None => value,
    }
}
