//! Full-text index over crash shard records.
//!
//! The index is a secondary, read-optimised copy. It is fed after every
//! write and may lag behind the durable store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{CrashboardError, Result};
use crate::fingerprint::Fingerprint;
use crate::model::{CrashShardRecord, CrashState};

pub const DEFAULT_SEARCH_LIMIT: usize = 25;

/// Flattened, indexable projection of a shard record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashDocument {
    /// Shard key; doubles as the document id.
    pub key: String,
    pub fingerprint: Fingerprint,
    #[serde(rename = "crash")]
    pub text: String,
    #[serde(rename = "time")]
    pub timestamp: i64,
    /// Total count of the crash when the document was written.
    pub count: i64,
    pub state: CrashState,
    pub labels: Vec<String>,
    pub issue: Option<String>,
}

impl CrashDocument {
    pub fn from_record(record: &CrashShardRecord, count: i64) -> Self {
        Self {
            key: record.key(),
            fingerprint: record.fingerprint,
            text: record.text.clone(),
            timestamp: record.timestamp_millis(),
            count,
            state: record.state,
            labels: record.labels.clone(),
            issue: record.issue.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub results: Vec<CrashDocument>,
    pub cursor: Option<String>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Inserts or replaces documents by key.
    async fn put(&self, documents: &[CrashDocument]) -> Result<()>;

    /// Newest matches first; `cursor` continues a previous page.
    async fn search(&self, query: &str, cursor: Option<&str>, limit: usize) -> Result<SearchPage>;

    async fn delete_all(&self) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Word(String),
    State(String),
    Label(String),
    Fingerprint(String),
}

impl Term {
    fn parse(raw: &str) -> Self {
        let lowered = raw.to_lowercase();
        match lowered.split_once(':') {
            Some(("state", v)) => Self::State(v.to_string()),
            Some(("label", v)) | Some(("labels", v)) => Self::Label(v.to_string()),
            Some(("fingerprint", v)) => Self::Fingerprint(v.to_string()),
            _ => Self::Word(lowered),
        }
    }

    fn matches(&self, doc: &CrashDocument) -> bool {
        match self {
            Self::Word(w) => {
                doc.text.to_lowercase().contains(w.as_str())
                    || doc.labels.iter().any(|l| l.to_lowercase().contains(w.as_str()))
            }
            Self::State(s) => doc.state.as_str() == s,
            Self::Label(l) => doc.labels.iter().any(|label| label.to_lowercase() == *l),
            Self::Fingerprint(f) => doc.fingerprint.to_string() == *f,
        }
    }
}

/// In-process index with substring matching.
///
/// Words match case-insensitively against the text and labels; `state:`,
/// `label:` and `fingerprint:` terms match those fields exactly. All terms
/// must match.
#[derive(Default)]
pub struct MemorySearchIndex {
    documents: RwLock<BTreeMap<String, CrashDocument>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    pub async fn get(&self, key: &str) -> Option<CrashDocument> {
        self.documents.read().await.get(key).cloned()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn put(&self, documents: &[CrashDocument]) -> Result<()> {
        let mut stored = self.documents.write().await;
        for doc in documents {
            stored.insert(doc.key.clone(), doc.clone());
        }
        Ok(())
    }

    async fn search(&self, query: &str, cursor: Option<&str>, limit: usize) -> Result<SearchPage> {
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| CrashboardError::Index(format!("invalid cursor: {}", c)))?,
            None => 0,
        };
        let terms: Vec<Term> = query.split_whitespace().map(Term::parse).collect();

        let stored = self.documents.read().await;
        let mut matches: Vec<&CrashDocument> = stored
            .values()
            .filter(|doc| terms.iter().all(|t| t.matches(doc)))
            .collect();
        matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.key.cmp(&b.key)));

        let results: Vec<CrashDocument> = matches
            .iter()
            .skip(offset)
            .take(limit)
            .map(|doc| (*doc).clone())
            .collect();
        let next = offset + results.len();
        let cursor = (next < matches.len()).then(|| next.to_string());

        Ok(SearchPage { results, cursor })
    }

    async fn delete_all(&self) -> Result<usize> {
        let mut stored = self.documents.write().await;
        let removed = stored.len();
        stored.clear();
        Ok(removed)
    }
}
