//! Crash report aggregation.
//!
//! Reports are grouped into logical crashes by a near-duplicate
//! [`Fingerprint`]. Each crash keeps its occurrence count across several
//! shard records so concurrent writers rarely collide, with cached
//! aggregates layered on top for reads.
//!
//! ```no_run
//! use crashboard_core::{CrashAggregator, CrashboardConfig};
//!
//! # async fn example() -> crashboard_core::Result<()> {
//! let board = CrashAggregator::from_config(CrashboardConfig::default()).await?;
//! board.record("Error: X\n at foo\n at bar", &[], &[]).await?;
//! let page = board.trending(None, None).await?;
//! println!("{} trending crashes", page.items.len());
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod config;
pub mod counter;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod notify;
pub mod search;
pub mod shard;
pub mod text;
pub mod trending;

pub use aggregator::{CrashAggregator, CrashAggregatorBuilder};
pub use config::CrashboardConfig;
pub use counter::{CounterStore, Occurrence};
pub use error::{CrashboardError, Result};
pub use fingerprint::{fingerprint, Fingerprint, Fingerprinter};
pub use model::{
    AttributeDelta, CrashShardRecord, CrashState, FieldValue, MergedView, RecentField, ShardConfig,
};
pub use notify::{IssueOrchestrator, IssueTracker, MemoryIssueTracker};
pub use search::{CrashDocument, MemorySearchIndex, SearchIndex, SearchPage};
pub use shard::{ShardRouter, ShardSelector, UniformShardSelector};
pub use trending::{TrendingOptions, TrendingPage};
