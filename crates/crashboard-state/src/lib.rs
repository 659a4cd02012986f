//! Storage seams for crashboard: a durable ordered document store, an
//! advisory cache and a deferred job queue, each with an in-process backend
//! and an optional Valkey backend.

mod error;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "valkey")]
mod valkey;

#[cfg(feature = "config")]
mod config;

#[cfg(feature = "config")]
mod provider;

pub use error::{CacheError, KvError, QueueError, StateError};
pub use traits::{CacheBackend, KvBackend, QueueBackend};
pub use types::{prefix_upper_bound, Message, MessageId};

#[cfg(feature = "memory")]
pub use memory::{MemoryCache, MemoryKv, MemoryQueue};

#[cfg(feature = "valkey")]
pub use valkey::{ValkeyCache, ValkeyKv};

#[cfg(feature = "config")]
pub use config::{CacheConfig, KvConfig, QueueConfig, StateConfig};

#[cfg(feature = "config")]
pub use provider::StateProvider;
