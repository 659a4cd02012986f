use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CacheError, KvError, QueueError};
use crate::types::{Message, MessageId};

/// Durable key/value document store.
///
/// Keys are ordered lexicographically; `scan` walks that order so a cursor
/// (the last key returned) is a stable continuation point. Entries never
/// expire, so a short `scan` batch always means the prefix is exhausted.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    async fn put_batch(&self, entries: &[(String, Vec<u8>)]) -> Result<(), KvError>;

    /// Returns up to `limit` entries under `prefix` whose key sorts strictly
    /// after `after`, in ascending key order.
    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError>;

    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool, KvError>;

    /// Get-or-create: stores `initial` only when `key` is absent and returns
    /// whatever value the key holds afterwards.
    async fn get_or_insert(&self, key: &str, initial: &[u8]) -> Result<Vec<u8>, KvError> {
        for _ in 0..3 {
            if let Some(existing) = self.get(key).await? {
                return Ok(existing);
            }
            if self.cas(key, None, initial).await? {
                return Ok(initial.to_vec());
            }
        }
        Err(KvError::Conflict)
    }
}

/// Advisory cache with per-key expiry.
///
/// Nothing stored here is authoritative; callers must be able to rebuild
/// every entry from a [`KvBackend`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Adds `delta` to an existing integer entry.
    ///
    /// Returns `None` without creating anything when the key is absent.
    async fn incr(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError>;

    async fn decr(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError> {
        self.incr(key, -delta).await
    }

    /// Removes every listed key, returning how many were present.
    async fn delete_multi(&self, keys: &[String]) -> Result<usize, CacheError>;
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Publishes a message that stays invisible to receivers for `delay`.
    async fn publish_delayed(
        &self,
        queue: &str,
        message: &[u8],
        delay: Duration,
    ) -> Result<MessageId, QueueError>;

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError>;

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError>;
}
