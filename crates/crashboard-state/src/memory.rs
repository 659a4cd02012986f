use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{CacheError, KvError, QueueError};
use crate::traits::{CacheBackend, KvBackend, QueueBackend};
use crate::types::{prefix_upper_bound, Message, MessageId};

/// In-process ordered document store.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

/// Key range for a prefix scan resuming after `after`; `None` when the
/// cursor already lies beyond the prefix.
fn range_bounds(prefix: &str, after: Option<&str>) -> Option<(Bound<String>, Bound<String>)> {
    let upper = prefix_upper_bound(prefix);
    if let (Some(cursor), Some(upper)) = (after, upper.as_deref()) {
        if cursor >= upper {
            return None;
        }
    }
    let lower = match after {
        Some(cursor) if cursor >= prefix => Bound::Excluded(cursor.to_string()),
        _ => Bound::Included(prefix.to_string()),
    };
    Some((lower, upper.map_or(Bound::Unbounded, Bound::Excluded)))
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let mut data = self.data.write().await;
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn put_batch(&self, entries: &[(String, Vec<u8>)]) -> Result<(), KvError> {
        let mut data = self.data.write().await;
        data.extend(entries.iter().cloned());
        Ok(())
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let data = self.data.read().await;

        let Some(bounds) = range_bounds(prefix, after) else {
            return Ok(Vec::new());
        };
        Ok(data
            .range(bounds)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool, KvError> {
        let mut data = self.data.write().await;

        let swap = match (expected, data.get(key)) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == cur.as_slice(),
            _ => false,
        };

        if swap {
            data.insert(key.to_string(), new.to_vec());
        }
        Ok(swap)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// In-process cache with lazy expiry.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    data: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry, simulating a cache flush or eviction storm.
    pub async fn flush(&self) {
        self.data.write().await.clear();
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let expired = {
            let data = self.data.read().await;
            match data.get(key) {
                Some(entry) if entry.is_live(Instant::now()) => {
                    return Ok(Some(entry.value.clone()))
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.data.write().await.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut data = self.data.write().await;
        data.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_vec(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError> {
        let mut data = self.data.write().await;
        let Some(entry) = data.get_mut(key) else {
            return Ok(None);
        };
        if !entry.is_live(Instant::now()) {
            data.remove(key);
            return Ok(None);
        }

        let current: i64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| CacheError::NotAnInteger {
                key: key.to_string(),
            })?;
        let updated = current.saturating_add(delta);
        entry.value = updated.to_string().into_bytes();
        Ok(Some(updated))
    }

    async fn delete_multi(&self, keys: &[String]) -> Result<usize, CacheError> {
        let mut data = self.data.write().await;
        Ok(keys.iter().filter(|key| data.remove(*key).is_some()).count())
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    message: Message,
    visible_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<QueueEntry>>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages in `queue`, visible or not.
    pub async fn depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn publish_delayed(
        &self,
        queue: &str,
        message: &[u8],
        delay: Duration,
    ) -> Result<MessageId, QueueError> {
        let id = MessageId::new(Uuid::new_v4().to_string());
        let message = Message {
            attempt: 0,
            ..Message::new(id.as_str(), message.to_vec())
        };

        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(QueueEntry {
                message,
                visible_at: Instant::now() + delay,
            });
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(queue_data) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Instant::now();
        Ok(queue_data
            .iter_mut()
            .find(|entry| entry.visible_at <= now)
            .map(|entry| {
                entry.visible_at = now + visibility_timeout;
                entry.message.attempt += 1;
                entry.message.clone()
            }))
    }

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let entries = queue_entries(&mut queues, queue)?;
        let position = position_of(entries, message_id)?;
        entries.remove(position);
        Ok(())
    }
}

fn queue_entries<'a>(
    queues: &'a mut HashMap<String, VecDeque<QueueEntry>>,
    queue: &str,
) -> Result<&'a mut VecDeque<QueueEntry>, QueueError> {
    queues
        .get_mut(queue)
        .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))
}

fn position_of(entries: &VecDeque<QueueEntry>, id: &MessageId) -> Result<usize, QueueError> {
    entries
        .iter()
        .position(|entry| entry.message.id == *id)
        .ok_or_else(|| QueueError::MessageNotFound(id.to_string()))
}
