//! Valkey/Redis adapters for the document store and cache backends.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;

use crate::error::{CacheError, KvError};
use crate::traits::{CacheBackend, KvBackend};
use crate::types::prefix_upper_bound;

/// Sorted set holding every document key, used for ordered range scans.
const KEY_INDEX: &str = "__keys";

async fn connect(url: &str, pool_size: usize) -> Result<Pool, String> {
    let config = Config::from_url(url);
    let pool = config
        .builder()
        .map_err(|e| e.to_string())?
        .max_size(pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| e.to_string())?;

    // Test the connection
    let mut conn = pool.get().await.map_err(|e| e.to_string())?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await
        .map_err(|e| e.to_string())?;

    tracing::debug!(pool_size, "connected to valkey");
    Ok(pool)
}

fn namespaced(namespace: Option<&str>, key: &str) -> String {
    match namespace {
        Some(ns) => format!("{}:{}", ns, key),
        None => key.to_string(),
    }
}

/// Valkey/Redis document store.
///
/// Values live under their own keys; a lexicographic sorted set mirrors the
/// key space so `scan` can walk keys in order.
#[derive(Clone)]
pub struct ValkeyKv {
    pool: Pool,
    namespace: Option<String>,
}

impl ValkeyKv {
    /// Create a new Valkey document store.
    pub async fn new(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
    ) -> Result<Self, KvError> {
        let pool = connect(url, pool_size).await.map_err(KvError::Connection)?;
        Ok(Self { pool, namespace })
    }

    async fn conn(&self) -> Result<Connection, KvError> {
        self.pool
            .get()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))
    }

    fn prefixed_key(&self, key: &str) -> String {
        namespaced(self.namespace.as_deref(), key)
    }

    fn index_key(&self) -> String {
        self.prefixed_key(KEY_INDEX)
    }

    /// Keys under `prefix` sorting after `after`, in order.
    async fn ordered_keys(
        &self,
        conn: &mut Connection,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        let min = match after {
            Some(cursor) if cursor >= prefix => format!("({}", cursor),
            _ => format!("[{}", prefix),
        };
        let max = prefix_upper_bound(prefix).map_or_else(|| "+".to_string(), |u| format!("({}", u));

        redis::cmd("ZRANGEBYLEX")
            .arg(self.index_key())
            .arg(min)
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut **conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }
}

#[async_trait]
impl KvBackend for ValkeyKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn().await?;
        conn.get(self.prefixed_key(key))
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let mut conn = self.conn().await?;

        redis::pipe()
            .atomic()
            .set(self.prefixed_key(key), value)
            .ignore()
            .zadd(self.index_key(), key, 0)
            .ignore()
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn put_batch(&self, entries: &[(String, Vec<u8>)]) -> Result<(), KvError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let index = self.index_key();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.set(self.prefixed_key(key), value.as_slice()).ignore();
            pipe.zadd(&index, key.as_str(), 0).ignore();
        }

        pipe.query_async::<()>(&mut *conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let mut conn = self.conn().await?;
        let keys = self.ordered_keys(&mut conn, prefix, after, limit).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&prefixed)
            .query_async(&mut *conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;

        // Values and index entries are written together and never expire, so
        // every indexed key has a value and a short batch means the prefix is done.
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;

        // Use a Lua script for atomic compare-and-swap
        let script = redis::Script::new(
            r#"
            local current = redis.call('GET', KEYS[1])
            local expected = ARGV[1]
            local new_value = ARGV[2]

            local matches = false
            if expected == '' then
                matches = (current == false)
            else
                matches = (current == expected)
            end

            if matches then
                redis.call('SET', KEYS[1], new_value)
                redis.call('ZADD', KEYS[2], 0, ARGV[3])
                return 1
            end
            return 0
            "#,
        );

        let expected_arg: Vec<u8> = expected.map(|e| e.to_vec()).unwrap_or_default();

        let result: i64 = script
            .key(self.prefixed_key(key))
            .key(self.index_key())
            .arg(expected_arg)
            .arg(new)
            .arg(key)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;

        Ok(result == 1)
    }
}

/// Valkey/Redis cache backend.
#[derive(Clone)]
pub struct ValkeyCache {
    pool: Pool,
    namespace: Option<String>,
}

impl ValkeyCache {
    /// Create a new Valkey cache backend.
    pub async fn new(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
    ) -> Result<Self, CacheError> {
        let pool = connect(url, pool_size)
            .await
            .map_err(CacheError::Connection)?;
        Ok(Self { pool, namespace })
    }

    async fn conn(&self) -> Result<Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))
    }

    fn prefixed_key(&self, key: &str) -> String {
        namespaced(self.namespace.as_deref(), key)
    }
}

#[async_trait]
impl CacheBackend for ValkeyCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get(self.prefixed_key(key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let prefixed = self.prefixed_key(key);

        match ttl {
            Some(duration) => conn
                .set_ex::<_, _, ()>(&prefixed, value, duration.as_secs().max(1))
                .await
                .map_err(|e| CacheError::Backend(e.to_string())),
            None => conn
                .set::<_, _, ()>(&prefixed, value)
                .await
                .map_err(|e| CacheError::Backend(e.to_string())),
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn().await?;

        // INCRBY on a missing key would create a counter without expiry.
        let script = redis::Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 1 then
                return redis.call('INCRBY', KEYS[1], ARGV[1])
            end
            return false
            "#,
        );

        script
            .key(self.prefixed_key(key))
            .arg(delta)
            .invoke_async::<Option<i64>>(&mut *conn)
            .await
            .map_err(|e| {
                if e.kind() == redis::ErrorKind::ResponseError {
                    CacheError::NotAnInteger {
                        key: key.to_string(),
                    }
                } else {
                    CacheError::Backend(e.to_string())
                }
            })
    }

    async fn delete_multi(&self, keys: &[String]) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();
        conn.del(prefixed)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests require a running Valkey/Redis instance
    // Run with: cargo test --features valkey -- --ignored

    const URL: &str = "redis://127.0.0.1:6379";

    /// Fresh namespace per test; the document store has no delete.
    fn namespace() -> Option<String> {
        Some(format!("crashboard-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    #[ignore = "requires Valkey/Redis instance at 127.0.0.1:6379"]
    async fn kv_scan_is_ordered_and_resumes_after_cursor() {
        let kv = ValkeyKv::new(URL, namespace(), 5)
            .await
            .expect("Failed to connect to Valkey");

        let entries: Vec<(String, Vec<u8>)> = ["b/2", "a/1", "b/1", "c/1"]
            .iter()
            .map(|k| ((*k).to_string(), k.as_bytes().to_vec()))
            .collect();
        kv.put_batch(&entries).await.unwrap();
        kv.put("b/3", b"b/3").await.unwrap();

        let page = kv.scan("b/", None, 2).await.unwrap();
        let keys: Vec<_> = page.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b/1", "b/2"]);
        assert_eq!(page[0].1, b"b/1".to_vec());

        let page = kv.scan("b/", Some("b/2"), 10).await.unwrap();
        let keys: Vec<_> = page.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b/3"]);

        // A cursor past the prefix yields nothing.
        assert!(kv.scan("b/", Some("c/0"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires Valkey/Redis instance at 127.0.0.1:6379"]
    async fn kv_get_or_insert_is_idempotent_and_indexed() {
        let kv = ValkeyKv::new(URL, namespace(), 5)
            .await
            .expect("Failed to connect to Valkey");

        let first = kv.get_or_insert("cfg/one", b"first").await.unwrap();
        let second = kv.get_or_insert("cfg/one", b"second").await.unwrap();
        assert_eq!(first, b"first".to_vec());
        assert_eq!(second, b"first".to_vec());

        // The CAS script adds the key to the index, so a scan sees it once.
        let page = kv.scan("cfg/", None, 10).await.unwrap();
        assert_eq!(page, vec![("cfg/one".to_string(), b"first".to_vec())]);
    }

    #[tokio::test]
    #[ignore = "requires Valkey/Redis instance at 127.0.0.1:6379"]
    async fn kv_cas() {
        let kv = ValkeyKv::new(URL, namespace(), 5)
            .await
            .expect("Failed to connect to Valkey");

        assert!(kv.cas("cas_key", None, b"value1").await.unwrap());
        assert!(!kv.cas("cas_key", None, b"value2").await.unwrap());
        assert!(kv.cas("cas_key", Some(b"value1"), b"value2").await.unwrap());
        assert_eq!(kv.get("cas_key").await.unwrap(), Some(b"value2".to_vec()));
    }

    #[tokio::test]
    #[ignore = "requires Valkey/Redis instance at 127.0.0.1:6379"]
    async fn cache_incr_on_missing_key_creates_nothing() {
        let cache = ValkeyCache::new(URL, namespace(), 5)
            .await
            .expect("Failed to connect to Valkey");

        assert_eq!(cache.incr("total/x", 1).await.unwrap(), None);
        assert_eq!(cache.decr("total/x", 1).await.unwrap(), None);
        assert!(cache.get("total/x").await.unwrap().is_none());

        cache
            .set("total/x", b"5", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(cache.incr("total/x", 2).await.unwrap(), Some(7));
        assert_eq!(cache.get("total/x").await.unwrap(), Some(b"7".to_vec()));

        let keys = vec!["total/x".to_string()];
        assert_eq!(cache.delete_multi(&keys).await.unwrap(), 1);
    }
}
