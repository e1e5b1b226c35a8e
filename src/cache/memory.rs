//! Memory tier: a bounded LRU cache, the fast half of the Cache Manager.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use tokio::sync::Mutex;

use super::entry::{CacheEntry, TierStats};

const DEFAULT_MAX_SIZE: usize = 1_000;

struct Inner {
    cache: LruCache<String, CacheEntry<Value>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    created_at: Instant,
}

/// In-memory LRU tier. Assumed infallible per §4.1: no I/O, no error path.
pub struct MemoryTier {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl MemoryTier {
    pub fn new(max_size: usize) -> Self {
        let max_size = if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size };
        Self {
            inner: Mutex::new(Inner {
                cache: LruCache::new(NonZeroUsize::new(max_size).unwrap()),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                created_at: Instant::now(),
            }),
            max_size,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let expired = inner.cache.peek(key).is_some_and(|e| e.is_expired(now));
        if expired {
            inner.cache.pop(key);
            inner.misses += 1;
            inner.expirations += 1;
            return None;
        }
        let value = match inner.cache.get_mut(key) {
            Some(entry) => {
                entry.touch(now);
                Some(entry.value.clone())
            }
            None => None,
        };
        if value.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        value
    }

    pub async fn set(&self, key: String, value: Value, ttl: Option<Duration>) {
        let mut inner = self.inner.lock().await;
        let at_capacity = inner.cache.len() >= self.max_size && !inner.cache.contains(&key);
        if at_capacity {
            inner.cache.pop_lru();
            inner.evictions += 1;
        }
        inner.cache.put(key, CacheEntry::new(value, ttl));
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.inner.lock().await.cache.pop(key).is_some()
    }

    pub async fn exists(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.cache.peek(key) {
            Some(entry) if entry.is_expired(now) => {
                inner.cache.pop(key);
                inner.expirations += 1;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.cache.clear();
    }

    /// Scan for expired entries and remove them. Run periodically (default
    /// 60s) and also invoked lazily by `get`/`exists`.
    pub async fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = inner
            .cache
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let count = expired.len();
        for key in expired {
            inner.cache.pop(&key);
        }
        inner.expirations += count as u64;
        count
    }

    pub async fn stats(&self) -> TierStats {
        let inner = self.inner.lock().await;
        TierStats {
            tier: "memory",
            size: inner.cache.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            uptime_s: inner.created_at.elapsed().as_secs_f64(),
        }
    }
}
