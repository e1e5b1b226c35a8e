//! Cache Manager (C1): a two-tier, tag-invalidating, TTL-aware cache.

pub mod disk;
pub mod entry;
pub mod memory;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use disk::DiskTier;
use entry::TierStats;
use memory::MemoryTier;

const STRIPE_COUNT: usize = 32;
const MEMORY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DISK_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Configuration for constructing a [`CacheManager`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub memory_max_size: usize,
    pub disk_max_size: usize,
    pub disk_dir: Option<PathBuf>,
    pub use_disk: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_size: 1_000,
            disk_max_size: 10_000,
            disk_dir: None,
            use_disk: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory: TierStatsOut,
    pub disk: Option<TierStatsOut>,
    pub invalidation_tags: usize,
    pub tagged_keys: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStatsOut {
    pub tier: &'static str,
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub uptime_s: f64,
}

impl From<TierStats> for TierStatsOut {
    fn from(s: TierStats) -> Self {
        let hit_rate = s.hit_rate();
        Self {
            tier: s.tier,
            size: s.size,
            max_size: s.max_size,
            hits: s.hits,
            misses: s.misses,
            hit_rate,
            evictions: s.evictions,
            expirations: s.expirations,
            uptime_s: s.uptime_s,
        }
    }
}

struct TagIndex {
    key_to_tags: HashMap<String, HashSet<String>>,
    tag_to_keys: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    fn new() -> Self {
        Self {
            key_to_tags: HashMap::new(),
            tag_to_keys: HashMap::new(),
        }
    }

    fn add(&mut self, key: &str, tags: &[String]) {
        if tags.is_empty() {
            return;
        }
        let entry = self.key_to_tags.entry(key.to_string()).or_default();
        for tag in tags {
            entry.insert(tag.clone());
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn remove_key(&mut self, key: &str) {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(&tag);
                }
            }
        }
    }

    fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        self.tag_to_keys.get(tag).cloned().unwrap_or_default()
    }
}

fn stripe_index(key: &str) -> usize {
    let mut hash: u64 = 1469598103934665603;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    (hash as usize) % STRIPE_COUNT
}

/// Two-tier concurrent cache with tag-based bulk invalidation.
///
/// Per-key operations (promotion on a disk hit racing a concurrent delete)
/// are serialized through a fixed stripe of mutexes indexed by `hash(key)`,
/// so a promotion can never resurrect a key a concurrent `delete` just
/// removed.
pub struct CacheManager {
    memory: MemoryTier,
    disk: Option<DiskTier>,
    tags: Mutex<TagIndex>,
    stripes: Vec<Mutex<()>>,
}

impl CacheManager {
    pub async fn new(config: CacheConfig) -> Self {
        let memory = MemoryTier::new(config.memory_max_size);
        let disk = if config.use_disk {
            let dir = config.disk_dir.unwrap_or_else(default_cache_dir);
            Some(DiskTier::new(dir, config.disk_max_size).await)
        } else {
            None
        };
        Self {
            memory,
            disk,
            tags: Mutex::new(TagIndex::new()),
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Spawn the periodic sweep tasks. Cancelled cooperatively on `cancel`.
    pub fn spawn_sweeps(self: &Arc<Self>, cancel: CancellationToken) {
        let this = Arc::clone(self);
        let memory_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MEMORY_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let n = this.memory.sweep_expired().await;
                        if n > 0 {
                            tracing::debug!(removed = n, "memory cache sweep");
                        }
                    }
                    _ = memory_cancel.cancelled() => break,
                }
            }
        });
        if self.disk.is_some() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(DISK_SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Some(disk) = &this.disk {
                                let n = disk.sweep_expired().await;
                                if n > 0 {
                                    tracing::debug!(removed = n, "disk cache sweep");
                                }
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }
    }

    async fn with_stripe<F, R>(&self, key: &str, f: F) -> R
    where
        F: Future<Output = R>,
    {
        let _guard = self.stripes[stripe_index(key)].lock().await;
        f.await
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.with_stripe(key, async {
            if let Some(value) = self.memory.get(key).await {
                return Some(value);
            }
            if let Some(disk) = &self.disk {
                if let Some(value) = disk.get(key).await {
                    self.memory.set(key.to_string(), value.clone(), None).await;
                    return Some(value);
                }
            }
            None
        })
        .await
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>, tags: &[String]) {
        self.with_stripe(key, async {
            self.memory.set(key.to_string(), value.clone(), ttl).await;
            if let Some(disk) = &self.disk {
                disk.set(key, &value, ttl).await;
            }
            if !tags.is_empty() {
                self.tags.lock().await.add(key, tags);
            }
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.with_stripe(key, async {
            let memory_removed = self.memory.delete(key).await;
            let disk_removed = if let Some(disk) = &self.disk {
                disk.delete(key).await
            } else {
                true
            };
            self.tags.lock().await.remove_key(key);
            memory_removed || disk_removed
        })
        .await
    }

    pub async fn exists(&self, key: &str) -> bool {
        if self.memory.exists(key).await {
            return true;
        }
        if let Some(disk) = &self.disk {
            return disk.exists(key).await;
        }
        false
    }

    pub async fn clear(&self) {
        self.memory.clear().await;
        if let Some(disk) = &self.disk {
            disk.clear().await;
        }
        let mut tags = self.tags.lock().await;
        tags.key_to_tags.clear();
        tags.tag_to_keys.clear();
    }

    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        let keys = self.tags.lock().await.keys_for_tag(tag);
        let mut count = 0;
        for key in keys {
            if self.delete(&key).await {
                count += 1;
            }
        }
        self.tags.lock().await.tag_to_keys.remove(tag);
        count
    }

    pub async fn invalidate_tags(&self, tags: &[String]) -> usize {
        let mut keys = HashSet::new();
        {
            let index = self.tags.lock().await;
            for tag in tags {
                keys.extend(index.keys_for_tag(tag));
            }
        }
        let mut count = 0;
        for key in keys {
            if self.delete(&key).await {
                count += 1;
            }
        }
        let mut index = self.tags.lock().await;
        for tag in tags {
            index.tag_to_keys.remove(tag);
        }
        count
    }

    /// Memoize-through: return the cached value, or compute it via `compute`
    /// and store it under `key` with the given TTL/tags.
    pub async fn cached<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        tags: &[String],
        compute: F,
    ) -> Value
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Value>,
    {
        if let Some(value) = self.get(key).await {
            return value;
        }
        let value = compute().await;
        self.set(key, value.clone(), ttl, tags).await;
        value
    }

    pub async fn stats(&self) -> CacheStats {
        let tags = self.tags.lock().await;
        CacheStats {
            memory: self.memory.stats().await.into(),
            disk: match &self.disk {
                Some(disk) => Some(disk.stats().await.into()),
                None => None,
            },
            invalidation_tags: tags.tag_to_keys.len(),
            tagged_keys: tags.key_to_tags.len(),
        }
    }
}

pub fn default_cache_dir() -> PathBuf {
    dirs_cache_dir().join("mcp-router").join("cache")
}

fn dirs_cache_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
        .unwrap_or_else(|| PathBuf::from(".cache"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> CacheManager {
        let dir = tempfile::tempdir().unwrap();
        CacheManager::new(CacheConfig {
            memory_max_size: 10,
            disk_max_size: 10,
            disk_dir: Some(dir.path().to_path_buf()),
            use_disk: true,
        })
        .await
    }

    #[tokio::test]
    async fn coherence_after_two_sets() {
        let cache = manager().await;
        cache.set("k", Value::from(1), None, &[]).await;
        cache.set("k", Value::from(2), None, &[]).await;
        assert_eq!(cache.get("k").await, Some(Value::from(2)));
    }

    #[tokio::test]
    async fn tag_invalidation_removes_all_tagged_entries() {
        let cache = manager().await;
        cache
            .set("a", Value::from(1), None, &["t".to_string()])
            .await;
        cache
            .set("b", Value::from(2), None, &["t".to_string()])
            .await;
        let count = cache.invalidate_tag("t").await;
        assert_eq!(count, 2);
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test]
    async fn ttl_expiry_eventually_removes_entry() {
        let cache = manager().await;
        cache
            .set("k", Value::from(1), Some(Duration::from_millis(1)), &[])
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn cached_computes_once_on_miss() {
        let cache = manager().await;
        let value = cache
            .cached("k", None, &[], || async { Value::from(7) })
            .await;
        assert_eq!(value, Value::from(7));
        let second = cache
            .cached("k", None, &[], || async { Value::from(99) })
            .await;
        assert_eq!(second, Value::from(7));
    }

    #[tokio::test]
    async fn stats_report_memory_and_disk() {
        let cache = manager().await;
        cache.set("k", Value::from(1), None, &[]).await;
        cache.get("k").await;
        let stats = cache.stats().await;
        assert!(stats.disk.is_some());
        assert_eq!(stats.memory.hits, 1);
    }
}
