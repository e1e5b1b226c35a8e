//! Disk tier: a bounded, durable cache rooted at a configurable directory.
//!
//! Layout matches §6: `{cache_dir}/metadata/{hash}.json` holds bookkeeping,
//! `{cache_dir}/data/{hash}.bin` holds the serialized value, and
//! `{cache_dir}/stats.json` persists counters across restarts. The entry
//! filename is the hex MD5 of the stringified key. All I/O errors are
//! logged and degrade to a miss or a best-effort write; none propagate.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use super::entry::TierStats;

const DEFAULT_MAX_SIZE: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    created_at: f64,
    expires_at: Option<f64>,
    last_accessed_at: f64,
    access_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedStats {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

fn now_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn key_hash(key: &str) -> String {
    format!("{:x}", md5::compute(key.as_bytes()))
}

pub struct DiskTier {
    dir: PathBuf,
    max_size: usize,
    stats: Mutex<PersistedStats>,
    started_at: std::time::Instant,
}

impl DiskTier {
    pub async fn new(dir: PathBuf, max_size: usize) -> Self {
        let max_size = if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size };
        let metadata_dir = dir.join("metadata");
        let data_dir = dir.join("data");
        if let Err(e) = tokio::fs::create_dir_all(&metadata_dir).await {
            warn!(error = %e, "failed to create cache metadata directory");
        }
        if let Err(e) = tokio::fs::create_dir_all(&data_dir).await {
            warn!(error = %e, "failed to create cache data directory");
        }
        let stats = Self::load_stats(&dir).await;
        Self {
            dir,
            max_size,
            stats: Mutex::new(stats),
            started_at: std::time::Instant::now(),
        }
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.dir.join("metadata").join(format!("{}.json", key_hash(key)))
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.dir.join("data").join(format!("{}.bin", key_hash(key)))
    }

    async fn load_stats(dir: &Path) -> PersistedStats {
        match tokio::fs::read_to_string(dir.join("stats.json")).await {
            Ok(s) => serde_json::from_str(&s).unwrap_or_default(),
            Err(_) => PersistedStats::default(),
        }
    }

    async fn save_stats(&self) {
        let stats = self.stats.lock().await.clone();
        if let Ok(s) = serde_json::to_string(&stats) {
            if let Err(e) = tokio::fs::write(self.dir.join("stats.json"), s).await {
                warn!(error = %e, "failed to persist cache stats.json");
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let meta = match self.read_meta(key).await {
            Some(m) => m,
            None => {
                self.stats.lock().await.misses += 1;
                return None;
            }
        };
        if meta.expires_at.is_some_and(|exp| now_f64() >= exp) {
            self.remove_files(key).await;
            let mut stats = self.stats.lock().await;
            stats.misses += 1;
            stats.expirations += 1;
            drop(stats);
            self.save_stats().await;
            return None;
        }
        match tokio::fs::read(self.data_path(key)).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    self.touch_meta(key, meta).await;
                    self.stats.lock().await.hits += 1;
                    Some(value)
                }
                Err(e) => {
                    warn!(error = %e, "corrupt cache data file");
                    self.stats.lock().await.misses += 1;
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "cache data file missing or unreadable");
                self.stats.lock().await.misses += 1;
                None
            }
        }
    }

    async fn read_meta(&self, key: &str) -> Option<EntryMeta> {
        let bytes = tokio::fs::read(self.metadata_path(key)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn touch_meta(&self, key: &str, mut meta: EntryMeta) {
        meta.last_accessed_at = now_f64();
        meta.access_count += 1;
        if let Ok(s) = serde_json::to_vec(&meta) {
            let _ = tokio::fs::write(self.metadata_path(key), s).await;
        }
    }

    pub async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) {
        if self.would_exceed_capacity(key).await {
            self.evict_lru().await;
        }
        let now = now_f64();
        let meta = EntryMeta {
            created_at: now,
            expires_at: ttl.map(|d| now + d.as_secs_f64()),
            last_accessed_at: now,
            access_count: 0,
        };
        let ok = match (serde_json::to_vec(&meta), serde_json::to_vec(value)) {
            (Ok(m), Ok(v)) => {
                let r1 = tokio::fs::write(self.metadata_path(key), m).await;
                let r2 = tokio::fs::write(self.data_path(key), v).await;
                r1.is_ok() && r2.is_ok()
            }
            _ => false,
        };
        if !ok {
            warn!(key, "best-effort disk cache write failed");
        }
    }

    async fn would_exceed_capacity(&self, key: &str) -> bool {
        if self.metadata_path(key).exists() {
            return false;
        }
        self.count_entries().await >= self.max_size
    }

    async fn count_entries(&self) -> usize {
        let mut count = 0;
        if let Ok(mut entries) = tokio::fs::read_dir(self.dir.join("metadata")).await {
            while let Ok(Some(_)) = entries.next_entry().await {
                count += 1;
            }
        }
        count
    }

    async fn evict_lru(&self) {
        let mut oldest: Option<(PathBuf, f64)> = None;
        if let Ok(mut entries) = tokio::fs::read_dir(self.dir.join("metadata")).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if let Ok(bytes) = tokio::fs::read(&path).await {
                    if let Ok(meta) = serde_json::from_slice::<EntryMeta>(&bytes) {
                        if oldest.as_ref().is_none_or(|(_, t)| meta.last_accessed_at < *t) {
                            oldest = Some((path, meta.last_accessed_at));
                        }
                    }
                }
            }
        }
        if let Some((meta_path, _)) = oldest {
            if let Some(stem) = meta_path.file_stem().and_then(|s| s.to_str()) {
                let data_path = self.dir.join("data").join(format!("{stem}.bin"));
                let _ = tokio::fs::remove_file(&meta_path).await;
                let _ = tokio::fs::remove_file(&data_path).await;
                self.stats.lock().await.evictions += 1;
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.remove_files(key).await
    }

    async fn remove_files(&self, key: &str) -> bool {
        let meta_removed = tokio::fs::remove_file(self.metadata_path(key)).await.is_ok();
        let _ = tokio::fs::remove_file(self.data_path(key)).await;
        meta_removed
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.read_meta(key).await {
            Some(meta) if meta.expires_at.is_some_and(|exp| now_f64() >= exp) => {
                self.remove_files(key).await;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub async fn clear(&self) {
        let _ = tokio::fs::remove_dir_all(self.dir.join("metadata")).await;
        let _ = tokio::fs::remove_dir_all(self.dir.join("data")).await;
        let _ = tokio::fs::create_dir_all(self.dir.join("metadata")).await;
        let _ = tokio::fs::create_dir_all(self.dir.join("data")).await;
    }

    pub async fn sweep_expired(&self) -> usize {
        let mut removed = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(self.dir.join("metadata")).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if let Ok(bytes) = tokio::fs::read(&path).await {
                    if let Ok(meta) = serde_json::from_slice::<EntryMeta>(&bytes) {
                        if meta.expires_at.is_some_and(|exp| now_f64() >= exp) {
                            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                                removed.push(stem.to_string());
                            }
                        }
                    }
                }
            }
        }
        let count = removed.len();
        for stem in removed {
            let _ = tokio::fs::remove_file(self.dir.join("metadata").join(format!("{stem}.json"))).await;
            let _ = tokio::fs::remove_file(self.dir.join("data").join(format!("{stem}.bin"))).await;
        }
        if count > 0 {
            self.stats.lock().await.expirations += count as u64;
            self.save_stats().await;
        }
        count
    }

    pub async fn stats(&self) -> TierStats {
        let persisted = self.stats.lock().await.clone();
        TierStats {
            tier: "disk",
            size: self.count_entries().await,
            max_size: self.max_size,
            hits: persisted.hits,
            misses: persisted.misses,
            evictions: persisted.evictions,
            expirations: persisted.expirations,
            uptime_s: self.started_at.elapsed().as_secs_f64(),
        }
    }
}
