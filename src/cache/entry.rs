//! Cache entry and per-tier statistics types.

use std::time::{Duration, Instant};

/// A single cached value plus the bookkeeping the eviction and expiry logic
/// needs, generic over the stored value type.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
    pub last_accessed_at: Instant,
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            expires_at: ttl.map(|d| now + d),
            last_accessed_at: now,
            access_count: 0,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_accessed_at = now;
        self.access_count += 1;
    }
}

/// Statistics reported per cache tier, matching §4.1's required fields.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TierStats {
    pub tier: &'static str,
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub uptime_s: f64,
}

impl TierStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
