// =============================================================================
// Multi-Tier Cache — L1 (hot, capped) / L2 (TTL-only) / L3 (external, no-op)
// =============================================================================
//
// Lookup order L1 -> L2 -> L3. An L2/L3 hit promotes the entry upward with
// a refreshed timestamp. L1 evicts the least-recently-accessed live entry on
// overflow via a recency queue, mirroring the ring-trim-on-insert idiom used
// for candle buffers. Every tier honors TTL on access.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::types::Timeframe;

const L1_CAPACITY: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl CacheKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: DateTime<Utc>,
    ttl_ms: i64,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.inserted_at).num_milliseconds() > self.ttl_ms
    }
}

/// A pluggable remote/disk-backed tier. The spec allows L3 to be a no-op;
/// `NoopExternalTier` is the default implementor.
pub trait ExternalCacheTier: Send + Sync {
    fn get(&self, _key: &CacheKey) -> Option<Value> {
        None
    }
    fn put(&self, _key: &CacheKey, _value: &Value) {}
    fn invalidate(&self, _key: &CacheKey) {}
}

pub struct NoopExternalTier;

impl ExternalCacheTier for NoopExternalTier {}

#[derive(Debug, Default, Clone, Copy)]
pub struct TierStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub l1: TierStats,
    pub l2: TierStats,
}

struct Tier {
    entries: HashMap<CacheKey, CacheEntry>,
    recency: VecDeque<CacheKey>,
    capacity: Option<usize>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Tier {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            recency: VecDeque::new(),
            capacity,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn touch(&mut self, key: &CacheKey) {
        if self.capacity.is_none() {
            return;
        }
        self.recency.push_back(key.clone());
    }

    fn get(&mut self, key: &CacheKey, now: DateTime<Utc>) -> Option<Value> {
        match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                self.entries.remove(key);
                self.misses += 1;
                None
            }
            Some(entry) => {
                let value = entry.value.clone();
                self.touch(key);
                self.hits += 1;
                Some(value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn put(&mut self, key: CacheKey, value: Value, ttl_ms: i64, now: DateTime<Utc>) {
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                inserted_at: now,
                ttl_ms,
            },
        );
        self.touch(&key);
        self.evict_if_needed();
    }

    fn invalidate(&mut self, key: &CacheKey) {
        self.entries.remove(key);
    }

    fn evict_if_needed(&mut self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        while self.entries.len() > capacity {
            // Lazily reconcile: the front of the recency queue may point at
            // a key that was already evicted or re-touched since; skip
            // stale entries until we find one that is still the oldest
            // live touch for its key.
            let Some(candidate) = self.recency.pop_front() else {
                break;
            };
            if !self.entries.contains_key(&candidate) {
                continue;
            }
            let still_oldest = self.recency.iter().rposition(|k| k == &candidate).is_none();
            if !still_oldest {
                continue;
            }
            self.entries.remove(&candidate);
            self.evictions += 1;
        }
    }

    fn stats(&self) -> TierStats {
        TierStats {
            size: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

pub struct MultiTierCache {
    l1: RwLock<Tier>,
    l2: RwLock<Tier>,
    l3: Box<dyn ExternalCacheTier>,
}

impl MultiTierCache {
    pub fn new() -> Self {
        Self::with_external(Box::new(NoopExternalTier))
    }

    pub fn with_external(l3: Box<dyn ExternalCacheTier>) -> Self {
        Self {
            l1: RwLock::new(Tier::new(Some(L1_CAPACITY))),
            l2: RwLock::new(Tier::new(None)),
            l3,
        }
    }

    /// Look up a key across L1 -> L2 -> L3, promoting on an L2/L3 hit.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = Utc::now();

        if let Some(value) = self.l1.write().get(key, now) {
            return Some(value);
        }

        if let Some(value) = self.l2.write().get(key, now) {
            self.l1
                .write()
                .put(key.clone(), value.clone(), key.timeframe.l1_retention_ms(), now);
            return Some(value);
        }

        if let Some(value) = self.l3.get(key) {
            self.l1
                .write()
                .put(key.clone(), value.clone(), key.timeframe.l1_retention_ms(), now);
            self.l2
                .write()
                .put(key.clone(), value.clone(), key.timeframe.l2_retention_ms(), now);
            return Some(value);
        }

        None
    }

    /// Write through to every tier whose retention policy covers the key's
    /// timeframe. An explicit `ttl_override_ms` replaces the L1 retention
    /// derived from the timeframe; L2/L3 retention is unaffected.
    pub fn put(&self, key: CacheKey, value: Value, ttl_override_ms: Option<i64>) {
        let now = Utc::now();
        let l1_ttl = ttl_override_ms.unwrap_or_else(|| key.timeframe.l1_retention_ms());

        self.l1.write().put(key.clone(), value.clone(), l1_ttl, now);
        self.l2
            .write()
            .put(key.clone(), value.clone(), key.timeframe.l2_retention_ms(), now);
        self.l3.put(&key, &value);
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.l1.write().invalidate(key);
        self.l2.write().invalidate(key);
        self.l3.invalidate(key);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1: self.l1.read().stats(),
            l2: self.l2.read().stats(),
        }
    }
}

impl Default for MultiTierCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(symbol: &str) -> CacheKey {
        CacheKey::new(symbol, Timeframe::M1)
    }

    #[test]
    fn miss_on_empty_cache() {
        let cache = MultiTierCache::new();
        assert!(cache.get(&key("BTCUSDT")).is_none());
    }

    #[test]
    fn put_then_get_hits_l1() {
        let cache = MultiTierCache::new();
        cache.put(key("BTCUSDT"), json!({"price": 100.0}), None);
        let value = cache.get(&key("BTCUSDT")).unwrap();
        assert_eq!(value["price"], 100.0);
        assert_eq!(cache.stats().l1.hits, 1);
    }

    #[test]
    fn expired_l1_entry_is_treated_as_miss() {
        let cache = MultiTierCache::new();
        cache.put(key("BTCUSDT"), json!({"price": 1.0}), Some(-1));
        assert!(cache.get(&key("BTCUSDT")).is_none());
    }

    #[test]
    fn invalidate_removes_from_all_tiers() {
        let cache = MultiTierCache::new();
        cache.put(key("BTCUSDT"), json!({"price": 1.0}), None);
        cache.invalidate(&key("BTCUSDT"));
        assert!(cache.get(&key("BTCUSDT")).is_none());
    }

    #[test]
    fn l1_eviction_respects_capacity() {
        let cache = MultiTierCache {
            l1: RwLock::new(Tier::new(Some(2))),
            l2: RwLock::new(Tier::new(None)),
            l3: Box::new(NoopExternalTier),
        };
        cache.put(key("A"), json!(1), None);
        cache.put(key("B"), json!(2), None);
        cache.put(key("C"), json!(2), None);
        assert!(cache.l1.read().entries.len() <= 2);
    }
}
