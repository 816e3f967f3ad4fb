//! Thread-safe TTL + LRU cache for DNS responses.
//!
//! Entries carry a response category so negative answers (RFC 2308) get
//! their own TTL caps. Expiry is checked on access; eviction is strict
//! LRU via a monotonic-tick order index.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// What kind of answer a cached response represents. Determines the TTL
/// cap applied on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCategory {
    Positive,
    Nxdomain,
    Nodata,
    Servfail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Hard cap on positive answer TTLs.
    #[serde(default = "default_max_positive_secs")]
    pub max_positive_ttl_secs: u64,
    /// Hard cap on NXDOMAIN / NODATA TTLs.
    #[serde(default = "default_max_negative_secs")]
    pub max_negative_ttl_secs: u64,
    /// TTL applied to cached SERVFAIL responses.
    #[serde(default = "default_servfail_secs")]
    pub servfail_ttl_secs: u64,
    /// Negative TTL used when the response carries no SOA MINIMUM.
    #[serde(default = "default_negative_secs")]
    pub default_negative_ttl_secs: u64,
    /// Whether NXDOMAIN / NODATA / SERVFAIL responses are cached at all.
    #[serde(default = "default_true")]
    pub negative_caching: bool,
}

fn default_max_positive_secs() -> u64 {
    24 * 60 * 60
}
fn default_max_negative_secs() -> u64 {
    60 * 60
}
fn default_servfail_secs() -> u64 {
    30
}
fn default_negative_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_positive_ttl_secs: default_max_positive_secs(),
            max_negative_ttl_secs: default_max_negative_secs(),
            servfail_ttl_secs: default_servfail_secs(),
            default_negative_ttl_secs: default_negative_secs(),
            negative_caching: default_true(),
        }
    }
}

struct Entry<V> {
    value: V,
    category: ResponseCategory,
    cached_at: Instant,
    expires_at: Instant,
    tick: u64,
}

struct Inner<K, V> {
    map: FxHashMap<K, Entry<V>>,
    // tick -> key, lowest tick is least recently used
    order: BTreeMap<u64, K>,
    next_tick: u64,
}

pub struct TtlLruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    config: CacheConfig,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlLruCache<K, V> {
    pub fn new(capacity: usize, config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
                order: BTreeMap::new(),
                next_tick: 0,
            }),
            capacity: capacity.max(1),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a key. Expired entries are removed and reported as misses;
    /// hits are promoted to most-recently-used and return the entry age.
    pub fn get(&self, key: &K) -> Option<(V, Duration, ResponseCategory)> {
        self.get_at(key, Instant::now())
    }

    /// Insert a value. The TTL is capped by category; non-positive TTLs
    /// and disabled-negative-caching inserts are dropped.
    pub fn set(&self, key: K, value: V, ttl: Duration, category: ResponseCategory) {
        self.set_at(key, value, ttl, category, Instant::now())
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.clear();
        inner.order.clear();
    }

    /// Drop every expired entry. Expiry is already enforced on access;
    /// this reclaims memory from entries nobody asks for again. Returns
    /// how many entries were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn effective_ttl(&self, ttl: Duration, category: ResponseCategory) -> Option<Duration> {
        let capped = match category {
            ResponseCategory::Positive => {
                ttl.min(Duration::from_secs(self.config.max_positive_ttl_secs))
            }
            ResponseCategory::Nxdomain | ResponseCategory::Nodata | ResponseCategory::Servfail => {
                if !self.config.negative_caching {
                    return None;
                }
                ttl.min(Duration::from_secs(self.config.max_negative_ttl_secs))
            }
        };
        if capped.is_zero() {
            None
        } else {
            Some(capped)
        }
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<(V, Duration, ResponseCategory)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.map.get(key)?;

        if now >= entry.expires_at {
            let tick = entry.tick;
            inner.map.remove(key);
            inner.order.remove(&tick);
            return None;
        }

        let value = entry.value.clone();
        let age = now.duration_since(entry.cached_at);
        let category = entry.category;
        let old_tick = entry.tick;

        let new_tick = inner.next_tick;
        inner.next_tick += 1;
        inner.order.remove(&old_tick);
        inner.order.insert(new_tick, key.clone());
        if let Some(entry) = inner.map.get_mut(key) {
            entry.tick = new_tick;
        }

        Some((value, age, category))
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.map.len();
        let expired_ticks: Vec<u64> = inner
            .map
            .values()
            .filter(|entry| now >= entry.expires_at)
            .map(|entry| entry.tick)
            .collect();
        for tick in expired_ticks {
            if let Some(key) = inner.order.remove(&tick) {
                inner.map.remove(&key);
            }
        }
        before - inner.map.len()
    }

    fn set_at(&self, key: K, value: V, ttl: Duration, category: ResponseCategory, now: Instant) {
        let Some(ttl) = self.effective_ttl(ttl, category) else {
            return;
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let tick = inner.next_tick;
        inner.next_tick += 1;

        if let Some(existing) = inner.map.get(&key) {
            let old_tick = existing.tick;
            inner.order.remove(&old_tick);
        }
        inner.order.insert(tick, key.clone());
        inner.map.insert(
            key,
            Entry {
                value,
                category,
                cached_at: now,
                expires_at: now + ttl,
                tick,
            },
        );

        while inner.map.len() > self.capacity {
            let Some((&oldest_tick, _)) = inner.order.iter().next() else {
                break;
            };
            if let Some(oldest_key) = inner.order.remove(&oldest_tick) {
                inner.map.remove(&oldest_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> TtlLruCache<String, Vec<u8>> {
        TtlLruCache::new(capacity, CacheConfig::default())
    }

    #[test]
    fn set_then_get_within_ttl() {
        let cache = cache(16);
        let now = Instant::now();
        cache.set_at(
            "a".into(),
            vec![1],
            Duration::from_secs(300),
            ResponseCategory::Positive,
            now,
        );

        let (value, age, category) = cache
            .get_at(&"a".into(), now + Duration::from_secs(120))
            .unwrap();
        assert_eq!(value, vec![1]);
        assert_eq!(age, Duration::from_secs(120));
        assert_eq!(category, ResponseCategory::Positive);
    }

    #[test]
    fn expired_entry_is_a_miss_and_removed() {
        let cache = cache(16);
        let now = Instant::now();
        cache.set_at(
            "a".into(),
            vec![1],
            Duration::from_secs(10),
            ResponseCategory::Positive,
            now,
        );

        assert!(cache
            .get_at(&"a".into(), now + Duration::from_secs(10))
            .is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn zero_ttl_not_stored() {
        let cache = cache(16);
        cache.set("a".into(), vec![1], Duration::ZERO, ResponseCategory::Positive);
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_eviction_drops_oldest() {
        let cache = cache(2);
        let now = Instant::now();
        let ttl = Duration::from_secs(300);
        cache.set_at("a".into(), vec![1], ttl, ResponseCategory::Positive, now);
        cache.set_at("b".into(), vec![2], ttl, ResponseCategory::Positive, now);
        cache.set_at("c".into(), vec![3], ttl, ResponseCategory::Positive, now);

        assert_eq!(cache.len(), 2);
        assert!(cache.get_at(&"a".into(), now).is_none());
        assert!(cache.get_at(&"b".into(), now).is_some());
        assert!(cache.get_at(&"c".into(), now).is_some());
    }

    #[test]
    fn get_promotes_entry() {
        let cache = cache(2);
        let now = Instant::now();
        let ttl = Duration::from_secs(300);
        cache.set_at("a".into(), vec![1], ttl, ResponseCategory::Positive, now);
        cache.set_at("b".into(), vec![2], ttl, ResponseCategory::Positive, now);

        // Touch "a" so "b" becomes the LRU victim.
        assert!(cache.get_at(&"a".into(), now).is_some());
        cache.set_at("c".into(), vec![3], ttl, ResponseCategory::Positive, now);

        assert!(cache.get_at(&"a".into(), now).is_some());
        assert!(cache.get_at(&"b".into(), now).is_none());
    }

    #[test]
    fn update_in_place_promotes() {
        let cache = cache(2);
        let now = Instant::now();
        let ttl = Duration::from_secs(300);
        cache.set_at("a".into(), vec![1], ttl, ResponseCategory::Positive, now);
        cache.set_at("b".into(), vec![2], ttl, ResponseCategory::Positive, now);
        cache.set_at("a".into(), vec![9], ttl, ResponseCategory::Positive, now);
        cache.set_at("c".into(), vec![3], ttl, ResponseCategory::Positive, now);

        let (value, _, _) = cache.get_at(&"a".into(), now).unwrap();
        assert_eq!(value, vec![9]);
        assert!(cache.get_at(&"b".into(), now).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn positive_ttl_capped() {
        let cache = cache(16);
        let now = Instant::now();
        cache.set_at(
            "a".into(),
            vec![1],
            Duration::from_secs(7 * 24 * 60 * 60),
            ResponseCategory::Positive,
            now,
        );
        // One second past the 24h cap must miss.
        assert!(cache
            .get_at(&"a".into(), now + Duration::from_secs(24 * 60 * 60))
            .is_none());
    }

    #[test]
    fn negative_ttl_capped() {
        let cache = cache(16);
        let now = Instant::now();
        cache.set_at(
            "a".into(),
            vec![1],
            Duration::from_secs(24 * 60 * 60),
            ResponseCategory::Nxdomain,
            now,
        );
        assert!(cache
            .get_at(&"a".into(), now + Duration::from_secs(60 * 60))
            .is_none());
        assert!(cache
            .get_at(&"a".into(), now + Duration::from_secs(60 * 60 - 1))
            .is_some());
    }

    #[test]
    fn purge_removes_only_expired_entries() {
        let cache = cache(16);
        let now = Instant::now();
        cache.set_at(
            "short".into(),
            vec![1],
            Duration::from_secs(10),
            ResponseCategory::Positive,
            now,
        );
        cache.set_at(
            "long".into(),
            vec![2],
            Duration::from_secs(600),
            ResponseCategory::Positive,
            now,
        );

        assert_eq!(cache.purge_expired_at(now + Duration::from_secs(60)), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache
            .get_at(&"long".into(), now + Duration::from_secs(60))
            .is_some());
    }

    #[test]
    fn negative_caching_disabled_drops_all_negative_categories() {
        let config = CacheConfig {
            negative_caching: false,
            ..Default::default()
        };
        let cache: TtlLruCache<String, Vec<u8>> = TtlLruCache::new(16, config);
        for category in [
            ResponseCategory::Nxdomain,
            ResponseCategory::Nodata,
            ResponseCategory::Servfail,
        ] {
            cache.set("a".into(), vec![1], Duration::from_secs(60), category);
        }
        assert!(cache.is_empty());

        cache.set(
            "a".into(),
            vec![1],
            Duration::from_secs(60),
            ResponseCategory::Positive,
        );
        assert_eq!(cache.len(), 1);
    }
}
