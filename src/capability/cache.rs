//! Bounded memo of recent `(resource, permission) → bool` decisions.
//!
//! Recency is tracked with a logical clock rather than wall time so two
//! accesses in the same instant still have a strict order, and eviction
//! always picks exactly one least-recently-accessed entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Default number of decisions kept per context.
pub const DEFAULT_CACHE_SIZE: usize = 1024;

type CacheKey = (String, String);

/// Token and context that answered a cached positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBy {
    pub token_id: Uuid,
    pub context_id: Uuid,
}

/// A cached decision together with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedDecision {
    pub result: bool,
    pub resolved_by: Option<ResolvedBy>,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    result: bool,
    resolved_by: Option<ResolvedBy>,
    last_accessed: u64,
    /// A positive result backed by an expiring token stops being valid
    /// when that token expires.
    valid_until: Option<DateTime<Utc>>,
}

/// Hit/miss/eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    /// `last_accessed → key`, oldest first.
    recency: BTreeMap<u64, CacheKey>,
    clock: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.last_accessed);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            self.entries.remove(&key);
            self.stats.evictions += 1;
        }
    }
}

/// Per-context decision cache. All read-modify-write happens under one
/// mutex, so a context can be checked from several threads.
#[derive(Debug)]
pub struct CapabilityCache {
    max_size: usize,
    inner: Mutex<CacheInner>,
}

impl CapabilityCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Cached decision, refreshing its recency on hit.
    pub fn get(&self, resource: &str, permission: &str) -> Option<bool> {
        self.get_at(resource, permission, Utc::now())
    }

    pub fn get_at(&self, resource: &str, permission: &str, now: DateTime<Utc>) -> Option<bool> {
        self.lookup_at(resource, permission, now)
            .map(|decision| decision.result)
    }

    /// Like [`get_at`](Self::get_at), also returning who resolved the entry.
    pub fn lookup_at(
        &self,
        resource: &str,
        permission: &str,
        now: DateTime<Utc>,
    ) -> Option<CachedDecision> {
        let key = (resource.to_string(), permission.to_string());
        let mut inner = self.lock();

        let Some(entry) = inner.entries.get(&key).copied() else {
            inner.stats.misses += 1;
            return None;
        };
        if entry.valid_until.is_some_and(|until| now >= until) {
            inner.remove(&key);
            inner.stats.misses += 1;
            return None;
        }

        let stamp = inner.tick();
        inner.recency.remove(&entry.last_accessed);
        inner.recency.insert(stamp, key.clone());
        if let Some(slot) = inner.entries.get_mut(&key) {
            slot.last_accessed = stamp;
        }
        inner.stats.hits += 1;
        Some(CachedDecision {
            result: entry.result,
            resolved_by: entry.resolved_by,
        })
    }

    pub fn put(&self, resource: &str, permission: &str, result: bool) {
        self.put_until(resource, permission, result, None);
    }

    /// Stores a decision that must not be served at or after `valid_until`.
    pub fn put_until(
        &self,
        resource: &str,
        permission: &str,
        result: bool,
        valid_until: Option<DateTime<Utc>>,
    ) {
        self.put_resolved(resource, permission, result, valid_until, None);
    }

    /// Stores a decision along with the token and context that produced it.
    pub fn put_resolved(
        &self,
        resource: &str,
        permission: &str,
        result: bool,
        valid_until: Option<DateTime<Utc>>,
        resolved_by: Option<ResolvedBy>,
    ) {
        if self.max_size == 0 {
            return;
        }

        let key = (resource.to_string(), permission.to_string());
        let mut inner = self.lock();

        inner.remove(&key);
        while inner.entries.len() >= self.max_size {
            inner.evict_oldest();
        }

        let stamp = inner.tick();
        inner.recency.insert(stamp, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                result,
                resolved_by,
                last_accessed: stamp,
                valid_until,
            },
        );
    }

    /// Drops every entry. Called whenever a token is added to the owning
    /// context.
    pub fn invalidate_all(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.stats.invalidations += 1;
    }

    /// Presence test that does not count as an access.
    pub fn contains(&self, resource: &str, permission: &str) -> bool {
        self.lock()
            .entries
            .contains_key(&(resource.to_string(), permission.to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[test]
    fn test_get_put() {
        let cache = CapabilityCache::new(4);
        assert_eq!(cache.get("/a", "read"), None);
        cache.put("/a", "read", true);
        cache.put("/b", "read", false);
        assert_eq!(cache.get("/a", "read"), Some(true));
        assert_eq!(cache.get("/b", "read"), Some(false));
        assert_eq!(cache.get("/a", "write"), None);
    }

    #[test]
    fn test_eviction_removes_least_recently_accessed() {
        let cache = CapabilityCache::new(3);
        cache.put("/a", "read", true);
        cache.put("/b", "read", true);
        cache.put("/c", "read", true);

        // Touch /a so /b becomes the oldest
        assert_eq!(cache.get("/a", "read"), Some(true));

        cache.put("/d", "read", true);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains("/a", "read"));
        assert!(!cache.contains("/b", "read"));
        assert!(cache.contains("/c", "read"));
        assert!(cache.contains("/d", "read"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = CapabilityCache::new(2);
        cache.put("/a", "read", false);
        cache.put("/b", "read", true);
        cache.put("/a", "read", true);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("/a", "read"), Some(true));
    }

    #[test]
    fn test_invalidate_all() {
        let cache = CapabilityCache::new(8);
        cache.put("/a", "read", false);
        cache.put("/b", "write", true);
        cache.invalidate_all();
        assert!(cache.is_empty());
        assert_eq!(cache.get("/a", "read"), None);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_expiring_entry_is_dropped() {
        let cache = CapabilityCache::new(8);
        let until = Utc::now() + Duration::seconds(30);
        cache.put_until("/a", "read", true, Some(until));
        assert_eq!(cache.get_at("/a", "read", until - Duration::seconds(1)), Some(true));
        assert_eq!(cache.get_at("/a", "read", until), None);
        assert!(!cache.contains("/a", "read"));
    }

    #[test]
    fn test_lookup_returns_provenance() {
        let cache = CapabilityCache::new(4);
        let by = ResolvedBy {
            token_id: Uuid::new_v4(),
            context_id: Uuid::new_v4(),
        };
        cache.put_resolved("/a", "read", true, None, Some(by));
        cache.put("/b", "read", false);

        let hit = cache.lookup_at("/a", "read", Utc::now()).unwrap();
        assert!(hit.result);
        assert_eq!(hit.resolved_by, Some(by));
        assert_eq!(
            cache.lookup_at("/b", "read", Utc::now()),
            Some(CachedDecision {
                result: false,
                resolved_by: None
            })
        );
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = CapabilityCache::new(0);
        cache.put("/a", "read", true);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_miss_counters() {
        let cache = CapabilityCache::new(2);
        cache.get("/a", "read");
        cache.put("/a", "read", true);
        cache.get("/a", "read");
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(CapabilityCache::new(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let resource = format!("/r/{}", (t * 200 + i) % 40);
                        cache.put(&resource, "read", i % 2 == 0);
                        cache.get(&resource, "read");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 16);
    }
}
