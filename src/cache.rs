use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::pipeline::instant_after;

// ============================================================
// Data Structures
// ============================================================

/// Fixed-capacity, TTL-aware cache with LRU eviction.
///
/// Keys are spread over independently locked LRU shards, so lookups for
/// different keys rarely contend. Capacity is global: when the cache is full
/// the least recently used entry across all shards is evicted, whichever
/// shard it lives in.
pub struct KeyedCache<V> {
    shards: Vec<Mutex<LruCache<String, Entry<V>>>>,
    capacity: usize,
    len: AtomicUsize,
    // monotonically increasing use counter shared by all shards
    clock: AtomicU64,
    ttl: Duration,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
    last_used: u64,
}

const MAX_SHARDS: usize = 16;

// ============================================================
// KeyedCache Core Logic
// ============================================================

impl<V: Clone> KeyedCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        let shard_count = capacity.min(MAX_SHARDS);

        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(LruCache::unbounded()))
                .collect(),
            capacity,
            len: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Look up an unexpired value, refreshing its recency. An expired entry
    /// found on the way is removed.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let mut shard = self.shard(key);

        match shard.get_mut(key) {
            None => return None,
            Some(entry) if entry.expires_at > now => {
                entry.last_used = self.tick();
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }

        if shard.pop(key).is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        None
    }

    pub fn insert(&self, key: &str, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn insert_at(&self, key: &str, value: V, now: Instant) {
        self.insert_with_expiry(key, value, instant_after(now, self.ttl));
    }

    /// Insert with an explicit expiry, used when restoring persisted entries
    pub fn insert_with_expiry(&self, key: &str, value: V, expires_at: Instant) {
        let entry = Entry {
            value,
            expires_at,
            last_used: self.tick(),
        };
        {
            // counted under the shard lock so a concurrent clear never underflows
            let mut shard = self.shard(key);
            if shard.put(key.to_string(), entry).is_none() {
                self.len.fetch_add(1, Ordering::Relaxed);
            }
        }

        while self.len.load(Ordering::Relaxed) > self.capacity {
            if !self.evict_least_recent() {
                break;
            }
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let entry = self.shard(key).pop(key)?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(entry.value)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for index in 0..self.shards.len() {
            let mut shard = self.lock(index);
            let expired: Vec<String> = shard
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                if shard.pop(&key).is_some() {
                    removed += 1;
                }
            }
        }
        self.len.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    /// Unexpired entries with their expiry, in no particular order
    pub fn entries(&self, now: Instant) -> Vec<(String, V, Instant)> {
        let mut out = Vec::new();
        for index in 0..self.shards.len() {
            let shard = self.lock(index);
            out.extend(
                shard
                    .iter()
                    .filter(|(_, entry)| entry.expires_at > now)
                    .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.expires_at)),
            );
        }
        out
    }

    pub fn len(&self) -> usize {
        (0..self.shards.len())
            .map(|index| self.lock(index).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for index in 0..self.shards.len() {
            let mut shard = self.lock(index);
            self.len.fetch_sub(shard.len(), Ordering::Relaxed);
            shard.clear();
        }
    }

    /// Evict the globally least recently used entry. Only one shard lock is
    /// held at a time; a concurrent lookup may refresh the chosen victim, in
    /// which case that shard's new oldest entry goes instead.
    fn evict_least_recent(&self) -> bool {
        let mut oldest: Option<(u64, usize)> = None;
        for index in 0..self.shards.len() {
            let candidate = self.lock(index).peek_lru().map(|(_, entry)| entry.last_used);
            if let Some(last_used) = candidate {
                if oldest.map_or(true, |(current, _)| last_used < current) {
                    oldest = Some((last_used, index));
                }
            }
        }

        let Some((_, index)) = oldest else {
            return false;
        };
        let evicted = self.lock(index).pop_lru().is_some();
        if evicted {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        evicted
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn shard(&self, key: &str) -> MutexGuard<'_, LruCache<String, Entry<V>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.lock(index)
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, LruCache<String, Entry<V>>> {
        // a panic while holding a shard leaves it structurally valid
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_inserted_value() {
        let cache = KeyedCache::new(8, Duration::from_secs(60));
        cache.insert("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_expired_entries_are_not_returned() {
        let cache = KeyedCache::new(8, Duration::from_secs(10));
        let now = Instant::now();
        cache.insert_at("a", "x".to_string(), now);

        assert_eq!(cache.get_at("a", now + Duration::from_secs(5)), Some("x".to_string()));
        assert_eq!(cache.get_at("a", now + Duration::from_secs(10)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_at_capacity_one() {
        let cache = KeyedCache::new(1, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_recently_used_entry_survives_eviction() {
        let cache = KeyedCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_fills_to_capacity_before_evicting() {
        let cache = KeyedCache::new(16, Duration::from_secs(60));
        for i in 0..16 {
            cache.insert(&format!("key-{}", i), i);
        }
        assert_eq!(cache.len(), 16);

        cache.insert("key-16", 16);
        assert_eq!(cache.len(), 16);
        // the oldest entry goes, wherever its shard is
        assert_eq!(cache.get("key-0"), None);
        assert_eq!(cache.get("key-1"), Some(1));
        assert_eq!(cache.get("key-16"), Some(16));
    }

    #[test]
    fn test_capacity_is_exact() {
        let cache = KeyedCache::new(1000, Duration::from_secs(60));
        for i in 0..5000 {
            cache.insert(&format!("key-{}", i), i);
        }
        assert_eq!(cache.capacity(), 1000);
        assert_eq!(cache.len(), 1000);
        assert_eq!(cache.get("key-4999"), Some(4999));
    }

    #[test]
    fn test_replacing_a_key_keeps_length() {
        let cache = KeyedCache::new(4, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.remove("a"), Some(2));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let cache = KeyedCache::new(4, Duration::from_secs(u64::MAX));
        let now = Instant::now();
        cache.insert_at("a", 1, now);
        assert_eq!(cache.get_at("a", now + Duration::from_secs(3600)), Some(1));
    }

    #[test]
    fn test_purge_expired() {
        let cache = KeyedCache::new(16, Duration::from_secs(10));
        let now = Instant::now();
        cache.insert_at("old", 1, now);
        cache.insert_with_expiry("new", 2, now + Duration::from_secs(100));

        assert_eq!(cache.purge_expired(now + Duration::from_secs(20)), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries(now).len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        cache.insert("again", 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_inserts() {
        let cache = std::sync::Arc::new(KeyedCache::new(1024, Duration::from_secs(60)));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.insert(&format!("{}-{}", t, i), i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
    }

    #[test]
    fn test_concurrent_inserts_respect_capacity() {
        let cache = std::sync::Arc::new(KeyedCache::new(64, Duration::from_secs(60)));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        cache.insert(&format!("{}-{}", t, i), i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // racing evictions may leave it slightly under, never over
        assert!(cache.len() <= 64);
        assert!(cache.len() >= 60);
    }
}
