use std::collections::HashMap;
use std::time::{Duration, Instant};

/// In-memory byte cache for encoded media artifacts, keyed by
/// `contentId + quality + page`. Bounded LRU with a TTL: entries fall out
/// when the capacity is hit (oldest use first) or when they outlive the TTL.
pub(crate) struct ByteCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
    use_seq: u64,
}

struct CacheEntry {
    data: Vec<u8>,
    inserted: Instant,
    last_use: u64,
}

impl ByteCache {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            use_seq: 0,
        }
    }

    pub(crate) fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.inserted.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }

        self.use_seq += 1;
        let entry = self.entries.get_mut(key).unwrap();
        entry.last_use = self.use_seq;
        Some(entry.data.clone())
    }

    pub(crate) fn put(&mut self, key: &str, data: Vec<u8>) {
        self.use_seq += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(key) {
            self.evict_one();
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                data,
                inserted: Instant::now(),
                last_use: self.use_seq,
            },
        );
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_one(&mut self) {
        // Expired entries go first, else the least recently used.
        if let Some(key) = self
            .entries
            .iter()
            .find(|(_, e)| e.inserted.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&key);
            return;
        }
        if let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_use)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    #[test]
    fn test_lru_evicts_oldest_use() {
        let mut cache = ByteCache::new(2, Duration::from_secs(60));
        cache.put("a", vec![1]);
        cache.put("b", vec![2]);
        // Touch "a" so "b" is the eviction candidate.
        assert!(cache.get("a").is_some());
        cache.put("c", vec![3]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_ttl_expires_entries() {
        let mut cache = ByteCache::new(10, Duration::from_millis(0));
        cache.put("x", vec![9]);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("x").is_none());
    }

    #[test]
    fn test_overwrite_does_not_evict_neighbors() {
        let mut cache = ByteCache::new(2, Duration::from_secs(60));
        cache.put("a", vec![1]);
        cache.put("b", vec![2]);
        cache.put("a", vec![3]);
        assert_eq!(cache.get("a").unwrap(), vec![3]);
        assert!(cache.get("b").is_some());
    }
}
