use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use lru::LruCache;
use parking_lot::Mutex;
use crate::core::types::StoredRecord;

/// Parsed partition files, keyed by path, so repeated reads skip the JSON parse.
/// Writers refresh their entry before acknowledging, so hits are never stale.
/// A capacity of zero disables caching.
pub struct PartitionCache {
    pub cache: Option<Mutex<LruCache<PathBuf, Arc<Vec<StoredRecord>>>>>,
    pub size_limit: usize,
    pub hit_count: AtomicUsize,
    pub miss_count: AtomicUsize,
}

impl PartitionCache {
    pub fn new(size_limit: usize) -> Self {
        PartitionCache {
            cache: NonZeroUsize::new(size_limit).map(|cap| Mutex::new(LruCache::new(cap))),
            size_limit,
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Vec<StoredRecord>>> {
        let hit = self.cache.as_ref().and_then(|cache| cache.lock().get(path).cloned());
        if hit.is_some() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn put(&self, path: PathBuf, records: Arc<Vec<StoredRecord>>) {
        if let Some(cache) = &self.cache {
            cache.lock().put(path, records);
        }
    }

    pub fn invalidate(&self, path: &Path) {
        if let Some(cache) = &self.cache {
            cache.lock().pop(path);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            size: self.cache.as_ref().map_or(0, |cache| cache.lock().len()),
            capacity: self.size_limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_recent_partition_is_evicted() {
        let cache = PartitionCache::new(2);
        cache.put(PathBuf::from("a.json"), Arc::new(Vec::new()));
        cache.put(PathBuf::from("b.json"), Arc::new(Vec::new()));
        assert!(cache.get(Path::new("a.json")).is_some());
        cache.put(PathBuf::from("c.json"), Arc::new(Vec::new()));

        assert!(cache.get(Path::new("b.json")).is_none());
        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!((stats.hit_count, stats.miss_count), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn zero_capacity_never_hits() {
        let cache = PartitionCache::new(0);
        cache.put(PathBuf::from("a.json"), Arc::new(Vec::new()));
        assert!(cache.get(Path::new("a.json")).is_none());
        assert_eq!(cache.stats().size, 0);
    }
}
