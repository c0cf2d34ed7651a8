use std::{collections::HashMap, num::NonZeroUsize, time::SystemTime};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

pub const AUTO_INDEX_THRESHOLD: u32 = 5;

struct CacheEntry {
    records: Vec<Value>,
    /// File mtime observed when the entry was filled; an entry is stale once
    /// the file on disk is newer.
    mtime: Option<SystemTime>,
    hits: u64,
}

/// Bounded collection cache with least-recently-used eviction. Hits hand out
/// defensive clones so callers that mutate results cannot poison the cache.
pub struct CollectionCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
}

impl CollectionCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero cache capacity");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn fresh(&self, name: &str, current_mtime: Option<SystemTime>) -> Option<Vec<Value>> {
        let mut guard = self.inner.lock();
        let entry = guard.get_mut(name)?;
        let observed = entry.mtime?;
        let current = current_mtime?;
        if observed >= current {
            entry.hits += 1;
            Some(entry.records.clone())
        } else {
            None
        }
    }

    pub fn store(&self, name: &str, records: Vec<Value>, mtime: Option<SystemTime>) {
        let mut guard = self.inner.lock();
        guard.put(
            name.to_string(),
            CacheEntry {
                records,
                mtime,
                hits: 0,
            },
        );
    }

    pub fn remove(&self, name: &str) {
        self.inner.lock().pop(name);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().contains(name)
    }
}

/// Counts filter conditions per (collection, field). Once a field's count
/// crosses [`AUTO_INDEX_THRESHOLD`] the engine builds an index for it.
pub struct PatternTracker {
    counts: Mutex<HashMap<(String, String), u32>>,
}

impl PatternTracker {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(
        &self,
        collection: &str,
        fields: impl IntoIterator<Item = String>,
    ) -> Vec<String> {
        let mut guard = self.counts.lock();
        let mut hot = Vec::new();
        for field in fields {
            let count = guard
                .entry((collection.to_string(), field.clone()))
                .or_insert(0);
            *count += 1;
            if *count > AUTO_INDEX_THRESHOLD {
                hot.push(field);
            }
        }
        hot
    }

    pub fn forget_collection(&self, collection: &str) {
        self.counts
            .lock()
            .retain(|(owner, _), _| owner != collection);
    }

    pub fn clear(&self) {
        self.counts.lock().clear();
    }
}

impl Default for PatternTracker {
    fn default() -> Self {
        Self::new()
    }
}
