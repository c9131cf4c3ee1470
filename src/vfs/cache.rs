//! In-process file cache
//!
//! LRU keyed by (app_id, path) and bounded by a byte budget rather than an
//! entry count. Entries larger than the whole budget are never admitted.

use bytes::Bytes;
use lru::LruCache;
use std::sync::Mutex;

/// A cached file: bytes plus the headers derived from them
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub bytes: Bytes,
    pub mime: String,
    pub etag: String,
}

/// Byte-budgeted LRU over cached files
pub struct FileCache {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: LruCache<(String, String), CachedFile>,
    budget: usize,
    used: usize,
    hits: u64,
    misses: u64,
}

/// Cache statistics for the system info endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub budget_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl FileCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                budget: budget_bytes.max(1),
                used: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, app_id: &str, path: &str) -> Option<CachedFile> {
        let mut inner = self.inner.lock().unwrap();
        let key = (app_id.to_string(), path.to_string());
        match inner.entries.get(&key) {
            Some(entry) => {
                let hit = entry.clone();
                inner.hits += 1;
                Some(hit)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, app_id: &str, path: &str, file: CachedFile) {
        let size = file.bytes.len();
        let mut inner = self.inner.lock().unwrap();
        if size > inner.budget {
            return;
        }
        let key = (app_id.to_string(), path.to_string());
        if let Some(old) = inner.entries.pop(&key) {
            inner.used -= old.bytes.len();
        }
        inner.used += size;
        inner.entries.put(key, file);
        while inner.used > inner.budget {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.used -= evicted.bytes.len(),
                None => break,
            }
        }
    }

    /// Drop one path. Called synchronously after the write commits so the
    /// cache never serves content older than an acknowledged write.
    pub fn invalidate(&self, app_id: &str, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        let key = (app_id.to_string(), path.to_string());
        if let Some(old) = inner.entries.pop(&key) {
            inner.used -= old.bytes.len();
        }
    }

    /// Drop everything belonging to one app (re-deploy, app deletion)
    pub fn invalidate_app(&self, app_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<(String, String)> = inner
            .entries
            .iter()
            .filter(|((a, _), _)| a == app_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(old) = inner.entries.pop(&key) {
                inner.used -= old.bytes.len();
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            entries: inner.entries.len(),
            used_bytes: inner.used,
            budget_bytes: inner.budget,
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(content: &str) -> CachedFile {
        CachedFile {
            bytes: Bytes::from(content.to_string()),
            mime: "text/plain".into(),
            etag: "etag".into(),
        }
    }

    #[test]
    fn byte_budget_evicts_lru() {
        let cache = FileCache::new(10);
        cache.insert("a", "/one", file("aaaa"));
        cache.insert("a", "/two", file("bbbb"));
        // 8 bytes used; inserting 4 more evicts /one (least recently used)
        cache.insert("a", "/three", file("cccc"));
        assert!(cache.get("a", "/one").is_none());
        assert!(cache.get("a", "/two").is_some());
        assert!(cache.get("a", "/three").is_some());
    }

    #[test]
    fn oversized_entries_not_admitted() {
        let cache = FileCache::new(4);
        cache.insert("a", "/big", file("toolarge"));
        assert!(cache.get("a", "/big").is_none());
    }

    #[test]
    fn invalidate_app_clears_only_that_app() {
        let cache = FileCache::new(100);
        cache.insert("a", "/x", file("1"));
        cache.insert("b", "/x", file("2"));
        cache.invalidate_app("a");
        assert!(cache.get("a", "/x").is_none());
        assert!(cache.get("b", "/x").is_some());
    }

    #[test]
    fn stats_track_usage() {
        let cache = FileCache::new(100);
        cache.insert("a", "/x", file("1234"));
        cache.get("a", "/x");
        cache.get("a", "/missing");
        let stats = cache.stats();
        assert_eq!(stats.used_bytes, 4);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
