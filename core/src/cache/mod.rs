//! LRU response cache, keyed by `METHOD:target` for cacheable `GET`
//! responses.
//!
//! Built directly on `lru::LruCache`, the same crate the teacher's
//! `service::lru::ConnectionLru` wraps for connection pooling, guarded
//! by a single `parking_lot::Mutex` instead of `ConnectionLru`'s
//! thread-local-per-reader split: `get` here mutates recency order on
//! every call, so there's no read-only path worth sharding by thread.
//! `ConnectionLru` only bounds by entry count (`pop_lru` once over
//! `size_capacity`); this cache extends that same pop-while-over-
//! budget loop with a second, byte-size budget.

use std::time::{SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use lru::LruCache;
use parking_lot::Mutex;

/// a single cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub last_accessed: u64,
    pub size: usize,
}

impl CacheEntry {
    pub fn new(status: u16, headers: HeaderMap, body: Vec<u8>) -> Self {
        let size = entry_size(&headers, &body);
        CacheEntry {
            status,
            headers,
            body,
            last_accessed: now_secs(),
            size,
        }
    }
}

fn entry_size(headers: &HeaderMap, body: &[u8]) -> usize {
    let header_bytes: usize = headers
        .iter()
        .map(|(k, v)| k.as_str().len() + v.len())
        .sum();
    body.len() + header_bytes
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct Inner {
    store: LruCache<String, CacheEntry>,
    current_size: usize,
    max_entries: usize,
    max_bytes: usize,
}

/// the shared LRU response cache.
pub struct Cache {
    inner: Mutex<Inner>,
}

impl Cache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Cache {
            inner: Mutex::new(Inner {
                store: LruCache::unbounded(),
                current_size: 0,
                max_entries: max_entries.max(1),
                max_bytes,
            }),
        }
    }

    /// the cache key for a request, or the empty string when the
    /// method isn't `GET` (an empty key disables caching for that
    /// request).
    pub fn make_key(method: &str, target: &str) -> String {
        if method.eq_ignore_ascii_case("GET") {
            format!("GET:{target}")
        } else {
            String::new()
        }
    }

    /// whether a response is eligible for the cache: `GET` and a 200
    /// status.
    pub fn is_cacheable(method: &str, status: u16) -> bool {
        method.eq_ignore_ascii_case("GET") && status == 200
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.store.get_mut(key)?;
        entry.last_accessed = now_secs();
        Some(entry.clone())
    }

    pub fn put(&self, key: String, mut entry: CacheEntry) {
        entry.last_accessed = now_secs();
        let mut inner = self.inner.lock();

        if let Some(old) = inner.store.pop(&key) {
            inner.current_size -= old.size;
        }

        while !inner.store.is_empty()
            && (inner.store.len() >= inner.max_entries
                || inner.current_size + entry.size > inner.max_bytes)
        {
            if let Some((_, evicted)) = inner.store.pop_lru() {
                inner.current_size -= evicted.size;
            } else {
                break;
            }
        }

        inner.current_size += entry.size;
        inner.store.put(key, entry);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.store.clear();
        inner.current_size = 0;
    }

    #[cfg(test)]
    fn current_size(&self) -> usize {
        self.inner.lock().current_size
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().store.len()
    }
}
