use bytes::Bytes;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::Mutex;

use crate::config::CacheConfig;
use crate::transport::Headers;

/// Cached representation of a GET response
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub etag: String,
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(etag: String, status: u16, headers: Headers, body: Bytes) -> Self {
        Self {
            etag,
            status,
            headers,
            body,
            stored_at: Utc::now(),
        }
    }

    /// Approximate memory held by the entry
    pub fn size(&self) -> usize {
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        self.body.len() + headers + self.etag.len()
    }
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    total_bytes: usize,
    stats: CacheStats,
}

impl CacheState {
    fn remove(&mut self, url: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(url)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size());
        Some(entry)
    }
}

/// Bounded cache of recently seen representations, keyed by URL.
///
/// Bounded both by entry count and by total size; the least recently used
/// entry is evicted until both bounds hold again.
pub struct ResponseCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    max_bytes: usize,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                stats: CacheStats::default(),
            }),
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
        }
    }

    pub async fn lookup(&self, url: &str) -> Option<CacheEntry> {
        let mut state = self.state.lock().await;
        match state.entries.get(url).cloned() {
            Some(entry) => {
                state.stats.hits += 1;
                tracing::debug!("Cache hit: {}", url);
                Some(entry)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    pub async fn store(&self, url: &str, entry: CacheEntry) {
        let mut state = self.state.lock().await;
        state.remove(url);

        let size = entry.size();
        if self.max_entries == 0 || size > self.max_bytes {
            tracing::debug!("Not caching {} ({} bytes)", url, size);
            return;
        }

        state.entries.put(url.to_string(), entry);
        state.total_bytes += size;

        while state.entries.len() > self.max_entries || state.total_bytes > self.max_bytes {
            match state.entries.pop_lru() {
                Some((evicted, old)) => {
                    state.total_bytes = state.total_bytes.saturating_sub(old.size());
                    state.stats.evictions += 1;
                    tracing::debug!("Evicted cached response: {}", evicted);
                }
                None => break,
            }
        }
    }

    pub async fn invalidate(&self, url: &str) {
        if self.state.lock().await.remove(url).is_some() {
            tracing::debug!("Invalidated cached response: {}", url);
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn total_bytes(&self) -> usize {
        self.state.lock().await.total_bytes
    }

    pub async fn stats(&self) -> CacheStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.total_bytes = 0;
    }

    /// Drop entries stored before `now - max_age`, returning how many were removed
    pub async fn evict_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.stored_at < cutoff)
            .map(|(url, _)| url.clone())
            .collect();
        for url in &stale {
            state.remove(url);
        }
        stale.len()
    }
}
