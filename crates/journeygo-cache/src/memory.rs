//! In-memory cache storage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{ensure_cacheable, Cache, CacheError, CacheStorage, CachedResponse, MatchOptions, RequestKey};

/// Monotonic sequence shared by stores and entries for insertion order.
fn next_seq() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A cache instance held in memory.
#[derive(Debug)]
pub struct MemoryCache {
    name: String,
    created: u64,
    entries: RwLock<HashMap<RequestKey, (u64, CachedResponse)>>,
}

impl MemoryCache {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created: next_seq(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: RequestKey, response: CachedResponse) -> Result<(), CacheError> {
        ensure_cacheable(&key)?;
        debug!(cache = %self.name, url = %key.url, status = response.status, "Cache put");
        self.entries.write().await.insert(key, (next_seq(), response));
        Ok(())
    }

    async fn match_request(
        &self,
        key: &RequestKey,
        options: MatchOptions,
    ) -> Result<Option<CachedResponse>, CacheError> {
        let entries = self.entries.read().await;

        if options == MatchOptions::default() {
            return Ok(entries.get(key).map(|(_, r)| r.clone()));
        }

        Ok(entries
            .iter()
            .filter(|(stored, _)| key.matches(stored, options))
            .min_by_key(|(_, (seq, _))| *seq)
            .map(|(_, (_, r))| r.clone()))
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool, CacheError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        let entries = self.entries.read().await;
        let mut keyed: Vec<_> = entries.iter().map(|(k, (seq, _))| (*seq, k.clone())).collect();
        keyed.sort_by_key(|(seq, _)| *seq);
        Ok(keyed.into_iter().map(|(_, k)| k).collect())
    }
}

/// Cache storage held in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(cache = %name, "Creating cache");
                Arc::new(MemoryCache::new(name))
            })
            .clone();
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let removed = self.caches.write().await.remove(name).is_some();
        if removed {
            debug!(cache = %name, "Deleted cache");
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let caches = self.caches.read().await;
        let mut names: Vec<_> = caches.values().map(|c| (c.created, c.name.clone())).collect();
        names.sort_by_key(|(created, _)| *created);
        Ok(names.into_iter().map(|(_, n)| n).collect())
    }
}
