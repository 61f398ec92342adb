use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::config::{ServerConfig, StorageMode};
use crate::docs_parser::DocumentationRecord;
use crate::error::DocError;
use crate::key::CacheKey;
use crate::storage::{DurableStore, StoredEntry};

/// Trait for a cache implementation.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the entry if present and unexpired. Expired entries are removed.
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry>;
    /// Inserts or overwrites an entry, evicting least-recently-used entries
    /// so the store never exceeds its capacity.
    async fn put(
        &self,
        key: CacheKey,
        value: Arc<DocumentationRecord>,
        size_hint: usize,
    ) -> CacheEntry;
    async fn contains_key(&self, key: &CacheKey) -> bool;
    /// Drops every expired entry and returns how many were removed.
    async fn purge_expired(&self) -> usize;
    async fn clear(&self);
    async fn stats(&self) -> CacheStats;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Arc<DocumentationRecord>,
    /// Milliseconds since the Unix epoch.
    pub inserted_at: u64,
    pub expires_at: u64,
    pub size_hint: usize,
}

impl CacheEntry {
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at
    }

    fn restored(stored: StoredEntry, ttl_ms: u64) -> Self {
        Self {
            key: stored.key,
            value: Arc::new(stored.record),
            inserted_at: stored.inserted_at,
            expires_at: stored.inserted_at.saturating_add(ttl_ms),
            size_hint: stored.size_hint,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub durable: bool,
}

struct Inner {
    entries: LruCache<CacheKey, CacheEntry>,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Inner {
    /// Inserts `entry` and returns the keys evicted to make room.
    fn insert(&mut self, entry: CacheEntry) -> Vec<CacheKey> {
        let mut evicted = Vec::new();
        if !self.entries.contains(&entry.key) {
            while self.entries.len() >= self.capacity {
                match self.entries.pop_lru() {
                    Some((key, _)) => evicted.push(key),
                    None => break,
                }
            }
        }
        self.entries.put(entry.key.clone(), entry);
        self.evictions += evicted.len() as u64;
        evicted
    }

    fn shrink_to_capacity(&mut self) -> Vec<CacheKey> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            match self.entries.pop_lru() {
                Some((key, _)) => evicted.push(key),
                None => break,
            }
        }
        self.evictions += evicted.len() as u64;
        evicted
    }
}

/// Entry-count bounded LRU store with TTL expiry and optional write-through
/// durable backing.
///
/// All access is serialized through one lock, which is also held across the
/// durable write for an operation so memory and disk never disagree about
/// which entries exist.
pub struct CacheStore {
    inner: Mutex<Inner>,
    ttl_ms: u64,
    durable: Option<DurableStore>,
    clock: Arc<dyn Clock>,
    startup_error: Option<DocError>,
}

impl CacheStore {
    /// Purely in-memory store, regardless of the configured storage mode.
    pub fn in_memory(config: &ServerConfig) -> Self {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(config: &ServerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                capacity: config.max_cache_entries.max(1),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            ttl_ms: config.cache_ttl_ms,
            durable: None,
            clock,
            startup_error: None,
        }
    }

    /// Opens the store for the configured storage mode.
    ///
    /// A durable file that cannot be opened or read is reported as
    /// [`DocError::CacheCorrupt`] and the store continues empty and in-memory.
    pub async fn open(config: &ServerConfig) -> Self {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(config: &ServerConfig, clock: Arc<dyn Clock>) -> Self {
        let mut store = Self::in_memory_with_clock(config, clock);
        let StorageMode::Durable(path) = &config.storage else {
            return store;
        };

        let opened = match DurableStore::open(path).await {
            Ok(durable) => durable.load_all().await.map(|loaded| (durable, loaded)),
            Err(e) => Err(e),
        };
        match opened {
            Ok((durable, loaded)) => {
                store.restore(&durable, loaded.entries).await;
                store.durable = Some(durable);
            }
            Err(e) => {
                let err = DocError::CacheCorrupt(format!("{}: {}", path.display(), e));
                tracing::error!("{}. Continuing with an empty in-memory cache.", err);
                store.startup_error = Some(err);
            }
        }
        store
    }

    async fn restore(&self, durable: &DurableStore, stored: Vec<StoredEntry>) {
        let now = self.clock.now_ms();
        let mut stale = Vec::new();
        let mut inner = self.inner.lock().await;
        for entry in stored {
            let entry = CacheEntry::restored(entry, self.ttl_ms);
            if entry.is_valid_at(now) {
                stale.extend(inner.insert(entry));
            } else {
                stale.push(entry.key);
            }
        }
        // Restoring is not an eviction in the runtime sense.
        inner.evictions = 0;
        tracing::info!(
            "Restored {} cached entries from {:?}",
            inner.entries.len(),
            durable.path()
        );
        if let Err(e) = durable.remove(stale).await {
            tracing::warn!("Failed to prune stale durable entries: {}", e);
        }
    }

    /// Error recorded while opening the durable backing, if any.
    pub fn startup_error(&self) -> Option<&DocError> {
        self.startup_error.as_ref()
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Keys from most to least recently used.
    pub async fn keys(&self) -> Vec<CacheKey> {
        self.inner.lock().await.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Changes the capacity, evicting least-recently-used entries until the
    /// store fits.
    pub async fn set_capacity(&self, capacity: usize) -> Vec<CacheKey> {
        let mut inner = self.inner.lock().await;
        inner.capacity = capacity.max(1);
        let evicted = inner.shrink_to_capacity();
        self.forget(evicted.clone()).await;
        evicted
    }

    async fn forget(&self, keys: Vec<CacheKey>) {
        if keys.is_empty() {
            return;
        }
        tracing::debug!("Evicting {} cache entries: {:?}", keys.len(), keys);
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.remove(keys).await {
                tracing::warn!("Failed to remove entries from durable cache: {}", e);
            }
        }
    }

    async fn read_through(&self, key: &CacheKey, now: u64) -> Option<CacheEntry> {
        let durable = self.durable.as_ref()?;
        match durable.read(key).await {
            Ok(Some(stored)) => {
                let entry = CacheEntry::restored(stored, self.ttl_ms);
                if entry.is_valid_at(now) {
                    Some(entry)
                } else {
                    self.forget(vec![entry.key]).await;
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Durable cache read for {} failed: {}", key, e);
                None
            }
        }
    }
}

#[async_trait]
impl Cache for CacheStore {
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        match inner.entries.peek(key).map(|entry| entry.is_valid_at(now)) {
            Some(true) => {
                inner.hits += 1;
                return inner.entries.get(key).cloned();
            }
            Some(false) => {
                inner.entries.pop(key);
                tracing::debug!("Cache entry for {} expired", key);
                self.forget(vec![key.clone()]).await;
            }
            None => {
                if let Some(entry) = self.read_through(key, now).await {
                    let evicted = inner.insert(entry.clone());
                    self.forget(evicted).await;
                    inner.hits += 1;
                    return Some(entry);
                }
            }
        }

        inner.misses += 1;
        None
    }

    async fn put(
        &self,
        key: CacheKey,
        value: Arc<DocumentationRecord>,
        size_hint: usize,
    ) -> CacheEntry {
        let now = self.clock.now_ms();
        let entry = CacheEntry {
            key,
            value,
            inserted_at: now,
            expires_at: now.saturating_add(self.ttl_ms),
            size_hint,
        };

        let mut inner = self.inner.lock().await;
        let evicted = inner.insert(entry.clone());
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.write(&entry).await {
                tracing::warn!("Failed to persist cache entry {}: {}", entry.key, e);
            }
        }
        self.forget(evicted).await;
        drop(inner);
        entry
    }

    async fn contains_key(&self, key: &CacheKey) -> bool {
        let now = self.clock.now_ms();
        self.inner
            .lock()
            .await
            .entries
            .peek(key)
            .is_some_and(|entry| entry.is_valid_at(now))
    }

    async fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_valid_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        let count = expired.len();
        self.forget(expired).await;
        count
    }

    async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.clear().await {
                tracing::warn!("Failed to clear durable cache: {}", e);
            }
        }
    }

    async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            entries: inner.entries.len(),
            capacity: inner.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            durable: self.durable.is_some(),
        }
    }
}
