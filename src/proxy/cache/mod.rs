//! In-memory single-flight response cache.
//!
//! The [`CacheRegistry`] maps resource keys to shared [`CacheEntry`] values.
//! The first request for a key creates the entry and becomes its producer;
//! every later request for the same key attaches to that entry and streams
//! from its buffer.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tracing::debug;

mod entry;
mod key;

pub use entry::{CacheEntry, EntryPhase, ReaderNotifier, ResponseStatus};
pub use key::ResourceKey;

#[derive(Clone, Default)]
pub struct CacheRegistry {
    entries: Arc<Mutex<HashMap<ResourceKey, Arc<CacheEntry>>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &ResourceKey) -> Option<Arc<CacheEntry>> {
        self.entries.lock().get(key).cloned()
    }

    /// Entry for a key that is known to be registered.
    pub fn get(&self, key: &ResourceKey) -> Result<Arc<CacheEntry>> {
        self.lookup(key)
            .ok_or_else(|| anyhow!("no cache entry registered for {key}"))
    }

    /// Return the entry for `key`, creating it when absent.
    ///
    /// Exactly one concurrent caller per key sees `created == true` and must
    /// start the upstream fetch. A registered entry that already qualifies
    /// for eviction is replaced rather than handed out.
    pub fn get_or_create(&self, key: &ResourceKey) -> (Arc<CacheEntry>, bool) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            if !existing.should_evict() {
                return (existing.clone(), false);
            }
            debug!(key = %key, "replacing failed cache entry");
            crate::metrics::record_cache_eviction();
        }
        let entry = Arc::new(CacheEntry::new());
        entries.insert(key.clone(), entry.clone());
        crate::metrics::set_cache_entries(entries.len());
        (entry, true)
    }

    /// Unconditionally drop `key`. Callers ensure no reader is attached.
    pub fn remove(&self, key: &ResourceKey) -> Option<Arc<CacheEntry>> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(key);
        crate::metrics::set_cache_entries(entries.len());
        removed
    }

    /// Drop `key` if it still maps to `entry` and that entry holds a failed,
    /// fully drained response.
    pub fn evict_if_failed(&self, key: &ResourceKey, entry: &Arc<CacheEntry>) -> bool {
        let mut entries = self.entries.lock();
        let matches = entries
            .get(key)
            .map(|current| Arc::ptr_eq(current, entry))
            .unwrap_or(false);
        if !matches || !entry.should_evict() {
            return false;
        }
        entries.remove(key);
        crate::metrics::set_cache_entries(entries.len());
        crate::metrics::record_cache_eviction();
        debug!(key = %key, status = ?entry.status(), "evicted failed cache entry");
        true
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
