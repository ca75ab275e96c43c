//! Bounded content cache for preloaded assets and API responses.
//!
//! Entries live in memory and the whole map is written through to a single
//! storage key after every mutation. When full, an insert evicts exactly one
//! entry: the lowest-importance priority first, then the oldest. Reads never
//! refresh recency.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::models::{CacheEntry, Priority};
use crate::storage::KeyValueStore;

/// Storage key holding the serialized cache map.
pub const CACHE_STORAGE_KEY: &str = "appCache";

/// Written into every entry; bump when payload formats change.
pub const CACHE_VERSION: &str = "1.0";

pub const DEFAULT_CACHE_MAX_ITEMS: usize = 1000;

pub const DEFAULT_CACHE_MAX_AGE_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_items: usize,
    pub max_age: Duration,
    pub storage_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_CACHE_MAX_ITEMS,
            max_age: Duration::days(DEFAULT_CACHE_MAX_AGE_DAYS),
            storage_key: CACHE_STORAGE_KEY.to_string(),
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: BTreeMap<String, CacheEntry>,
    next_seq: u64,
}

pub struct ContentCache {
    backend: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    state: Mutex<CacheState>,
    size: watch::Sender<usize>,
}

impl ContentCache {
    /// Open the cache, loading any persisted map. A map that fails to decode
    /// is discarded and the cache starts empty.
    pub fn new(backend: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        let entries = load_entries(backend.as_ref(), &config.storage_key);
        let next_seq = entries.values().map(|e| e.seq + 1).max().unwrap_or(0);
        let (size, _) = watch::channel(entries.len());

        let cache = Self {
            backend,
            clock,
            config,
            state: Mutex::new(CacheState { entries, next_seq }),
            size,
        };

        // The capacity may have shrunk since the map was written.
        let trimmed = {
            let mut state = cache.state();
            let mut trimmed = 0;
            while state.entries.len() > cache.capacity() {
                evict_one(&mut state.entries);
                trimmed += 1;
            }
            trimmed
        };
        if trimmed > 0 {
            debug!(trimmed, "Trimmed persisted cache to capacity");
            cache.commit();
        }
        cache
    }

    /// Insert or replace `key`. Replacing an existing key never evicts.
    pub fn set_item<T: Serialize>(&self, key: &str, value: &T, priority: Priority) {
        let payload = match serde_json::to_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize cache payload");
                return;
            }
        };

        let now = self.clock.now();
        {
            let mut state = self.state();
            if !state.entries.contains_key(key) && state.entries.len() >= self.capacity() {
                if let Some(evicted) = evict_one(&mut state.entries) {
                    debug!(evicted = %evicted, inserted = key, "Evicted cache entry");
                }
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(
                key.to_string(),
                CacheEntry {
                    payload,
                    timestamp: now,
                    expires_at: now + self.config.max_age,
                    priority,
                    version: CACHE_VERSION.to_string(),
                    seq,
                },
            );
        }
        self.commit();
    }

    /// The payload for `key`, or `None` if absent or expired. Expired entries
    /// are removed.
    pub fn get_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        let payload = {
            let mut state = self.state();
            let entry = state.entries.get(key)?;
            if entry.is_expired(now) {
                state.entries.remove(key);
                None
            } else {
                Some(entry.payload.clone())
            }
        };

        let Some(payload) = payload else {
            debug!(key, "Cache entry expired");
            self.commit();
            return None;
        };

        match serde_json::from_value(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Cached payload has unexpected shape");
                None
            }
        }
    }

    /// Whether `key` is held and unexpired. Does not purge.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.state()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Empty the cache and its backing storage.
    pub fn clear_cache(&self) {
        self.state().entries.clear();
        if let Err(e) = self.backend.remove(&self.config.storage_key) {
            warn!(error = %e, "Failed to remove persisted cache");
        }
        self.size.send_replace(0);
    }

    /// Entry count, updated on every mutation.
    pub fn cache_size(&self) -> watch::Receiver<usize> {
        self.size.subscribe()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn capacity(&self) -> usize {
        self.config.max_items.max(1)
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write the map through and publish the new size.
    fn commit(&self) {
        let (json, len) = {
            let state = self.state();
            (serde_json::to_string(&state.entries), state.entries.len())
        };

        match json {
            Ok(json) => {
                if let Err(e) = self.backend.set(&self.config.storage_key, &json) {
                    warn!(error = %e, "Cache persistence failed");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize cache"),
        }
        self.size.send_replace(len);
    }
}

fn load_entries(backend: &dyn KeyValueStore, storage_key: &str) -> BTreeMap<String, CacheEntry> {
    let raw = match backend.get(storage_key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return BTreeMap::new(),
        Err(e) => {
            warn!(error = %e, "Failed to read persisted cache");
            return BTreeMap::new();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "Cache initialization failed, starting empty");
            BTreeMap::new()
        }
    }
}

/// Remove the entry with the greatest eviction rank. Returns its key.
fn evict_one(entries: &mut BTreeMap<String, CacheEntry>) -> Option<String> {
    let victim = entries
        .iter()
        .max_by_key(|(_, entry)| entry.eviction_rank())
        .map(|(key, _)| key.clone())?;
    entries.remove(&victim);
    Some(victim)
}
