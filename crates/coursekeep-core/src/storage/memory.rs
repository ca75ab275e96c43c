use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::{ExternalChange, ExternalChanges, KeyValueStore, StorageError};

struct Subscriber {
    origin: u64,
    tx: mpsc::UnboundedSender<ExternalChange>,
}

struct Shared {
    data: Mutex<BTreeMap<String, String>>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Total bytes (keys + values) the namespace may hold.
    quota_bytes: Option<usize>,
    /// Writes that will fail with a quota error regardless of size.
    forced_quota_failures: AtomicUsize,
    next_origin: AtomicU64,
}

/// In-memory key/value store.
///
/// Each handle is one "process". [`MemoryStore::connect`] opens another
/// handle onto the same data; writes through one handle are delivered to
/// the others' [`KeyValueStore::external_changes`] receivers.
pub struct MemoryStore {
    shared: Arc<Shared>,
    origin: u64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A store that rejects writes once keys and values exceed `quota_bytes`.
    #[must_use]
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self::build(Some(quota_bytes))
    }

    fn build(quota_bytes: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(BTreeMap::new()),
                subscribers: Mutex::new(Vec::new()),
                quota_bytes,
                forced_quota_failures: AtomicUsize::new(0),
                next_origin: AtomicU64::new(1),
            }),
            origin: 0,
        }
    }

    /// Open another handle onto the same namespace.
    #[must_use]
    pub fn connect(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            origin: self.shared.next_origin.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Make the next `count` writes fail with a quota error.
    pub fn fail_next_writes(&self, count: usize) {
        self.shared
            .forced_quota_failures
            .store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data().map(|data| data.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held, counting keys and values.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.data()
            .map(|data| data.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0)
    }

    fn data(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        self.shared
            .data
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    fn take_forced_failure(&self) -> bool {
        self.shared
            .forced_quota_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn notify_others(&self, change: ExternalChange) {
        let Ok(mut subscribers) = self.shared.subscribers.lock() else {
            return;
        };
        // Drop subscribers whose receiver is gone.
        subscribers.retain(|sub| {
            if sub.origin == self.origin {
                return !sub.tx.is_closed();
            }
            sub.tx.send(change.clone()).is_ok()
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.take_forced_failure() {
            return Err(StorageError::QuotaExceeded {
                key: key.to_string(),
            });
        }

        {
            let mut data = self.data()?;
            if let Some(quota) = self.shared.quota_bytes {
                let used: usize = data
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                if used + key.len() + value.len() > quota {
                    return Err(StorageError::QuotaExceeded {
                        key: key.to_string(),
                    });
                }
            }
            data.insert(key.to_string(), value.to_string());
        }

        self.notify_others(ExternalChange {
            key: key.to_string(),
            new_value: Some(value.to_string()),
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let removed = self.data()?.remove(key).is_some();
        if removed {
            self.notify_others(ExternalChange {
                key: key.to_string(),
                new_value: None,
            });
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.data()?.keys().cloned().collect())
    }

    fn external_changes(&self) -> Option<ExternalChanges> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.shared.subscribers.lock().ok()?;
        subscribers.push(Subscriber {
            origin: self.origin,
            tx,
        });
        Some(rx)
    }
}
