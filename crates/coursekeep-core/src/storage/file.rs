use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ExternalChange, ExternalChanges, KeyValueStore, StorageError};

/// File extension for stored values.
const VALUE_EXTENSION: &str = "json";

/// Default interval between directory scans for external writes.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// ENOSPC on Linux and macOS.
const NO_SPACE_OS_ERROR: i32 = 28;

/// Directory-backed key/value store: one `<key>.json` file per key.
///
/// Writes go to a temporary file that is renamed into place, so readers in
/// other processes never observe a half-written value.
pub struct FileStore {
    dir: PathBuf,
    quota_bytes: Option<u64>,
    watch_interval: Duration,
    /// Last content this process wrote or observed per key. The watcher
    /// reports anything that differs as an external change.
    known: Arc<Mutex<HashMap<String, String>>>,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            quota_bytes: None,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            known: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Reject writes once the directory holds more than `quota_bytes`.
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn value_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}.{}", key, VALUE_EXTENSION)))
    }

    fn used_bytes_excluding(&self, key: &str) -> Result<u64, StorageError> {
        let mut total = 0;
        for (name, path) in list_values(&self.dir)? {
            if name == key {
                continue;
            }
            total += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(total)
    }

    fn write_atomic(&self, key: &str, path: &Path, value: &str) -> Result<(), StorageError> {
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", key, std::process::id()));
        let result = std::fs::write(&tmp, value).and_then(|_| std::fs::rename(&tmp, path));
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            if e.raw_os_error() == Some(NO_SPACE_OS_ERROR) {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// `(key, path)` for every stored value in `dir`.
fn list_values(dir: &Path) -> Result<Vec<(String, PathBuf)>, StorageError> {
    let mut values = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXTENSION) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        values.push((name.to_string(), path));
    }
    Ok(values)
}

fn read_all(dir: &Path) -> HashMap<String, String> {
    let mut contents = HashMap::new();
    let values = match list_values(dir) {
        Ok(values) => values,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to list store directory");
            return contents;
        }
    };
    for (key, path) in values {
        // A value can vanish between listing and reading.
        if let Ok(value) = std::fs::read_to_string(&path) {
            contents.insert(key, value);
        }
    }
    contents
}

/// Compare the directory against `known`, update it, and return what changed.
///
/// The lock is held across the scan: `set` and `remove` take it around their
/// own writes, so a scan never sees a local write that `known` has not.
fn diff_directory(dir: &Path, known: &Mutex<HashMap<String, String>>) -> Vec<ExternalChange> {
    let Ok(mut known) = known.lock() else {
        return Vec::new();
    };
    let current = read_all(dir);

    let mut changes = Vec::new();
    for (key, value) in &current {
        if known.get(key) != Some(value) {
            changes.push(ExternalChange {
                key: key.clone(),
                new_value: Some(value.clone()),
            });
        }
    }
    for key in known.keys() {
        if !current.contains_key(key) {
            changes.push(ExternalChange {
                key: key.clone(),
                new_value: None,
            });
        }
    }
    *known = current;
    changes
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.value_path(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.value_path(key)?;
        if let Some(quota) = self.quota_bytes {
            if self.used_bytes_excluding(key)? + value.len() as u64 > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }

        let mut known = self
            .known
            .lock()
            .map_err(|_| StorageError::Backend("file store lock poisoned".to_string()))?;
        self.write_atomic(key, &path, value)?;
        known.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.value_path(key)?;
        let mut known = self
            .known
            .lock()
            .map_err(|_| StorageError::Backend("file store lock poisoned".to_string()))?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        known.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = list_values(&self.dir)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Starts a polling watcher on the current Tokio runtime. Returns `None`
    /// outside a runtime.
    fn external_changes(&self) -> Option<ExternalChanges> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("No Tokio runtime, file store watcher disabled");
                return None;
            }
        };

        // Baseline: everything already on disk is not a change.
        if let Ok(mut known) = self.known.lock() {
            known.extend(read_all(&self.dir));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let dir = self.dir.clone();
        let known = Arc::clone(&self.known);
        let interval = self.watch_interval;

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    debug!(dir = %dir.display(), "File store watcher stopped");
                    break;
                }
                for change in diff_directory(&dir, &known) {
                    if tx.send(change).is_err() {
                        return;
                    }
                }
            }
        });

        Some(rx)
    }
}
