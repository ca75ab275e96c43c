//! Typed stores for course content downloaded for offline use.
//!
//! Each store is a key prefix on the shared [`KeyValueStore`]: a record with
//! id `c1` in [`OfflineStore::Courses`] lives under `courses_c1`. Ids are
//! escaped so asset URLs are valid keys on every backend.

use std::fmt;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{KeyValueStore, StorageError};
use crate::models::StorageMeta;

#[derive(Error, Debug)]
pub enum OfflineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Failed to encode offline record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfflineStore {
    Courses,
    Units,
    Lessons,
    /// Keyed by asset URL.
    Assets,
    /// Keyed by course id, see [`StorageMeta`].
    Meta,
}

impl OfflineStore {
    pub const ALL: [OfflineStore; 5] = [
        OfflineStore::Courses,
        OfflineStore::Units,
        OfflineStore::Lessons,
        OfflineStore::Assets,
        OfflineStore::Meta,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OfflineStore::Courses => "courses",
            OfflineStore::Units => "units",
            OfflineStore::Lessons => "lessons",
            OfflineStore::Assets => "assets",
            OfflineStore::Meta => "meta",
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}_{}", self.name(), escape_id(id))
    }

    fn prefix(&self) -> String {
        format!("{}_", self.name())
    }
}

impl fmt::Display for OfflineStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Percent-escape the characters a file-backed key cannot hold.
fn escape_id(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            '%' | '/' | '\\' | '\0' => escaped.push_str(&format!("%{:02X}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}

fn unescape_id(escaped: &str) -> String {
    let mut id = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('%') {
        id.push_str(&rest[..pos]);
        let code = rest
            .get(pos + 1..pos + 3)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match code {
            Some(byte) => {
                id.push(char::from(byte));
                rest = &rest[pos + 3..];
            }
            None => {
                id.push('%');
                rest = &rest[pos + 1..];
            }
        }
    }
    id.push_str(rest);
    id
}

/// Offline content stores over a shared backend.
///
/// Writes report failures to the caller. Reads treat a missing, unreadable
/// or undecodable record as absent and log why.
#[derive(Clone)]
pub struct OfflineStorage {
    backend: Arc<dyn KeyValueStore>,
}

impl OfflineStorage {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Insert or replace the record `id` in `store`.
    pub fn store_data<T: Serialize>(
        &self,
        store: OfflineStore,
        id: &str,
        data: &T,
    ) -> Result<(), OfflineError> {
        let contents = serde_json::to_string(data)?;
        self.backend.set(&store.key(id), &contents)?;
        debug!(store = %store, id, "Stored offline record");
        Ok(())
    }

    pub fn get_data<T: DeserializeOwned>(&self, store: OfflineStore, id: &str) -> Option<T> {
        let key = store.key(id);
        let raw = match self.backend.get(&key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(store = %store, id, error = %e, "Failed to read offline record");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(store = %store, id, error = %e, "Failed to parse offline record");
                None
            }
        }
    }

    pub fn store_meta(&self, meta: &StorageMeta) -> Result<(), OfflineError> {
        self.store_data(OfflineStore::Meta, &meta.course_id, meta)
    }

    pub fn get_meta(&self, course_id: &str) -> Option<StorageMeta> {
        self.get_data(OfflineStore::Meta, course_id)
    }

    /// Removing a missing record is not an error.
    pub fn remove_data(&self, store: OfflineStore, id: &str) -> Result<(), OfflineError> {
        self.backend.remove(&store.key(id))?;
        Ok(())
    }

    /// Ids held in `store`, sorted.
    pub fn ids(&self, store: OfflineStore) -> Result<Vec<String>, OfflineError> {
        let prefix = store.prefix();
        let mut ids: Vec<String> = self
            .backend
            .keys()?
            .iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .map(unescape_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Empty every offline store. Keys outside them are left alone. Returns
    /// the number of records removed.
    pub fn clear_storage(&self) -> Result<usize, OfflineError> {
        let prefixes: Vec<String> = OfflineStore::ALL.iter().map(|s| s.prefix()).collect();
        let mut removed = 0;
        for key in self.backend.keys()? {
            if prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                self.backend.remove(&key)?;
                removed += 1;
            }
        }
        info!(removed, "Cleared offline storage");
        Ok(removed)
    }
}
