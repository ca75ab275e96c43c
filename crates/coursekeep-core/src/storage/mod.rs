//! Durable key/value persistence backends.
//!
//! The progress store and content cache only depend on the
//! [`KeyValueStore`] trait:
//!
//! - `MemoryStore`: process-local map. Handles created with
//!   [`MemoryStore::connect`] share one namespace and see each other's
//!   writes as external changes, which models several app instances.
//! - `FileStore`: one JSON file per key in a directory. A polling watcher
//!   reports writes made by other processes.
//!
//! [`OfflineStorage`] layers typed stores for downloaded course content on
//! top of any backend.

pub mod file;
pub mod memory;
pub mod offline;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use offline::{OfflineError, OfflineStorage, OfflineStore};

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage quota exceeded writing '{key}'")]
    QuotaExceeded { key: String },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

/// A write observed from another process sharing the same store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalChange {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

/// Receiving end of a backend's cross-process change signal.
pub type ExternalChanges = mpsc::UnboundedReceiver<ExternalChange>;

/// Durable string key/value storage.
///
/// Operations are synchronous: backends are local and fast. Absence is
/// `Ok(None)`, never an error.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Fails with [`StorageError::QuotaExceeded`] when the backend is full.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Subscribe to writes made by other processes. Backends without a
    /// cross-process signal return `None`.
    fn external_changes(&self) -> Option<ExternalChanges> {
        None
    }
}
