//! Offline-first progress persistence for a course → unit → lesson catalog.
//!
//! - [`ProgressStore`]: per-entity progress records over a pluggable
//!   [`KeyValueStore`], with lazy expiry, schema migration and automatic
//!   parent aggregation.
//! - [`ChangeBus`]: fan-out of every durable write, local or from another
//!   process sharing the store.
//! - [`ContentCache`]: bounded, priority-evicting cache for arbitrary payloads.
//! - [`SyncQueue`]: offline change queue replayed against a remote.
//! - [`OfflineStorage`]: typed stores for course content kept offline.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use coursekeep_core::{EntityType, MemoryStore, ProgressPatch, ProgressStore, StoreConfig, SystemClock};
//!
//! let store = ProgressStore::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(SystemClock),
//!     StoreConfig::synchronous(),
//! );
//! store.save_progress(
//!     EntityType::Lesson,
//!     "c1_u1_l1",
//!     ProgressPatch::new().progress(100).completed(true),
//! );
//! assert_eq!(store.get_progress(EntityType::Unit, "c1_u1").unwrap().progress, 100);
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod events;
pub mod models;
pub mod progress;
pub mod schema;
pub mod storage;
pub mod sync;

pub use cache::{CacheConfig, ContentCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use events::{ChangeBus, ProgressChange, ProgressChanges};
pub use models::{
    AssetInfo, AssetKind, CacheEntry, EntityKey, EntityType, KeyError, LessonState, Priority,
    ProgressPatch, ProgressRecord, StorageMeta, SyncStatus,
};
pub use progress::{AggregateSummary, ProgressStore, StoreConfig};
pub use schema::{SchemaError, VersionedRecord};
pub use storage::{
    FileStore, KeyValueStore, MemoryStore, OfflineError, OfflineStorage, OfflineStore,
    StorageError,
};
pub use sync::{ChangeKind, OfflineChange, SyncOutcome, SyncQueue, SyncState, SyncTransport};
