//! Data models for the learning catalog's persisted state.
//!
//! - `EntityType`, `EntityKey`: the course → unit → lesson hierarchy
//! - `ProgressRecord`, `ProgressPatch`: per-entity progress and its partial updates
//! - Lesson extension types: `AnswerEntry`, `Bookmark`, `Note`, `LessonState`
//! - `CacheEntry`, `Priority`: bounded content cache entries
//! - `StorageMeta`, `AssetInfo`: what a course has stored offline

pub mod cache;
pub mod offline;
pub mod progress;

pub use cache::{CacheEntry, Priority};
pub use offline::{AssetInfo, AssetKind, StorageMeta};
pub use progress::{
    clamp_progress, AnswerEntry, Bookmark, EntityKey, EntityType, KeyError, LessonFields,
    LessonState, Note, ProgressPatch, ProgressRecord, SyncStatus, ID_SEPARATOR, MAX_PROGRESS,
    SCHEMA_VERSION,
};
