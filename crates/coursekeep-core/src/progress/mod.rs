//! Learner progress store for the course → unit → lesson hierarchy.
//!
//! `ProgressStore` persists one [`ProgressRecord`] per entity through a
//! [`KeyValueStore`], keeps ancestors consistent with their children, and
//! publishes every durable write on a [`ChangeBus`].
//!
//! Storage keys are `"<namespace>_<type>_<id>"` (namespace optional), e.g.
//! `lesson_c1_u1_l1` or `tajweed_unit_c1_u1`.
//!
//! Nothing here returns an error to the caller: corrupt records read as
//! absent, full storage triggers one sweep-and-retry, and failures are
//! logged. Losing a progress write is preferred over failing the UI.

pub mod aggregate;
mod cascade;

pub use aggregate::{summarize, AggregateSummary};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::events::{ChangeBus, ProgressChange, ProgressChanges, DEFAULT_BUS_CAPACITY};
use crate::models::{
    AnswerEntry, Bookmark, EntityKey, EntityType, LessonState, Note, ProgressPatch,
    ProgressRecord, SyncStatus, ID_SEPARATOR, MAX_PROGRESS, SCHEMA_VERSION,
};
use crate::schema::VersionedRecord;
use crate::storage::{ExternalChange, ExternalChanges, KeyValueStore};

use cascade::CascadeQueue;

/// Records expire two years after their last write.
pub const DEFAULT_RECORD_TTL_DAYS: i64 = 2 * 365;

/// Delay before a parent is recomputed, letting sibling writes coalesce.
pub const DEFAULT_CASCADE_DELAY: StdDuration = StdDuration::from_millis(50);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Optional application prefix for every key, e.g. `tajweed`.
    pub namespace: Option<String>,
    pub record_ttl: Duration,
    /// `None` recomputes parents synchronously inside `save_progress`.
    pub cascade_delay: Option<StdDuration>,
    pub bus_capacity: usize,
    /// Purge expired records when the store is opened.
    pub sweep_on_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            record_ttl: Duration::days(DEFAULT_RECORD_TTL_DAYS),
            cascade_delay: Some(DEFAULT_CASCADE_DELAY),
            bus_capacity: DEFAULT_BUS_CAPACITY,
            sweep_on_open: true,
        }
    }
}

impl StoreConfig {
    /// Config that cascades inline, convenient outside a Tokio runtime.
    pub fn synchronous() -> Self {
        Self {
            cascade_delay: None,
            ..Self::default()
        }
    }
}

pub(crate) struct StoreInner {
    backend: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    key_prefix: String,
    bus: ChangeBus,
    cascades: Option<CascadeQueue>,
    /// Cross-process signal, held here only when no listener task runs.
    external: Mutex<Option<ExternalChanges>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Handle to a progress store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProgressStore {
    inner: Arc<StoreInner>,
}

impl ProgressStore {
    /// Open a store over `backend`.
    ///
    /// Inside a Tokio runtime this spawns the cascade worker and the
    /// cross-process listener. Outside one, cascades run inline and remote
    /// changes are applied by [`ProgressStore::drain_external_changes`].
    pub fn new(
        backend: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Self {
        let runtime = tokio::runtime::Handle::try_current().ok();
        let key_prefix = config
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .map(|ns| format!("{}{}", ns, ID_SEPARATOR))
            .unwrap_or_default();
        let external = backend.external_changes();

        let mut tasks = Vec::new();
        let inner = Arc::new_cyclic(|weak| {
            let cascades = match (config.cascade_delay, runtime.as_ref()) {
                (Some(delay), Some(handle)) => {
                    let (queue, task) = CascadeQueue::start(weak.clone(), delay, handle);
                    tasks.push(task);
                    Some(queue)
                }
                (Some(_), None) => {
                    debug!("No Tokio runtime, parent recomputation runs inline");
                    None
                }
                (None, _) => None,
            };

            StoreInner {
                backend,
                clock,
                bus: ChangeBus::new(config.bus_capacity),
                config,
                key_prefix,
                cascades,
                external: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }
        });

        match (external, runtime) {
            (Some(rx), Some(handle)) => {
                tasks.push(handle.spawn(listen_external(Arc::downgrade(&inner), rx)));
            }
            (Some(rx), None) => {
                if let Ok(mut slot) = inner.external.lock() {
                    *slot = Some(rx);
                }
            }
            (None, _) => {}
        }
        if let Ok(mut slot) = inner.tasks.lock() {
            slot.extend(tasks);
        }

        let store = Self { inner };
        if store.inner.config.sweep_on_open {
            store.clear_expired_data();
        }
        store
    }

    /// Read a record. Expired, corrupt and missing records are all `None`;
    /// expired and corrupt ones are purged as a side effect. Older schema
    /// versions are upgraded in memory.
    pub fn get_progress(&self, entity_type: EntityType, id: &str) -> Option<ProgressRecord> {
        self.inner.read(&EntityKey::new(entity_type, id))
    }

    /// Merge `patch` over the stored record (or fresh defaults), persist it,
    /// publish the change, and schedule the parent's recomputation.
    ///
    /// `is_completed` may be set independently of `progress`. That is an
    /// escape hatch for explicit completion actions and must only be used
    /// by trusted call sites; derived parents are recomputed from their
    /// children regardless.
    pub fn save_progress(&self, entity_type: EntityType, id: &str, patch: ProgressPatch) {
        self.inner.save(&EntityKey::new(entity_type, id), patch);
    }

    /// Record an answer in the lesson's answer log, keeping every other
    /// answer already recorded.
    pub fn save_answer(
        &self,
        lesson_id: &str,
        question_id: &str,
        answer: serde_json::Value,
        is_correct: bool,
    ) {
        let key = EntityKey::new(EntityType::Lesson, lesson_id);
        let mut answers = self
            .inner
            .read(&key)
            .map(|record| record.lesson.answers)
            .unwrap_or_default();
        answers.insert(
            question_id.to_string(),
            AnswerEntry {
                answer,
                is_correct,
                timestamp: self.inner.clock.now(),
            },
        );
        self.inner.save(
            &key,
            ProgressPatch {
                answers: Some(answers),
                ..ProgressPatch::default()
            },
        );
    }

    /// Save player/reader state for a lesson and stamp `lastUpdated`.
    pub fn save_lesson_state(&self, lesson_id: &str, state: LessonState) {
        let mut patch = ProgressPatch::from(state);
        patch.last_updated = Some(self.inner.clock.now());
        self.inner
            .save(&EntityKey::new(EntityType::Lesson, lesson_id), patch);
    }

    pub fn add_bookmark(&self, lesson_id: &str, position: f64, label: &str) {
        let key = EntityKey::new(EntityType::Lesson, lesson_id);
        let mut bookmarks = self
            .inner
            .read(&key)
            .map(|record| record.lesson.bookmarks)
            .unwrap_or_default();
        bookmarks.push(Bookmark {
            position,
            label: label.to_string(),
            timestamp: self.inner.clock.now(),
        });
        self.inner.save(
            &key,
            ProgressPatch {
                bookmarks: Some(bookmarks),
                ..ProgressPatch::default()
            },
        );
    }

    pub fn add_note(&self, lesson_id: &str, position: f64, text: &str) {
        let key = EntityKey::new(EntityType::Lesson, lesson_id);
        let mut notes = self
            .inner
            .read(&key)
            .map(|record| record.lesson.notes)
            .unwrap_or_default();
        notes.push(Note {
            position,
            text: text.to_string(),
            timestamp: self.inner.clock.now(),
        });
        self.inner.save(
            &key,
            ProgressPatch {
                notes: Some(notes),
                ..ProgressPatch::default()
            },
        );
    }

    /// Recompute `parent` from its stored children right now. Returns the
    /// summary written, or `None` when the parent has no children (and was
    /// left untouched).
    pub fn recompute(&self, parent: &EntityKey) -> Option<AggregateSummary> {
        self.inner.recompute(parent)
    }

    /// Purge every record in the namespace whose expiry has passed, plus any
    /// that no longer decode. Returns the number removed.
    pub fn clear_expired_data(&self) -> usize {
        self.inner.clear_expired()
    }

    /// Remove one record.
    pub fn clear_progress(&self, entity_type: EntityType, id: &str) {
        let key = self.inner.storage_key(&EntityKey::new(entity_type, id));
        self.inner.remove_quietly(&key);
    }

    /// Remove every record in the namespace. Returns the number removed.
    pub fn clear_all(&self) -> usize {
        let keys = self.inner.namespace_keys();
        for (storage_key, _) in &keys {
            self.inner.remove_quietly(storage_key);
        }
        info!(removed = keys.len(), "Cleared all progress records");
        keys.len()
    }

    /// Every record in the namespace keyed by storage key, for diagnostics.
    /// Expiry is not applied; undecodable entries are skipped.
    pub fn debug_dump(&self) -> BTreeMap<String, ProgressRecord> {
        let now = self.inner.clock.now();
        let mut dump = BTreeMap::new();
        for (storage_key, _) in self.inner.namespace_keys() {
            let raw = match self.inner.backend.get(&storage_key) {
                Ok(Some(raw)) => raw,
                _ => continue,
            };
            match VersionedRecord::decode(&raw) {
                Ok(decoded) => {
                    dump.insert(
                        storage_key,
                        decoded.upgrade(now, self.inner.config.record_ttl),
                    );
                }
                Err(e) => {
                    debug!(key = %storage_key, error = %e, "Skipping undecodable record in dump");
                }
            }
        }
        dump
    }

    /// Update a record's sync status without touching its progress,
    /// timestamps or parents. Returns `false` if the record does not exist.
    pub fn set_sync_status(&self, entity_type: EntityType, id: &str, status: SyncStatus) -> bool {
        let key = EntityKey::new(entity_type, id);
        let Some(mut record) = self.inner.read(&key) else {
            return false;
        };
        record.sync_status = status;
        self.inner.persist(&self.inner.storage_key(&key), &record)
    }

    /// Keys of every live record still waiting to be synced.
    pub fn pending_sync(&self) -> Vec<EntityKey> {
        self.inner
            .namespace_keys()
            .into_iter()
            .filter_map(|(_, key)| {
                let record = self.inner.read(&key)?;
                (record.sync_status == SyncStatus::Pending).then_some(key)
            })
            .collect()
    }

    /// Subscribe to every subsequent change, local or remote.
    pub fn progress_changes(&self) -> ProgressChanges {
        self.inner.bus.subscribe()
    }

    /// The latest change as a watch value, `None` before the first one.
    pub fn watch_changes(&self) -> watch::Receiver<Option<ProgressChange>> {
        self.inner.bus.watch()
    }

    pub fn latest_change(&self) -> Option<ProgressChange> {
        self.inner.bus.latest()
    }

    /// Apply remote writes queued by the backend. Only needed when the store
    /// was opened outside a Tokio runtime; returns the number published.
    pub fn drain_external_changes(&self) -> usize {
        let Ok(mut slot) = self.inner.external.lock() else {
            return 0;
        };
        let Some(rx) = slot.as_mut() else {
            return 0;
        };
        let mut published = 0;
        while let Ok(change) = rx.try_recv() {
            if self.inner.apply_external(change) {
                published += 1;
            }
        }
        published
    }

    /// Wait until every queued parent recomputation has run.
    pub async fn settle(&self) {
        if let Some(queue) = &self.inner.cascades {
            queue.state().wait_idle().await;
        }
    }

    /// Storage key for an entity under this store's namespace.
    pub fn storage_key(&self, entity_type: EntityType, id: &str) -> String {
        self.inner.storage_key(&EntityKey::new(entity_type, id))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }
}

async fn listen_external(store: std::sync::Weak<StoreInner>, mut rx: ExternalChanges) {
    while let Some(change) = rx.recv().await {
        let Some(inner) = store.upgrade() else {
            break;
        };
        inner.apply_external(change);
    }
}

impl StoreInner {
    fn storage_key(&self, key: &EntityKey) -> String {
        format!(
            "{}{}{}{}",
            self.key_prefix,
            key.entity_type.prefix(),
            ID_SEPARATOR,
            key.id
        )
    }

    /// Inverse of `storage_key`; `None` for keys outside the namespace.
    fn parse_key(&self, storage_key: &str) -> Option<EntityKey> {
        let rest = storage_key.strip_prefix(self.key_prefix.as_str())?;
        EntityType::ALL.into_iter().find_map(|entity_type| {
            let id = rest
                .strip_prefix(entity_type.prefix())?
                .strip_prefix(ID_SEPARATOR)?;
            (!id.is_empty()).then(|| EntityKey::new(entity_type, id))
        })
    }

    fn namespace_keys(&self) -> Vec<(String, EntityKey)> {
        let keys = match self.backend.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list progress keys");
                return Vec::new();
            }
        };
        keys.into_iter()
            .filter_map(|storage_key| {
                let key = self.parse_key(&storage_key)?;
                Some((storage_key, key))
            })
            .collect()
    }

    fn remove_quietly(&self, storage_key: &str) {
        if let Err(e) = self.backend.remove(storage_key) {
            warn!(key = %storage_key, error = %e, "Failed to remove progress record");
        }
    }

    fn read(&self, key: &EntityKey) -> Option<ProgressRecord> {
        let storage_key = self.storage_key(key);
        let raw = match self.backend.get(&storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Failed to read progress record");
                return None;
            }
        };

        let decoded = match VersionedRecord::decode(&raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Discarding corrupt progress record");
                self.remove_quietly(&storage_key);
                return None;
            }
        };
        if !decoded.is_current() {
            debug!(
                key = %storage_key,
                from = decoded.stored_version().unwrap_or("unversioned"),
                to = SCHEMA_VERSION,
                "Migrating progress record"
            );
        }

        let now = self.clock.now();
        let record = decoded.upgrade(now, self.config.record_ttl);
        if record.is_expired(now) {
            debug!(key = %storage_key, "Purging expired progress record");
            self.remove_quietly(&storage_key);
            return None;
        }
        Some(record)
    }

    /// Returns whether the record was durably written.
    fn save(&self, key: &EntityKey, patch: ProgressPatch) -> bool {
        if key.id.is_empty() {
            warn!(entity_type = %key.entity_type, "Ignoring progress write with empty id");
            return false;
        }
        if patch.has_lesson_fields() && key.entity_type != EntityType::Lesson {
            debug!(key = %key, "Lesson-only fields ignored on non-lesson record");
        }

        let now = self.clock.now();
        let explicit_expiry = patch.expires_at.is_some();
        let base = self
            .read(key)
            .unwrap_or_else(|| ProgressRecord::empty(now, now + self.config.record_ttl));

        let mut record = patch.apply(base, key.entity_type);
        record.timestamp = now;
        if !explicit_expiry {
            record.expires_at = now + self.config.record_ttl;
        }
        record.version = SCHEMA_VERSION.to_string();
        record.sync_status = SyncStatus::Pending;

        if record.is_completed != (record.progress == MAX_PROGRESS) {
            debug!(
                key = %key,
                progress = record.progress,
                is_completed = record.is_completed,
                "Completion flag set independently of progress"
            );
        }

        let storage_key = self.storage_key(key);
        if !self.persist(&storage_key, &record) {
            return false;
        }

        self.bus.publish(ProgressChange {
            entity_type: key.entity_type,
            id: key.id.clone(),
            data: record,
        });

        if let Some(parent) = key.parent() {
            self.schedule_recompute(parent);
        }
        true
    }

    fn persist(&self, storage_key: &str, record: &ProgressRecord) -> bool {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                error!(key = %storage_key, error = %e, "Failed to serialize progress record");
                return false;
            }
        };

        match self.backend.set(storage_key, &json) {
            Ok(()) => true,
            Err(e) if e.is_quota() => {
                warn!(key = %storage_key, "Storage full, purging expired records and retrying");
                self.clear_expired();
                match self.backend.set(storage_key, &json) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(key = %storage_key, error = %e, "Progress write failed after retry, update dropped");
                        false
                    }
                }
            }
            Err(e) => {
                error!(key = %storage_key, error = %e, "Progress write failed, update dropped");
                false
            }
        }
    }

    fn schedule_recompute(&self, parent: EntityKey) {
        let parent = match &self.cascades {
            Some(queue) => match queue.schedule(parent) {
                Ok(()) => return,
                Err(parent) => parent,
            },
            None => parent,
        };
        self.recompute(&parent);
    }

    pub(crate) fn recompute(&self, parent: &EntityKey) -> Option<AggregateSummary> {
        let child_type = parent.entity_type.child()?;
        let prefix = format!(
            "{}{}",
            self.storage_key(&EntityKey::new(child_type, parent.id.as_str())),
            ID_SEPARATOR
        );

        let keys = match self.backend.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(parent = %parent, error = %e, "Failed to list children for aggregation");
                return None;
            }
        };

        let children: Vec<ProgressRecord> = keys
            .iter()
            .filter_map(|storage_key| storage_key.strip_prefix(prefix.as_str()))
            // Direct children only: one more id segment.
            .filter(|segment| !segment.is_empty() && !segment.contains(ID_SEPARATOR))
            .filter_map(|segment| {
                let child_id = format!("{}{}{}", parent.id, ID_SEPARATOR, segment);
                self.read(&EntityKey::new(child_type, child_id))
            })
            .collect();

        let Some(summary) = summarize(&children) else {
            debug!(parent = %parent, "No stored children, aggregate left untouched");
            return None;
        };

        debug!(
            parent = %parent,
            children = summary.total_items,
            progress = summary.progress,
            completed = summary.all_completed,
            "Recomputed aggregate"
        );
        self.save(
            parent,
            ProgressPatch::new()
                .progress(summary.progress as i64)
                .completed(summary.all_completed),
        );
        Some(summary)
    }

    fn clear_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for (storage_key, _) in self.namespace_keys() {
            let raw = match self.backend.get(&storage_key) {
                Ok(Some(raw)) => raw,
                _ => continue,
            };
            let purge = match VersionedRecord::decode(&raw) {
                Ok(decoded) => decoded.upgrade(now, self.config.record_ttl).is_expired(now),
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Purging corrupt progress record");
                    true
                }
            };
            if purge {
                self.remove_quietly(&storage_key);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Purged expired progress records");
        }
        removed
    }

    /// Republish a write made by another process. Returns whether a change
    /// was published.
    fn apply_external(&self, change: ExternalChange) -> bool {
        let Some(key) = self.parse_key(&change.key) else {
            return false;
        };
        let Some(raw) = change.new_value else {
            debug!(key = %change.key, "Progress record removed by another process");
            return false;
        };

        let decoded = match VersionedRecord::decode(&raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(key = %change.key, error = %e, "Dropping malformed external progress change");
                return false;
            }
        };
        let now = self.clock.now();
        let record = decoded.upgrade(now, self.config.record_ttl);
        if record.is_expired(now) {
            return false;
        }

        self.bus.publish(ProgressChange {
            entity_type: key.entity_type,
            id: key.id,
            data: record,
        });
        true
    }
}

/// Keys of dumped records whose expiry has passed at `now`.
pub fn expired_keys(
    records: &BTreeMap<String, ProgressRecord>,
    now: DateTime<Utc>,
) -> Vec<String> {
    records
        .iter()
        .filter(|(_, record)| record.is_expired(now))
        .map(|(key, _)| key.clone())
        .collect()
}

#[cfg(test)]
mod tests;
