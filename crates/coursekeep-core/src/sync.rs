//! Offline change queue replayed against a remote when connectivity returns.
//!
//! Changes are replayed oldest first. The first failure stops the pass and
//! leaves that change and everything after it queued for the next attempt.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::models::{EntityKey, SyncStatus};
use crate::progress::ProgressStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Progress,
    Completion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineChange {
    pub key: EntityKey,
    pub kind: ChangeKind,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_sync: Option<DateTime<Utc>>,
    pub is_syncing: bool,
    pub pending_changes: usize,
}

/// Where queued changes are delivered.
pub trait SyncTransport: Send + Sync {
    fn push<'a>(&'a self, change: &'a OfflineChange) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Outcome of one `sync` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every queued change was delivered.
    Complete { delivered: usize },
    /// Delivery stopped at a failure; `remaining` changes stay queued.
    Interrupted { delivered: usize, remaining: usize },
    /// Another sync was already running.
    Skipped,
}

pub struct SyncQueue {
    clock: Arc<dyn Clock>,
    store: Option<ProgressStore>,
    changes: Mutex<Vec<OfflineChange>>,
    state: watch::Sender<SyncState>,
}

impl SyncQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(SyncState {
            last_sync: None,
            is_syncing: false,
            pending_changes: 0,
        });
        Self {
            clock,
            store: None,
            changes: Mutex::new(Vec::new()),
            state,
        }
    }

    /// Mark records synced (or errored) in `store` as their changes are
    /// delivered.
    pub fn with_store(mut self, store: ProgressStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue_change(&self, key: EntityKey, kind: ChangeKind) {
        let change = OfflineChange {
            key,
            kind,
            timestamp: self.clock.now(),
        };
        let pending = {
            let mut changes = self.changes();
            changes.push(change);
            changes.len()
        };
        self.state.send_modify(|state| state.pending_changes = pending);
    }

    /// Queue every record the store still has marked pending.
    pub fn queue_pending(&self, store: &ProgressStore) -> usize {
        let keys = store.pending_sync();
        let count = keys.len();
        for key in keys {
            self.queue_change(key, ChangeKind::Progress);
        }
        count
    }

    /// Replay queued changes through `transport` in timestamp order.
    pub async fn sync(&self, transport: &dyn SyncTransport) -> SyncOutcome {
        let mut started = false;
        self.state.send_if_modified(|state| {
            if state.is_syncing {
                return false;
            }
            state.is_syncing = true;
            started = true;
            true
        });
        if !started {
            debug!("Sync already in progress");
            return SyncOutcome::Skipped;
        }

        let mut batch = std::mem::take(&mut *self.changes());
        // Stable, so changes stamped in the same millisecond keep queue order.
        batch.sort_by_key(|change| change.timestamp);

        let mut delivered = 0;
        let mut failed = false;
        for change in &batch {
            match transport.push(change).await {
                Ok(()) => {
                    delivered += 1;
                    self.mark(&change.key, SyncStatus::Synced);
                }
                Err(e) => {
                    warn!(key = %change.key, error = %e, "Sync failed, keeping remaining changes");
                    self.mark(&change.key, SyncStatus::Error);
                    failed = true;
                    break;
                }
            }
        }

        let pending = {
            let mut changes = self.changes();
            // Anything queued while we were syncing goes after the unsent tail.
            let mut requeued: Vec<OfflineChange> = batch.split_off(delivered);
            requeued.append(&mut changes);
            *changes = requeued;
            changes.len()
        };

        let now = self.clock.now();
        self.state.send_modify(|state| {
            state.is_syncing = false;
            state.pending_changes = pending;
            if !failed {
                state.last_sync = Some(now);
            }
        });

        if failed {
            SyncOutcome::Interrupted {
                delivered,
                remaining: pending,
            }
        } else {
            info!(delivered, "Sync complete");
            SyncOutcome::Complete { delivered }
        }
    }

    /// Drop everything queued without delivering it.
    pub fn clear_pending_changes(&self) {
        self.changes().clear();
        self.state.send_modify(|state| state.pending_changes = 0);
    }

    pub fn pending(&self) -> Vec<OfflineChange> {
        self.changes().clone()
    }

    pub fn status(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn mark(&self, key: &EntityKey, status: SyncStatus) {
        if let Some(store) = &self.store {
            store.set_sync_status(key.entity_type, &key.id, status);
        }
    }

    fn changes(&self) -> MutexGuard<'_, Vec<OfflineChange>> {
        self.changes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{EntityType, ProgressPatch};
    use crate::progress::StoreConfig;
    use crate::storage::MemoryStore;
    use chrono::Duration;

    /// Records deliveries; fails on the `fail_at`th push (zero-based).
    struct Recorder {
        delivered: Mutex<Vec<String>>,
        fail_at: Option<usize>,
    }

    impl Recorder {
        fn new(fail_at: Option<usize>) -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                fail_at,
            }
        }

        fn ids(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    impl SyncTransport for Recorder {
        fn push<'a>(&'a self, change: &'a OfflineChange) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                let mut delivered = self.delivered.lock().unwrap();
                if self.fail_at == Some(delivered.len()) {
                    anyhow::bail!("offline");
                }
                delivered.push(change.key.id.clone());
                Ok(())
            })
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc::now()))
    }

    #[tokio::test]
    async fn test_replays_in_timestamp_order() {
        let clock = clock();
        let queue = SyncQueue::new(clock.clone());

        queue.queue_change(EntityKey::new(EntityType::Lesson, "c1_u1_l2"), ChangeKind::Progress);
        clock.set(clock.now() - Duration::minutes(5));
        queue.queue_change(EntityKey::new(EntityType::Lesson, "c1_u1_l1"), ChangeKind::Completion);
        assert_eq!(queue.status().borrow().pending_changes, 2);

        let transport = Recorder::new(None);
        assert_eq!(
            queue.sync(&transport).await,
            SyncOutcome::Complete { delivered: 2 }
        );
        assert_eq!(transport.ids(), vec!["c1_u1_l1", "c1_u1_l2"]);

        let state = queue.status().borrow().clone();
        assert_eq!(state.pending_changes, 0);
        assert!(!state.is_syncing);
        assert!(state.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_failure_keeps_remaining_changes() {
        let queue = SyncQueue::new(clock());
        for id in ["l1", "l2", "l3"] {
            queue.queue_change(EntityKey::new(EntityType::Lesson, format!("c1_u1_{}", id)), ChangeKind::Progress);
        }

        let transport = Recorder::new(Some(1));
        assert_eq!(
            queue.sync(&transport).await,
            SyncOutcome::Interrupted {
                delivered: 1,
                remaining: 2
            }
        );

        let remaining: Vec<String> = queue.pending().into_iter().map(|c| c.key.id).collect();
        assert_eq!(remaining, vec!["c1_u1_l2", "c1_u1_l3"]);
        let state = queue.status().borrow().clone();
        assert_eq!(state.pending_changes, 2);
        assert!(state.last_sync.is_none());
    }

    #[tokio::test]
    async fn test_marks_records_in_store() {
        let backend = Arc::new(MemoryStore::new());
        let clock = clock();
        let store = ProgressStore::new(backend, clock.clone(), StoreConfig::synchronous());
        store.save_progress(EntityType::Course, "c1", ProgressPatch::new().progress(10));
        store.save_progress(EntityType::Course, "c2", ProgressPatch::new().progress(20));

        let queue = SyncQueue::new(clock).with_store(store.clone());
        assert_eq!(queue.queue_pending(&store), 2);

        let transport = Recorder::new(Some(1));
        queue.sync(&transport).await;

        let statuses: Vec<SyncStatus> = ["c1", "c2"]
            .iter()
            .map(|id| store.get_progress(EntityType::Course, id).unwrap().sync_status)
            .collect();
        assert_eq!(statuses, vec![SyncStatus::Synced, SyncStatus::Error]);
        assert!(store.pending_sync().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_skipped() {
        let queue = SyncQueue::new(clock());
        queue.queue_change(EntityKey::new(EntityType::Course, "c1"), ChangeKind::Progress);
        queue.state.send_modify(|state| state.is_syncing = true);

        let transport = Recorder::new(None);
        assert_eq!(queue.sync(&transport).await, SyncOutcome::Skipped);
        assert!(transport.ids().is_empty());
        assert_eq!(queue.pending().len(), 1);
    }

    #[test]
    fn test_clear_pending_changes() {
        let queue = SyncQueue::new(clock());
        queue.queue_change(EntityKey::new(EntityType::Course, "c1"), ChangeKind::Progress);
        queue.clear_pending_changes();
        assert!(queue.pending().is_empty());
        assert_eq!(queue.status().borrow().pending_changes, 0);
    }

    #[test]
    fn test_offline_change_json() {
        let change = OfflineChange {
            key: EntityKey::new(EntityType::Unit, "c1_u1"),
            kind: ChangeKind::Completion,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "completion");
        assert!(json["timestamp"].is_i64());
    }
}
