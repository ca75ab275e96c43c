//! Deferred queue for parent recomputation.
//!
//! Writes enqueue their parent key; a background task waits for the
//! debounce delay, collects every key queued meanwhile and recomputes each
//! distinct parent once, units before courses. Recomputation rescans
//! storage, so firing twice or coalescing is always safe.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::{EntityKey, EntityType};

use super::StoreInner;

/// Tracks queued-but-unprocessed cascades so callers can wait for quiescence.
#[derive(Default)]
pub(crate) struct CascadeState {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl CascadeState {
    fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self, count: usize) {
        self.outstanding.fetch_sub(count, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until no cascade is queued or running.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct CascadeQueue {
    tx: mpsc::UnboundedSender<EntityKey>,
    state: Arc<CascadeState>,
}

impl CascadeQueue {
    /// Spawn the queue's worker on the current runtime.
    pub(crate) fn start(
        store: Weak<StoreInner>,
        delay: Duration,
        handle: &tokio::runtime::Handle,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(CascadeState::default());
        let task = handle.spawn(run_cascades(store, rx, delay, Arc::clone(&state)));
        (Self { tx, state }, task)
    }

    /// Queue a recomputation of `parent`. Returns the key back if the worker
    /// is gone so the caller can run it inline.
    pub(crate) fn schedule(&self, parent: EntityKey) -> Result<(), EntityKey> {
        self.state.begin();
        self.tx.send(parent).map_err(|e| {
            self.state.finish(1);
            e.0
        })
    }

    pub(crate) fn state(&self) -> &CascadeState {
        &self.state
    }
}

async fn run_cascades(
    store: Weak<StoreInner>,
    mut rx: mpsc::UnboundedReceiver<EntityKey>,
    delay: Duration,
    state: Arc<CascadeState>,
) {
    while let Some(first) = rx.recv().await {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut received = 1;
        let mut batch: BTreeSet<(Reverse<EntityType>, String)> = BTreeSet::new();
        batch.insert((Reverse(first.entity_type), first.id));
        while let Ok(key) = rx.try_recv() {
            received += 1;
            batch.insert((Reverse(key.entity_type), key.id));
        }

        if received > batch.len() {
            debug!(received, distinct = batch.len(), "Coalesced parent recomputations");
        }

        match store.upgrade() {
            Some(inner) => {
                for (Reverse(entity_type), id) in batch {
                    inner.recompute(&EntityKey::new(entity_type, id));
                }
            }
            None => {
                state.finish(received);
                break;
            }
        }
        state.finish(received);
    }
}
