//! Change notification bus for progress records.
//!
//! Every durable `save_progress` and every write observed from another
//! process is published here as a [`ProgressChange`]. Consumers cannot tell
//! local writes from remote ones.

use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::warn;

use crate::models::{EntityKey, EntityType, ProgressRecord};

/// Default number of undelivered changes a slow subscriber may fall behind.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressChange {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub id: String,
    pub data: ProgressRecord,
}

impl ProgressChange {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.id.clone())
    }
}

/// Fan-out point for progress changes.
///
/// Holds the most recent change (`None` before the first publish) and
/// delivers each subsequent change, in order, to every live subscription.
/// New subscriptions do not replay history.
pub struct ChangeBus {
    latest: watch::Sender<Option<ProgressChange>>,
    events: broadcast::Sender<ProgressChange>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (latest, _) = watch::channel(None);
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { latest, events }
    }

    pub fn publish(&self, change: ProgressChange) {
        self.latest.send_replace(Some(change.clone()));
        // No subscribers is fine.
        let _ = self.events.send(change);
    }

    /// The most recently published change.
    pub fn latest(&self) -> Option<ProgressChange> {
        self.latest.borrow().clone()
    }

    /// A receiver that always holds the latest value, starting at `None`.
    pub fn watch(&self) -> watch::Receiver<Option<ProgressChange>> {
        self.latest.subscribe()
    }

    pub fn subscribe(&self) -> ProgressChanges {
        ProgressChanges {
            rx: self.events.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// An ordered subscription to progress changes.
pub struct ProgressChanges {
    rx: broadcast::Receiver<ProgressChange>,
}

impl ProgressChanges {
    /// Wait for the next change. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ProgressChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress subscriber lagged, changes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next change if one is already queued.
    pub fn try_recv(&mut self) -> Option<ProgressChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress subscriber lagged, changes dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything already queued.
    pub fn drain(&mut self) -> Vec<ProgressChange> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressChange> {
        stream::unfold(self, |mut changes| async move {
            changes.recv().await.map(|change| (change, changes))
        })
    }
}
