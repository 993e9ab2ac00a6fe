use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// The active-workspace set changed.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ActivityChange {
    pub active_workspaces: BTreeSet<String>,
    /// Unix millis of the scan that produced this set.
    pub observed_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusMetricsSnapshot {
    pub sent: u64,
    pub send_errors: u64,
}

/// Broadcast fan-out of activity changes to transports and UIs.
///
/// Publishing with no subscribers counts as an error in the snapshot but is
/// otherwise harmless; the daemon keeps scanning either way.
pub struct EventBus {
    activity_tx: broadcast::Sender<ActivityChange>,
    sent: AtomicU64,
    send_errors: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (activity_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            activity_tx,
            sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityChange> {
        self.activity_tx.subscribe()
    }

    pub fn publish(&self, change: ActivityChange) {
        match self.activity_tx.send(change) {
            Ok(_) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn metrics(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}
