use crate::operation::OperationStatus;
use crate::registry::OperationRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Evicts finished operations nobody closed.
///
/// Only `success` and `error` entries are eligible. Running, pending and
/// cancelled operations are never reaped, however old.
#[derive(Debug, Clone)]
pub struct CleanupSweeper {
    registry: Arc<OperationRegistry>,
    ttl: Duration,
}

impl CleanupSweeper {
    pub fn new(registry: Arc<OperationRegistry>, ttl: Duration) -> Self {
        Self { registry, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// One pass. Returns the ids that were removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let ttl = self.ttl;
        let mut removed = Vec::new();
        for op in self.registry.snapshot().await {
            // Re-checked under the write lock: the entry may have changed since
            // the snapshot.
            let evicted = self
                .registry
                .remove_if(&op.id, |current| is_stale(current.status, current.updated_at, now, ttl))
                .await;
            if let Some(op) = evicted {
                debug!(operation_id = %op.id, status = %op.status, "Swept stale operation");
                removed.push(op.id);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Cleanup sweep removed operations");
        }
        removed
    }
}

fn is_stale(
    status: OperationStatus,
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> bool {
    matches!(status, OperationStatus::Success | OperationStatus::Error)
        && (now - updated_at).to_std().map_or(false, |age| age > ttl)
}

/// Runs [`CleanupSweeper::sweep`] every `interval` until the handle is aborted.
pub fn spawn_cleanup_task(sweeper: CleanupSweeper, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweeper.sweep(Utc::now()).await;
        }
    })
}
