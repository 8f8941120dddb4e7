//! Request scheduler: dedup filtering in front of the leased work queue

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::dedup_chain::{DedupChain, DedupError};
use crate::application::work_queue::{LeasedRequest, QueueError, WorkQueue};
use crate::domain::{ElementId, Request};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub enqueued: u64,
    pub filtered: u64,
    pub dequeued: u64,
    pub acked: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    filtered: AtomicU64,
    dequeued: AtomicU64,
    acked: AtomicU64,
}

pub struct Scheduler {
    dedup: Arc<DedupChain>,
    queue: WorkQueue,
    counters: Counters,
}

impl Scheduler {
    #[must_use]
    pub fn new(dedup: Arc<DedupChain>, queue: WorkQueue) -> Self {
        Self {
            dedup,
            queue,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn dedup(&self) -> &Arc<DedupChain> {
        &self.dedup
    }

    #[must_use]
    pub const fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Queues the request unless the dedup chain has seen it; `false` when filtered
    pub async fn enqueue(&self, request: &Request) -> Result<bool, ScheduleError> {
        let verdict = self.dedup.check_request(request).await?;
        if verdict.is_duplicate() {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        self.queue.push(request).await?;
        if let Some(fingerprint) = verdict.fingerprint() {
            self.dedup.remember_request(fingerprint);
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(url = %request.url, callback = ?request.callback, "request scheduled");
        Ok(true)
    }

    /// Leases up to `count` ready requests
    pub async fn next_batch(&self, count: usize) -> Result<Vec<LeasedRequest>, ScheduleError> {
        let batch = self.queue.pop(count).await?;
        self.counters
            .dequeued
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(batch)
    }

    pub async fn ack(&self, element_id: &ElementId) -> Result<bool, ScheduleError> {
        let removed = self.queue.ack(element_id).await?;
        if removed {
            self.counters.acked.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Whether any element is ready or leased
    pub async fn has_pending(&self) -> Result<bool, ScheduleError> {
        Ok(self.queue.total_len().await? > 0)
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::{CanonicalPolicy, MockClock};
    use crate::infrastructure::{MemoryStore, RemoteAuthority};

    fn scheduler() -> Scheduler {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(MockClock::at_millis(1_000));
        let dedup = DedupChain::new(
            Arc::clone(&store) as _,
            "dedup:news",
            CanonicalPolicy::default(),
            RemoteAuthority::Disabled,
            Arc::clone(&clock) as _,
        );
        let queue = WorkQueue::new(store, "requestqueue:news", Duration::from_secs(20), clock);
        Scheduler::new(Arc::new(dedup), queue)
    }

    #[tokio::test]
    async fn filtered_requests_are_counted_not_queued() {
        let scheduler = scheduler();
        assert!(scheduler.enqueue(&Request::get("https://x.test/a?utm=1")).await.unwrap());
        assert!(!scheduler.enqueue(&Request::get("https://x.test/a?utm=2")).await.unwrap());
        assert!(scheduler.enqueue(&Request::get("https://x.test/a").unfiltered()).await.unwrap());

        let stats = scheduler.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.filtered, 1);
        assert_eq!(scheduler.queue().total_len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn ack_drains_pending_work() {
        let scheduler = scheduler();
        scheduler.enqueue(&Request::get("https://x.test/only")).await.unwrap();

        let batch = scheduler.next_batch(4).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(scheduler.has_pending().await.unwrap());

        assert!(scheduler.ack(&batch[0].element_id).await.unwrap());
        assert!(!scheduler.ack(&batch[0].element_id).await.unwrap());
        assert!(!scheduler.has_pending().await.unwrap());
        assert_eq!(
            scheduler.stats(),
            SchedulerStats { enqueued: 1, filtered: 0, dequeued: 1, acked: 1 }
        );
    }
}
