//! # Leased Work Queue
//!
//! Score-ordered queue of encoded requests in the shared store.
//!
//! - `push` scores an element with the current time, making it ready
//! - `pop` leases up to N ready elements by rescoring them to `now + lease`
//!   in one atomic store operation
//! - `ack` removes an element for good; an element that is never acked
//!   becomes ready again when its lease runs out
//!
//! Store errors propagate unchanged. Ordering is by eligibility score only.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::domain::{Clock, CodecError, ElementId, Request, RequestCodec};
use crate::infrastructure::{CoordinationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue element encoding failed: {0}")]
    Codec(#[from] CodecError),
}

/// A request leased to this worker until `leased_until_ms`
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedRequest {
    /// Identity used to acknowledge the element
    pub element_id: ElementId,

    /// Decoded request
    pub request: Request,

    /// The element becomes ready again at this time unless acked
    pub leased_until_ms: i64,
}

/// Counters kept by one queue handle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub pushed: u64,
    pub leased: u64,
    pub acked: u64,
    pub poisoned: u64,
    pub last_pop_at_ms: Option<i64>,
}

pub struct WorkQueue {
    store: Arc<dyn CoordinationStore>,
    key: String,
    lease_ms: i64,
    clock: Arc<dyn Clock>,
    metrics: Arc<RwLock<QueueMetrics>>,
}

impl WorkQueue {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        lease: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            lease_ms: lease.as_millis() as i64,
            clock,
            metrics: Arc::new(RwLock::new(QueueMetrics::default())),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub const fn lease_ms(&self) -> i64 {
        self.lease_ms
    }

    /// Inserts `request` as ready now. Re-pushing an identical request
    /// resets its score instead of duplicating it.
    pub async fn push(&self, request: &Request) -> Result<ElementId, QueueError> {
        let element_id = RequestCodec::element_id(request)?;
        self.store
            .zadd(&self.key, element_id.as_bytes(), self.clock.now_ms())
            .await?;

        self.metrics.write().await.pushed += 1;
        Ok(element_id)
    }

    /// Pushes each request in order; stops at the first error
    pub async fn push_many(&self, requests: &[Request]) -> Result<usize, QueueError> {
        for request in requests {
            self.push(request).await?;
        }
        Ok(requests.len())
    }

    /// Leases up to `count` ready elements
    ///
    /// Elements that fail to decode are removed and logged so they cannot
    /// block the queue.
    pub async fn pop(&self, count: usize) -> Result<Vec<LeasedRequest>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now_ms();
        let leased_until_ms = now + self.lease_ms;
        let members = self.store.lease(&self.key, now, leased_until_ms, count).await?;

        let mut leased = Vec::with_capacity(members.len());
        let mut poisoned = 0;
        for member in members {
            match RequestCodec::decode(&member) {
                Ok(request) => leased.push(LeasedRequest {
                    element_id: ElementId::from_bytes(member),
                    request,
                    leased_until_ms,
                }),
                Err(e) => {
                    error!(
                        queue = %self.key,
                        element = %String::from_utf8_lossy(&member),
                        "❌ Dropping undecodable queue element: {}", e
                    );
                    self.store.zrem(&self.key, &member).await?;
                    poisoned += 1;
                }
            }
        }

        let mut metrics = self.metrics.write().await;
        metrics.leased += leased.len() as u64;
        metrics.poisoned += poisoned;
        metrics.last_pop_at_ms = Some(now);
        drop(metrics);

        debug!(queue = %self.key, leased = leased.len(), "popped");
        Ok(leased)
    }

    /// Permanently removes an element; `false` if it was already gone
    pub async fn ack(&self, element_id: &ElementId) -> Result<bool, QueueError> {
        let removed = self.store.zrem(&self.key, element_id.as_bytes()).await?;
        if removed {
            self.metrics.write().await.acked += 1;
        }
        Ok(removed)
    }

    /// Size of the ready set
    pub async fn len(&self) -> Result<u64, QueueError> {
        Ok(self.store.zcount(&self.key, i64::MIN, self.clock.now_ms()).await?)
    }

    /// Ready plus leased elements
    pub async fn total_len(&self) -> Result<u64, QueueError> {
        Ok(self.store.zcard(&self.key).await?)
    }

    pub async fn metrics(&self) -> QueueMetrics {
        self.metrics.read().await.clone()
    }
}
