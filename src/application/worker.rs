//! # Worker
//!
//! Drives a [`CrawlSession`]: leases batches, fetches them concurrently
//! through an external [`Fetcher`] and acknowledges what succeeded.
//!
//! Failure handling per request:
//! - transport errors rotate the proxy and retry up to `max_retries`, then
//!   the request is left unacked and redelivers after its lease
//! - handler errors are acked and dropped
//! - store errors while scheduling follow-ups or handling items leave the
//!   request unacked
//!
//! Store errors while popping back off with jitter; `max_store_errors` in a
//! row stop the worker.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::session::{CrawlSession, SessionError};
use crate::application::work_queue::LeasedRequest;
use crate::domain::{CrawledItem, Request};
use crate::infrastructure::config::{AppConfig, WorkerConfig};

/// One product of a fetch
#[derive(Debug, Clone)]
pub enum FetchOutput {
    /// Follow-up request to schedule
    Request(Request),

    /// Extracted item for dedup and delivery
    Item(CrawledItem),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network-level failure; retried with a fresh proxy
    #[error("Transport error: {0}")]
    Transport(String),

    /// The response was fetched but could not be handled
    #[error("Handler error: {0}")]
    Handler(String),
}

/// HTTP transport and response handling, supplied by the embedding crawler
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Vec<FetchOutput>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub pop_batch: usize,
    pub max_retries: u32,
    pub requests_per_second: u32,
    pub idle_wait: Duration,
    pub max_idle_polls: u32,
    pub store_backoff_base: Duration,
    pub store_backoff_max: Duration,
    pub max_store_errors: u32,
}

impl WorkerSettings {
    #[must_use]
    pub fn from_config(worker: &WorkerConfig, pop_batch: usize) -> Self {
        Self {
            concurrency: worker.concurrency.max(1),
            pop_batch: pop_batch.max(1),
            max_retries: worker.max_retries,
            requests_per_second: worker.requests_per_second,
            idle_wait: Duration::from_millis(worker.idle_wait_ms),
            max_idle_polls: worker.max_idle_polls,
            store_backoff_base: Duration::from_millis(worker.store_backoff_base_ms),
            store_backoff_max: Duration::from_millis(worker.store_backoff_max_ms),
            max_store_errors: worker.max_store_errors,
        }
    }

    /// Exponential back-off for the `attempt`-th consecutive store error, plus up to 20% jitter
    #[must_use]
    pub fn store_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.store_backoff_base.as_millis() as u64;
        let max_ms = self.store_backoff_max.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let capped = base_ms.saturating_mul(factor).min(max_ms);
        let jitter = if capped >= 10 { fastrand::u64(0..=capped / 5) } else { 0 };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

impl From<&AppConfig> for WorkerSettings {
    fn from(config: &AppConfig) -> Self {
        Self::from_config(&config.worker, config.queue.pop_batch)
    }
}

/// Counters for one worker run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub batches: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub retries: u64,
    pub store_errors: u64,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    /// Acked after success
    Completed,

    /// Acked after a handler error
    Dropped,

    /// Left for lease redelivery
    Failed,
}

pub struct Worker {
    session: Arc<CrawlSession>,
    fetcher: Arc<dyn Fetcher>,
    settings: WorkerSettings,
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    cancel: CancellationToken,
    counters: Counters,
}

impl Worker {
    #[must_use]
    pub fn new(session: Arc<CrawlSession>, fetcher: Arc<dyn Fetcher>, settings: WorkerSettings) -> Self {
        let limiter = NonZeroU32::new(settings.requests_per_second)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));
        Self {
            session,
            fetcher,
            settings,
            limiter,
            cancel: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    /// Token that stops [`Self::run`] after the in-flight batch
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
        }
    }

    /// Processes batches until cancelled, idle for `max_idle_polls` pops,
    /// or the store keeps failing
    pub async fn run(&self) -> Result<WorkerStats, SessionError> {
        let session_id = self.session.id();
        info!(%session_id, concurrency = self.settings.concurrency, "👷 Worker started");

        let mut idle_polls = 0u32;
        let mut store_errors = 0u32;

        loop {
            let popped = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                popped = self.session.next_batch(self.settings.pop_batch) => popped,
            };

            let batch = match popped {
                Ok(batch) => {
                    store_errors = 0;
                    batch
                }
                Err(e) => {
                    store_errors += 1;
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    if self.settings.max_store_errors > 0 && store_errors >= self.settings.max_store_errors {
                        error!(%session_id, store_errors, "❌ Giving up after repeated store errors: {}", e);
                        return Err(e);
                    }
                    let delay = self.settings.store_backoff(store_errors);
                    warn!(%session_id, store_errors, "🔁 Store error while popping, retrying in {:?}: {}", delay, e);
                    if !self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                idle_polls += 1;
                if self.settings.max_idle_polls > 0 && idle_polls >= self.settings.max_idle_polls {
                    info!(%session_id, idle_polls, "Queue idle, worker stopping");
                    break;
                }
                if !self.pause(self.settings.idle_wait).await {
                    break;
                }
                continue;
            }

            idle_polls = 0;
            self.counters.batches.fetch_add(1, Ordering::Relaxed);
            debug!(%session_id, size = batch.len(), "processing batch");

            stream::iter(batch)
                .map(|leased| self.process(leased))
                .buffer_unordered(self.settings.concurrency)
                .for_each(|processed| {
                    let counter = match processed {
                        Processed::Completed => &self.counters.completed,
                        Processed::Dropped => &self.counters.dropped,
                        Processed::Failed => &self.counters.failed,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    futures::future::ready(())
                })
                .await;
        }

        let stats = self.stats();
        info!(
            %session_id,
            completed = stats.completed,
            failed = stats.failed,
            dropped = stats.dropped,
            retries = stats.retries,
            "👷 Worker stopped"
        );
        Ok(stats)
    }

    async fn process(&self, leased: LeasedRequest) -> Processed {
        let mut request = leased.request.clone();
        if let Err(e) = self.session.prepare(&mut request).await {
            warn!(url = %request.url, "Proxy assignment failed: {}", e);
            return Processed::Failed;
        }

        let mut attempt = 0u32;
        let outputs = loop {
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            match self.fetcher.fetch(&request).await {
                Ok(outputs) => break outputs,
                Err(FetchError::Handler(reason)) => {
                    warn!(url = %request.url, callback = ?request.callback, "Dropping request: {}", reason);
                    return match self.session.complete(&leased).await {
                        Ok(_) => Processed::Dropped,
                        Err(e) => {
                            warn!(url = %request.url, "Ack failed: {}", e);
                            Processed::Failed
                        }
                    };
                }
                Err(FetchError::Transport(reason)) => {
                    attempt += 1;
                    if attempt > self.settings.max_retries {
                        warn!(
                            url = %request.url,
                            attempts = attempt,
                            "Transport retries exhausted, leaving for redelivery: {}", reason
                        );
                        return Processed::Failed;
                    }
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    if request.proxy.is_some() {
                        if let Err(e) = self.session.rotate_proxy(&mut request).await {
                            warn!(url = %request.url, "Proxy rotation failed: {}", e);
                            return Processed::Failed;
                        }
                    }
                    debug!(url = %request.url, attempt, "retrying after transport error: {}", reason);
                }
            }
        };

        for output in outputs {
            let handled = match output {
                FetchOutput::Request(follow_up) => self.session.schedule(&follow_up).await.map(|_| ()),
                FetchOutput::Item(item) => self.session.handle_item(item).await.map(|_| ()),
            };
            if let Err(e) = handled {
                warn!(url = %request.url, "Output handling failed, leaving for redelivery: {}", e);
                return Processed::Failed;
            }
        }

        match self.session.complete(&leased).await {
            Ok(_) => Processed::Completed,
            Err(e) => {
                warn!(url = %request.url, "Ack failed: {}", e);
                Processed::Failed
            }
        }
    }

    /// Sleeps unless cancelled first; `false` when cancelled
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}
