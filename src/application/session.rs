//! # Crawl Session
//!
//! One crawl round for one source. The session constructs and owns every
//! coordination component for the round, so nothing outlives it:
//!
//! - `open` checks the shared store, loads the cursor and starts reporting
//! - `schedule` / `next_batch` / `complete` drive the leased queue
//! - `handle_item` runs item dedup, delivery and cursor tracking
//! - `close` persists the cursor and flushes the reporter
//!
//! Store unavailability and a missing production cursor abort `open`.
//! Everything after that fails per request or per item.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::cursor_tracker::{CursorError, CursorSource, CursorTracker};
use crate::application::dedup_chain::{DedupChain, DedupError, DedupVerdict};
use crate::application::proxy_pool::{ProxyError, ProxyProvider};
use crate::application::scheduler::{ScheduleError, Scheduler, SchedulerStats};
use crate::application::work_queue::{LeasedRequest, WorkQueue};
use crate::domain::{
    Clock, CrawledItem, DropReason, FingerprintError, Request, RoundOutcome, Severity, SystemClock,
};
use crate::infrastructure::{
    AppConfig, CoordinationStore, CursorRepository, RemoteAuthority, RemoteError, ReportError,
    RepositoryError, RoundReporter, SqlCursorRepository, StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Session is not tracking a cursor")]
    NotIncremental,

    #[error("Session already closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
#[error("Item sink rejected item: {0}")]
pub struct SinkError(pub String);

/// Downstream consumer of deduplicated items
#[async_trait]
pub trait ItemSink: Send + Sync {
    async fn deliver(&self, item: &CrawledItem) -> Result<(), SinkError>;
}

/// Sink that only logs each delivered item
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ItemSink for LogSink {
    async fn deliver(&self, item: &CrawledItem) -> Result<(), SinkError> {
        info!(
            source_url = ?item.source_url,
            increment_id = ?item.increment_id,
            fields = item.fields.len(),
            "📦 Item delivered"
        );
        Ok(())
    }
}

/// What happened to one extracted item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Delivered,
    Dropped(DropReason),
}

/// Collaborators handed to [`CrawlSession::open`]
pub struct SessionParts {
    pub store: Arc<dyn CoordinationStore>,
    pub sink: Arc<dyn ItemSink>,
    pub clock: Arc<dyn Clock>,

    /// Overrides the repository built from `cursor.database_url`
    pub cursor_repository: Option<Arc<dyn CursorRepository>>,

    /// Overrides the authority selected by the source locale
    pub remote: Option<RemoteAuthority>,
}

impl SessionParts {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, sink: Arc<dyn ItemSink>) -> Self {
        Self {
            store,
            sink,
            clock: Arc::new(SystemClock),
            cursor_repository: None,
            remote: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_cursor_repository(mut self, repository: Arc<dyn CursorRepository>) -> Self {
        self.cursor_repository = Some(repository);
        self
    }

    #[must_use]
    pub fn with_remote(mut self, remote: RemoteAuthority) -> Self {
        self.remote = Some(remote);
        self
    }
}

/// End-of-round report returned by [`CrawlSession::close`]
#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub session_id: Uuid,
    pub source: String,
    pub scheduler: SchedulerStats,
    pub delivered: u64,
    pub dropped: u64,
    pub cursor: Option<RoundOutcome>,
    pub elapsed: Duration,
}

pub struct CrawlSession {
    id: Uuid,
    source: String,
    pop_batch: usize,
    scheduler: Scheduler,
    dedup: Arc<DedupChain>,
    proxies: ProxyProvider,
    cursor: Option<Mutex<CursorTracker>>,
    sink: Arc<dyn ItemSink>,
    reporter: RoundReporter,
    clock: Arc<dyn Clock>,
    item_max_age: Option<Duration>,
    record_expired: bool,
    delivered: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
    started: Instant,
}

impl CrawlSession {
    /// Builds every component for one round and checks its preconditions
    pub async fn open(config: &AppConfig, parts: SessionParts) -> Result<Self, SessionError> {
        let id = Uuid::new_v4();
        let source = config.source.name.clone();
        info!(session_id = %id, source = %source, "🚀 Opening crawl session");

        let SessionParts {
            store,
            sink,
            clock,
            cursor_repository,
            remote,
        } = parts;

        store.ping().await.map_err(|e| {
            error!(session_id = %id, "❌ Shared store unreachable: {}", e);
            SessionError::StoreUnavailable(e)
        })?;

        let keys = config.store.key_space(&source);
        let remote = match remote {
            Some(remote) => remote,
            None => RemoteAuthority::for_locale(
                config.source.locale,
                config.dedup.remote_endpoint.as_deref(),
                Duration::from_secs(config.dedup.remote_timeout_secs),
            )?,
        };

        let dedup = Arc::new(DedupChain::new(
            Arc::clone(&store),
            keys.dedup(),
            config.dedup.policy()?,
            remote,
            Arc::clone(&clock),
        ));
        let queue = WorkQueue::new(
            Arc::clone(&store),
            keys.queue(),
            Duration::from_millis(config.queue.lease_ms),
            Arc::clone(&clock),
        );
        let proxies = ProxyProvider::from_config(
            &config.proxy,
            keys.proxy_pool(),
            Arc::clone(&store),
            Arc::clone(&clock),
        )?;

        let cursor = if config.cursor.enabled {
            let cursor_source = if config.cursor.production {
                let repository: Arc<dyn CursorRepository> = match cursor_repository {
                    Some(repository) => repository,
                    None => Arc::new(SqlCursorRepository::connect(&config.cursor.database_url).await?),
                };
                CursorSource::Repository(repository)
            } else {
                CursorSource::Mock(config.cursor.mock_cursor)
            };

            let mut tracker = CursorTracker::with_offsets(
                config.source.site_id,
                &config.cursor.cursor_name,
                &source,
                config.cursor.offset_back,
                config.cursor.offset_forward,
                cursor_source,
            )?;
            tracker.load().await?;
            Some(Mutex::new(tracker))
        } else {
            None
        };

        let reporter = RoundReporter::from_config(&config.reporter, &config.source)?;
        reporter.open();

        info!(session_id = %id, source = %source, queue = %keys.queue(), "✅ Crawl session open");
        Ok(Self {
            id,
            source,
            pop_batch: config.queue.pop_batch,
            scheduler: Scheduler::new(Arc::clone(&dedup), queue),
            dedup,
            proxies,
            cursor,
            sink,
            reporter,
            clock,
            item_max_age: config.dedup.item_max_age(),
            record_expired: config.dedup.record_expired,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            started: Instant::now(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub const fn pop_batch(&self) -> usize {
        self.pop_batch
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub const fn proxies(&self) -> &ProxyProvider {
        &self.proxies
    }

    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.cursor.is_some()
    }

    /// Queues a request unless it was seen; `false` when filtered
    pub async fn schedule(&self, request: &Request) -> Result<bool, SessionError> {
        let queued = self.scheduler.enqueue(request).await?;
        if queued {
            self.reporter.request_scheduled();
        }
        Ok(queued)
    }

    /// Schedules one request per ID in the cursor window
    pub async fn seed_window(&self, url_template: &str) -> Result<usize, SessionError> {
        let tracker = self.cursor.as_ref().ok_or(SessionError::NotIncremental)?;
        let requests = tracker.lock().await.requests_for_window(url_template)?;

        let mut scheduled = 0;
        for request in &requests {
            if self.schedule(request).await? {
                scheduled += 1;
            }
        }
        info!(
            session_id = %self.id,
            probed = requests.len(),
            scheduled,
            "🔢 Cursor window seeded"
        );
        Ok(scheduled)
    }

    pub async fn next_batch(&self, count: usize) -> Result<Vec<LeasedRequest>, SessionError> {
        Ok(self.scheduler.next_batch(count).await?)
    }

    /// Attaches a proxy if the request needs one
    pub async fn prepare(&self, request: &mut Request) -> Result<bool, SessionError> {
        Ok(self.proxies.assign(request).await?)
    }

    pub async fn rotate_proxy(&self, request: &mut Request) -> Result<(), SessionError> {
        Ok(self.proxies.rotate(request).await?)
    }

    /// Acknowledges a successfully processed request
    pub async fn complete(&self, leased: &LeasedRequest) -> Result<bool, SessionError> {
        Ok(self.scheduler.ack(&leased.element_id).await?)
    }

    /// Filters an extracted item by age and dedup, then delivers it downstream
    pub async fn handle_item(&self, item: CrawledItem) -> Result<ItemOutcome, SessionError> {
        if let (Some(tracker), Some(candidate)) = (&self.cursor, item.cursor_candidate()) {
            tracker.lock().await.observe(candidate);
        }

        if let Some(max_age) = self.item_max_age {
            if item.is_expired(self.clock.now_ms(), max_age) {
                if self.record_expired {
                    if let Some(fingerprint) = item.dedup_key(self.dedup.policy())? {
                        self.dedup.record_delivered(&fingerprint).await;
                    }
                }
                return Ok(self.drop_item(DropReason::Expired, item.source_url.as_deref()));
            }
        }

        let fingerprint = match self.dedup.check_item(&item).await? {
            DedupVerdict::Duplicate { tier, .. } => {
                return Ok(self.drop_item(tier.drop_reason(), item.source_url.as_deref()));
            }
            DedupVerdict::New(fingerprint) => Some(fingerprint),
            DedupVerdict::Unfiltered => None,
        };

        self.sink.deliver(&item).await?;
        if let Some(fingerprint) = fingerprint {
            self.dedup.confirm_item(&fingerprint).await;
        }
        self.reporter.item_delivered(&item).await;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(ItemOutcome::Delivered)
    }

    fn drop_item(&self, reason: DropReason, source_url: Option<&str>) -> ItemOutcome {
        match reason.severity() {
            Severity::Loud => warn!(source_url, "⚠️ Item dropped: {}", reason),
            Severity::Silent => debug!(source_url, "item dropped: {}", reason),
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        ItemOutcome::Dropped(reason)
    }

    /// Current cursor high-water mark, if incremental
    pub async fn cursor(&self) -> Option<i64> {
        match &self.cursor {
            Some(tracker) => tracker.lock().await.cursor(),
            None => None,
        }
    }

    /// Ends the round: persists the cursor, then flushes the reporter
    pub async fn close(&self) -> Result<RoundSummary, SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Closed);
        }

        let cursor = match &self.cursor {
            Some(tracker) => Some(tracker.lock().await.finish().await),
            None => None,
        };
        self.reporter.close().await;
        let cursor = cursor.transpose()?;

        let summary = RoundSummary {
            session_id: self.id,
            source: self.source.clone(),
            scheduler: self.scheduler.stats(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            cursor,
            elapsed: self.started.elapsed(),
        };
        info!(
            session_id = %self.id,
            delivered = summary.delivered,
            dropped = summary.dropped,
            enqueued = summary.scheduler.enqueued,
            filtered = summary.scheduler.filtered,
            cursor = ?summary.cursor,
            "🏁 Crawl session closed in {:?}", summary.elapsed
        );
        Ok(summary)
    }
}
