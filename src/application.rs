//! Application layer module
//!
//! This module contains the coordination components that workers share
//! through the store, and the session and worker that orchestrate them.

pub mod cursor_tracker;  // Incremental high-water mark
pub mod dedup_chain;     // Three-tier duplicate filter
pub mod proxy_pool;      // Cached proxy leasing
pub mod scheduler;       // Dedup in front of the queue
pub mod session;         // Per-round lifecycle
pub mod work_queue;      // Leased score-ordered queue
pub mod worker;          // Concurrent fetch loop

pub use cursor_tracker::{CursorError, CursorSource, CursorTracker, SeedOutcome, seed_cursor};
pub use dedup_chain::{DedupChain, DedupError, DedupTier, DedupVerdict};
pub use proxy_pool::{ProxyError, ProxyPoolSettings, ProxyProvider, RotatingProxyPool, TunnelProxy};
pub use scheduler::{ScheduleError, Scheduler, SchedulerStats};
pub use session::{
    CrawlSession, ItemOutcome, ItemSink, LogSink, RoundSummary, SessionError, SessionParts, SinkError,
};
pub use work_queue::{LeasedRequest, QueueError, QueueMetrics, WorkQueue};
pub use worker::{FetchError, FetchOutput, Fetcher, Worker, WorkerSettings, WorkerStats};
