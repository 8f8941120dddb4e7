//! Crawl Coord - coordination layer for distributed crawl workers
//!
//! Workers share four pieces of state through a sorted-set store:
//! a leased work queue, a fingerprint dedup chain, a pool of rotating
//! egress proxies and, for incremental crawls, a persisted cursor.
//!
//! ```no_run
//! use std::sync::Arc;
//! use crawl_coord::{AppConfig, CrawlSession, LogSink, RedisStore, SessionParts};
//!
//! # async fn round() -> anyhow::Result<()> {
//! let config = AppConfig::default();
//! let store = Arc::new(RedisStore::connect(&config.store.redis_url).await?);
//! let session = CrawlSession::open(&config, SessionParts::new(store, Arc::new(LogSink))).await?;
//! session.schedule(&crawl_coord::Request::get("https://example.com/")).await?;
//! let summary = session.close().await?;
//! println!("{summary:?}");
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{
    CrawlSession, CursorTracker, DedupChain, FetchError, FetchOutput, Fetcher, ItemOutcome, ItemSink, LogSink,
    ProxyProvider, RoundSummary, Scheduler, SessionError, SessionParts, WorkQueue, Worker, WorkerSettings,
};
pub use domain::{CanonicalPolicy, Clock, CrawledItem, Fingerprint, ProxyEndpoint, Request};
pub use infrastructure::{AppConfig, ConfigManager, CoordinationStore, MemoryStore, RedisStore};
