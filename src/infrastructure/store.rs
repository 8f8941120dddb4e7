//! Shared coordination store
//!
//! Every cross-worker fact lives in sorted sets of the shared store:
//! - `dedup:<source>`: fingerprints scored by discovery time
//! - `requestqueue:<source>`: encoded requests scored by eligibility time
//! - `proxies_pool`: proxy endpoints scored by issue time
//!
//! Members are opaque bytes, scores are millisecond timestamps. Errors are
//! surfaced as-is; nothing here retries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed store reply: {0}")]
    Codec(String),
}

/// Sorted-set primitives the coordination components are built on
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Liveness check
    async fn ping(&self) -> Result<(), StoreError>;

    /// Inserts `member` or overwrites its score
    async fn zadd(&self, key: &str, member: &[u8], score: i64) -> Result<(), StoreError>;

    /// Inserts `member` only if absent; `true` when it was added
    async fn zadd_nx(&self, key: &str, member: &[u8], score: i64) -> Result<bool, StoreError>;

    async fn zscore(&self, key: &str, member: &[u8]) -> Result<Option<i64>, StoreError>;

    /// Removes `member`; `true` when it was present
    async fn zrem(&self, key: &str, member: &[u8]) -> Result<bool, StoreError>;

    /// Members with `min <= score <= max`. `i64::MIN`/`i64::MAX` mean unbounded.
    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Atomically removes and returns up to `count` lowest-scored members
    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(Vec<u8>, i64)>, StoreError>;

    /// Atomically selects up to `count` members scored `<= now` and rescores
    /// each to `lease_until`
    async fn lease(
        &self,
        key: &str,
        now: i64,
        lease_until: i64,
        count: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError>;
}

/// Key naming for one crawl source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpace {
    dedup: String,
    queue: String,
    proxy_pool: String,
}

impl KeySpace {
    #[must_use]
    pub fn new(dedup_prefix: &str, queue_prefix: &str, proxy_pool: &str, source: &str) -> Self {
        Self {
            dedup: format!("{dedup_prefix}:{source}"),
            queue: format!("{queue_prefix}:{source}"),
            proxy_pool: proxy_pool.to_string(),
        }
    }

    /// `dedup:<source>`, `requestqueue:<source>`, `proxies_pool`
    #[must_use]
    pub fn for_source(source: &str) -> Self {
        Self::new("dedup", "requestqueue", "proxies_pool", source)
    }

    #[must_use]
    pub fn dedup(&self) -> &str {
        &self.dedup
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub fn proxy_pool(&self) -> &str {
        &self.proxy_pool
    }
}
