//! # Proxy Lease Pool
//!
//! Workers lease egress proxies from the shared `proxies_pool` sorted set
//! through a bounded local FIFO cache.
//!
//! - The oldest cached lease is handed out first; leases older than the TTL
//!   are discarded on the way.
//! - An empty cache triggers a single-flight refill: one caller pulls up to
//!   `prefetch` endpoints with an atomic pop-minimum while the rest wait on
//!   the refill gate and then re-check the cache.
//! - An empty shared pool is not an error. The refilling caller backs off
//!   and tries again until endpoints appear.
//!
//! Leases are consumed, never returned to the pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::domain::{Clock, ProxyEndpoint, ProxyLease, Request};
use crate::infrastructure::config::{ProxyConfig, ProxyMode};
use crate::infrastructure::{CoordinationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Proxy pool store error: {0}")]
    Store(#[from] StoreError),

    #[error("Proxy refill gate closed")]
    Closed,

    #[error("Tunnel mode requires a tunnel endpoint")]
    MissingTunnelEndpoint,
}

/// Tuning for [`RotatingProxyPool`]
#[derive(Debug, Clone)]
pub struct ProxyPoolSettings {
    /// Lease validity measured from issue time
    pub ttl: Duration,

    /// Endpoints pulled per refill; also the cache bound
    pub prefetch: usize,

    /// Back-off after an empty refill
    pub empty_wait: Duration,

    /// Consecutive empty refills logged at warn before switching to error
    pub escalate_after: u32,
}

impl From<&ProxyConfig> for ProxyPoolSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            ttl: Duration::from_millis(config.ttl_ms),
            prefetch: config.prefetch.max(1),
            empty_wait: Duration::from_millis(config.empty_wait_ms),
            escalate_after: config.escalate_after,
        }
    }
}

impl Default for ProxyPoolSettings {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

pub struct RotatingProxyPool {
    store: Arc<dyn CoordinationStore>,
    pool_key: String,
    settings: ProxyPoolSettings,
    clock: Arc<dyn Clock>,
    cache: Mutex<VecDeque<ProxyLease>>,
    refill_gate: Semaphore,
    empty_refills: AtomicU32,
}

impl RotatingProxyPool {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        pool_key: impl Into<String>,
        settings: ProxyPoolSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            pool_key: pool_key.into(),
            cache: Mutex::new(VecDeque::with_capacity(settings.prefetch)),
            settings,
            clock,
            refill_gate: Semaphore::new(1),
            empty_refills: AtomicU32::new(0),
        }
    }

    /// Returns a valid proxy, waiting for the shared pool if necessary
    pub async fn get_lease(&self) -> Result<ProxyEndpoint, ProxyError> {
        loop {
            if let Some(lease) = self.take_valid() {
                return Ok(lease.endpoint);
            }

            let _permit = self.refill_gate.acquire().await.map_err(|_| ProxyError::Closed)?;

            // Another caller may have refilled while we waited
            if let Some(lease) = self.take_valid() {
                return Ok(lease.endpoint);
            }

            if self.refill().await? > 0 {
                self.empty_refills.store(0, Ordering::Relaxed);
                continue;
            }

            let streak = self.empty_refills.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= self.settings.escalate_after {
                error!(
                    pool = %self.pool_key,
                    streak,
                    "❌ Proxy pool still empty, retrying in {:?}", self.settings.empty_wait
                );
            } else {
                warn!(
                    pool = %self.pool_key,
                    streak,
                    "Proxy pool empty, retrying in {:?}", self.settings.empty_wait
                );
            }
            tokio::time::sleep(self.settings.empty_wait).await;
        }
    }

    /// Producer side: adds endpoints not already pooled, issued now
    pub async fn publish(&self, endpoints: &[ProxyEndpoint]) -> Result<usize, ProxyError> {
        let issued_at = self.clock.now_ms();
        let mut added = 0;
        for endpoint in endpoints {
            if self
                .store
                .zadd_nx(&self.pool_key, endpoint.as_str().as_bytes(), issued_at)
                .await?
            {
                added += 1;
            }
        }
        info!(pool = %self.pool_key, added, "published proxies");
        Ok(added)
    }

    /// Leases currently held in the local cache
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn take_valid(&self) -> Option<ProxyLease> {
        let now = self.clock.now_ms();
        let ttl_ms = self.settings.ttl.as_millis() as i64;
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some(lease) = cache.pop_front() {
            if lease.is_expired(now, ttl_ms) {
                debug!(proxy = %lease.endpoint, issued_at_ms = lease.issued_at_ms, "discarding expired proxy lease");
                continue;
            }
            return Some(lease);
        }
        None
    }

    async fn refill(&self) -> Result<usize, ProxyError> {
        let wanted = self.settings.prefetch.saturating_sub(self.cached()).max(1);
        let popped = self.store.zpopmin(&self.pool_key, wanted).await?;

        let leases: Vec<ProxyLease> = popped
            .into_iter()
            .filter_map(|(member, issued_at_ms)| match String::from_utf8(member) {
                Ok(endpoint) => Some(ProxyLease::new(ProxyEndpoint::new(endpoint), issued_at_ms)),
                Err(e) => {
                    warn!(pool = %self.pool_key, "Skipping non UTF-8 proxy entry: {}", e);
                    None
                }
            })
            .collect();

        let pulled = leases.len();
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(leases);
        debug!(pool = %self.pool_key, pulled, "proxy cache refilled");
        Ok(pulled)
    }
}

/// One fixed endpoint for every request
#[derive(Debug, Clone)]
pub struct TunnelProxy {
    endpoint: ProxyEndpoint,
}

impl TunnelProxy {
    #[must_use]
    pub const fn new(endpoint: ProxyEndpoint) -> Self {
        Self { endpoint }
    }

    #[must_use]
    pub const fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }
}

/// Proxy strategy selected by [`ProxyMode`]
pub enum ProxyProvider {
    Rotating(RotatingProxyPool),
    Tunnel(TunnelProxy),
}

impl ProxyProvider {
    pub fn from_config(
        config: &ProxyConfig,
        pool_key: &str,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProxyError> {
        match config.mode {
            ProxyMode::Rotating => Ok(Self::Rotating(RotatingProxyPool::new(
                store,
                pool_key,
                ProxyPoolSettings::from(config),
                clock,
            ))),
            ProxyMode::Tunnel => {
                let endpoint = config
                    .tunnel_endpoint
                    .as_deref()
                    .ok_or(ProxyError::MissingTunnelEndpoint)?;
                Ok(Self::Tunnel(TunnelProxy::new(ProxyEndpoint::new(endpoint))))
            }
        }
    }

    pub async fn get_lease(&self) -> Result<ProxyEndpoint, ProxyError> {
        match self {
            Self::Rotating(pool) => pool.get_lease().await,
            Self::Tunnel(tunnel) => Ok(tunnel.endpoint.clone()),
        }
    }

    /// Attaches a proxy when the request needs one and has none yet.
    /// Tunnel mode proxies every request.
    pub async fn assign(&self, request: &mut Request) -> Result<bool, ProxyError> {
        if request.proxy.is_some() {
            return Ok(false);
        }
        match self {
            Self::Tunnel(tunnel) => request.proxy = Some(tunnel.endpoint.clone()),
            Self::Rotating(pool) => {
                if !request.needs_proxy() {
                    return Ok(false);
                }
                request.proxy = Some(pool.get_lease().await?);
            }
        }
        Ok(true)
    }

    /// Replaces the request's proxy after a transport failure
    pub async fn rotate(&self, request: &mut Request) -> Result<(), ProxyError> {
        let previous = request.proxy.take();
        let next = self.get_lease().await?;
        debug!(url = %request.url, ?previous, proxy = %next, "rotated proxy");
        request.proxy = Some(next);
        Ok(())
    }

    #[must_use]
    pub fn cached(&self) -> usize {
        match self {
            Self::Rotating(pool) => pool.cached(),
            Self::Tunnel(_) => 0,
        }
    }

    #[must_use]
    pub const fn as_rotating(&self) -> Option<&RotatingProxyPool> {
        match self {
            Self::Rotating(pool) => Some(pool),
            Self::Tunnel(_) => None,
        }
    }
}
