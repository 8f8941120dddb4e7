//! Three-tier dedup chain
//!
//! Tiers are consulted in order and the first hit wins:
//! 1. in-process set, valid for this session only
//! 2. shared fingerprint store, valid across workers and rounds
//! 3. remote authority, for the final item-level decision only
//!
//! Checks never write to either set. Callers remember a request once it is
//! queued and confirm an item once it is delivered, so a failed push or
//! delivery can be retried. Two workers racing on a brand-new URL may both
//! pass.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::domain::{
    CanonicalPolicy, Clock, CrawledItem, DropReason, Fingerprint, FingerprintError, Request,
};
use crate::infrastructure::{CoordinationStore, RemoteAuthority, RemoteError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("Fingerprint store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cannot derive fingerprint: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Remote authority error: {0}")]
    Remote(#[from] RemoteError),
}

/// Tier that recognised a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupTier {
    Memory,
    Store,
    Remote,
}

impl DedupTier {
    #[must_use]
    pub const fn drop_reason(self) -> DropReason {
        match self {
            Self::Memory => DropReason::SeenInProcess,
            Self::Store => DropReason::SeenInStore,
            Self::Remote => DropReason::SeenByRemote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    /// No dedup key: `dont_filter` requests and keyless items
    Unfiltered,

    /// Not seen by any tier
    New(Fingerprint),

    Duplicate {
        fingerprint: Fingerprint,
        tier: DedupTier,
    },
}

impl DedupVerdict {
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    #[must_use]
    pub const fn fingerprint(&self) -> Option<Fingerprint> {
        match self {
            Self::Unfiltered => None,
            Self::New(fingerprint) | Self::Duplicate { fingerprint, .. } => Some(*fingerprint),
        }
    }
}

pub struct DedupChain {
    store: Arc<dyn CoordinationStore>,
    key: String,
    policy: CanonicalPolicy,
    remote: RemoteAuthority,
    clock: Arc<dyn Clock>,
    seen_requests: Mutex<HashSet<Fingerprint>>,
    seen_items: Mutex<HashSet<Fingerprint>>,
}

impl DedupChain {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        policy: CanonicalPolicy,
        remote: RemoteAuthority,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            policy,
            remote,
            clock,
            seen_requests: Mutex::new(HashSet::new()),
            seen_items: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &CanonicalPolicy {
        &self.policy
    }

    /// Tiers 1 and 2 for a candidate request
    pub async fn check_request(&self, request: &Request) -> Result<DedupVerdict, DedupError> {
        let Some(fingerprint) = request.dedup_key(&self.policy)? else {
            return Ok(DedupVerdict::Unfiltered);
        };

        if let Some(verdict) = self.check_local(&self.seen_requests, fingerprint).await? {
            debug!(url = %request.url, ?verdict, "request filtered");
            return Ok(verdict);
        }

        Ok(DedupVerdict::New(fingerprint))
    }

    /// Marks a queued request as seen for the rest of the session
    pub fn remember_request(&self, fingerprint: Fingerprint) {
        remember(&self.seen_requests, fingerprint);
    }

    /// Convenience form of [`Self::check_request`]
    pub async fn is_duplicate(&self, request: &Request) -> Result<bool, DedupError> {
        Ok(self.check_request(request).await?.is_duplicate())
    }

    /// All three tiers for an extracted item
    ///
    /// A remote hit back-fills the fingerprint store so later rounds stop
    /// at tier 2.
    pub async fn check_item(&self, item: &CrawledItem) -> Result<DedupVerdict, DedupError> {
        let Some(fingerprint) = item.dedup_key(&self.policy)? else {
            return Ok(DedupVerdict::Unfiltered);
        };

        if let Some(verdict) = self.check_local(&self.seen_items, fingerprint).await? {
            debug!(source_url = ?item.source_url, ?verdict, "item filtered");
            return Ok(verdict);
        }

        if let (true, Some(url)) = (self.remote.is_enabled(), item.source_url.as_deref()) {
            if self.remote.exists(url).await? {
                warn!(
                    url,
                    fingerprint = %fingerprint,
                    "⚠️ Remote authority knows an item missing from the fingerprint store"
                );
                self.record_delivered(&fingerprint).await;
                return Ok(DedupVerdict::Duplicate {
                    fingerprint,
                    tier: DedupTier::Remote,
                });
            }
        }

        Ok(DedupVerdict::New(fingerprint))
    }

    /// Tier-1 and tier-2 write for a delivered item
    ///
    /// Recording failures are logged by [`Self::record_delivered`]; tier 1
    /// is updated either way so this process stops re-delivering it.
    pub async fn confirm_item(&self, fingerprint: &Fingerprint) {
        remember(&self.seen_items, *fingerprint);
        self.record_delivered(fingerprint).await;
    }

    /// Adds the fingerprint if absent, scored by discovery time
    pub async fn record(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        self.store
            .zadd_nx(&self.key, fingerprint.member().as_bytes(), self.clock.now_ms())
            .await
    }

    /// [`Self::record`] for the post-delivery path, where failure is only logged
    pub async fn record_delivered(&self, fingerprint: &Fingerprint) {
        if let Err(e) = self.record(fingerprint).await {
            warn!(fingerprint = %fingerprint, "Failed to record delivered fingerprint: {}", e);
        }
    }

    async fn check_local(
        &self,
        seen: &Mutex<HashSet<Fingerprint>>,
        fingerprint: Fingerprint,
    ) -> Result<Option<DedupVerdict>, DedupError> {
        let in_memory = seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&fingerprint);
        if in_memory {
            return Ok(Some(DedupVerdict::Duplicate {
                fingerprint,
                tier: DedupTier::Memory,
            }));
        }

        let stored = self
            .store
            .zscore(&self.key, fingerprint.member().as_bytes())
            .await?;
        if stored.is_some() {
            return Ok(Some(DedupVerdict::Duplicate {
                fingerprint,
                tier: DedupTier::Store,
            }));
        }

        Ok(None)
    }
}

fn remember(seen: &Mutex<HashSet<Fingerprint>>, fingerprint: Fingerprint) {
    seen.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(fingerprint);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MockClock;
    use crate::infrastructure::MemoryStore;

    fn chain(store: Arc<MemoryStore>) -> DedupChain {
        DedupChain::new(
            store,
            "dedup:test",
            CanonicalPolicy::default(),
            RemoteAuthority::Disabled,
            Arc::new(MockClock::at_millis(5_000)),
        )
    }

    #[tokio::test]
    async fn unfiltered_requests_skip_every_tier() {
        let chain = chain(Arc::new(MemoryStore::new()));
        let request = Request::get("https://x.test/a").unfiltered();
        assert_eq!(chain.check_request(&request).await.unwrap(), DedupVerdict::Unfiltered);
        assert_eq!(chain.check_request(&request).await.unwrap(), DedupVerdict::Unfiltered);
    }

    #[tokio::test]
    async fn record_uses_discovery_time_and_never_overwrites() {
        let store = Arc::new(MemoryStore::new());
        let chain = chain(Arc::clone(&store));
        let fingerprint = Fingerprint::of_cursor(42);

        assert!(chain.record(&fingerprint).await.unwrap());
        assert!(!chain.record(&fingerprint).await.unwrap());
        assert_eq!(store.zscore("dedup:test", b"42").await.unwrap(), Some(5_000));
    }

    #[tokio::test]
    async fn request_and_item_sets_are_independent() {
        let chain = chain(Arc::new(MemoryStore::new()));
        let url = "https://x.test/detail/1";

        assert!(matches!(
            chain.check_request(&Request::get(url)).await.unwrap(),
            DedupVerdict::New(_)
        ));
        assert!(matches!(
            chain.check_item(&CrawledItem::from_url(url)).await.unwrap(),
            DedupVerdict::New(_)
        ));
    }

    #[tokio::test]
    async fn checks_leave_tier_one_untouched_until_confirmed() {
        let chain = chain(Arc::new(MemoryStore::new()));
        let request = Request::get("https://x.test/list");
        let item = CrawledItem::from_url("https://x.test/detail/2");

        for _ in 0..2 {
            assert!(matches!(chain.check_request(&request).await.unwrap(), DedupVerdict::New(_)));
            assert!(matches!(chain.check_item(&item).await.unwrap(), DedupVerdict::New(_)));
        }

        let request_key = request.dedup_key(chain.policy()).unwrap().unwrap();
        chain.remember_request(request_key);
        assert_eq!(
            chain.check_request(&request).await.unwrap(),
            DedupVerdict::Duplicate { fingerprint: request_key, tier: DedupTier::Memory }
        );

        let item_key = item.dedup_key(chain.policy()).unwrap().unwrap();
        chain.confirm_item(&item_key).await;
        assert_eq!(
            chain.check_item(&item).await.unwrap(),
            DedupVerdict::Duplicate { fingerprint: item_key, tier: DedupTier::Memory }
        );
    }

    #[test]
    fn tiers_map_to_drop_reasons() {
        assert_eq!(DedupTier::Remote.drop_reason(), DropReason::SeenByRemote);
        assert_eq!(DedupTier::Store.drop_reason(), DropReason::SeenInStore);
        assert_eq!(DedupTier::Memory.drop_reason(), DropReason::SeenInProcess);
    }
}
