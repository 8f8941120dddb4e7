//! Extracted items and the reasons they get dropped before delivery

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fingerprint::{CanonicalPolicy, Fingerprint, FingerprintError};

/// Record produced by downstream extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawledItem {
    /// Page the item was extracted from
    pub source_url: Option<String>,

    /// Incremental ID; doubles as the cursor candidate
    pub increment_id: Option<i64>,

    pub publish_time: Option<DateTime<Utc>>,

    pub fields: BTreeMap<String, serde_json::Value>,
}

impl CrawledItem {
    #[must_use]
    pub fn from_url(source_url: impl Into<String>) -> Self {
        Self {
            source_url: Some(source_url.into()),
            increment_id: None,
            publish_time: None,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn with_increment_id(mut self, id: i64) -> Self {
        self.increment_id = Some(id);
        self
    }

    #[must_use]
    pub const fn with_publish_time(mut self, publish_time: DateTime<Utc>) -> Self {
        self.publish_time = Some(publish_time);
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Cursor value this item proposes to the tracker
    #[must_use]
    pub const fn cursor_candidate(&self) -> Option<i64> {
        self.increment_id
    }

    /// Whether the item was published more than `max_age` before `now_ms`
    ///
    /// Items without a publish time never expire.
    #[must_use]
    pub fn is_expired(&self, now_ms: i64, max_age: Duration) -> bool {
        let cutoff = now_ms.saturating_sub(max_age.as_millis() as i64);
        self.publish_time
            .is_some_and(|published| published.timestamp_millis() < cutoff)
    }

    /// Incremental ID when present, otherwise the canonical source URL hash
    pub fn dedup_key(&self, policy: &CanonicalPolicy) -> Result<Option<Fingerprint>, FingerprintError> {
        if let Some(id) = self.increment_id {
            return Ok(Some(Fingerprint::of_cursor(id)));
        }
        self.source_url
            .as_deref()
            .map(|url| policy.fingerprint(url))
            .transpose()
    }
}

/// How loudly a drop should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Expected; logged at debug
    Silent,
    /// Unexpected; logged at warn
    Loud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SeenInProcess,
    SeenInStore,
    SeenByRemote,
    /// Published outside the accepted age window
    Expired,
}

impl DropReason {
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::SeenByRemote => Severity::Loud,
            Self::SeenInProcess | Self::SeenInStore | Self::Expired => Severity::Silent,
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::SeenInProcess => "duplicate within this process",
            Self::SeenInStore => "duplicate in fingerprint store",
            Self::SeenByRemote => "duplicate reported by remote authority",
            Self::Expired => "published too long ago",
        };
        f.write_str(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_id_wins_over_source_url() {
        let policy = CanonicalPolicy::default();
        let item = CrawledItem::from_url("https://x.test/detail/9").with_increment_id(9);
        assert_eq!(item.dedup_key(&policy).unwrap(), Some(Fingerprint::Cursor(9)));
        assert_eq!(item.cursor_candidate(), Some(9));

        let by_url = CrawledItem::from_url("https://x.test/detail/9#body");
        assert_eq!(
            by_url.dedup_key(&policy).unwrap(),
            Some(policy.fingerprint("https://x.test/detail/9").unwrap())
        );
    }

    #[test]
    fn only_remote_duplicates_are_loud() {
        assert_eq!(DropReason::SeenByRemote.severity(), Severity::Loud);
        assert_eq!(DropReason::SeenInStore.severity(), Severity::Silent);
        assert_eq!(DropReason::SeenInProcess.severity(), Severity::Silent);
        assert_eq!(DropReason::Expired.severity(), Severity::Silent);
    }

    #[test]
    fn expiry_compares_publish_time_to_the_window() {
        let now = DateTime::parse_from_rfc3339("2024-05-04T12:00:00Z").unwrap().with_timezone(&Utc);
        let window = Duration::from_secs(72 * 3600);
        let item = |hours_ago: i64| {
            CrawledItem::from_url("https://x.test/a").with_publish_time(now - chrono::Duration::hours(hours_ago))
        };

        assert!(!item(71).is_expired(now.timestamp_millis(), window));
        assert!(!item(72).is_expired(now.timestamp_millis(), window));
        assert!(item(73).is_expired(now.timestamp_millis(), window));
        assert!(!CrawledItem::from_url("https://x.test/b").is_expired(now.timestamp_millis(), window));
    }
}
