//! URL canonicalization and dedup fingerprints
//!
//! - [`CanonicalPolicy`] pins how equivalent URLs collapse to one string
//! - [`Fingerprint`] is the 128-bit identity written to the fingerprint store

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Query parameters dropped by the default policy: `utm`, `utm_*`, `fbclid`, `gclid`
pub const DEFAULT_TRACKING_PATTERN: &str = r"(?i)^(utm(_.*)?|fbclid|gclid)$";

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid tracking parameter pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Canonicalization rules applied before hashing a URL
///
/// Scheme and host are lowercased and default ports dropped by URL parsing
/// itself. The policy decides what happens to query parameters and fragments.
#[derive(Debug, Clone)]
pub struct CanonicalPolicy {
    keep_fragments: bool,
    tracking_params: Option<Regex>,
}

impl CanonicalPolicy {
    /// Builds a policy; `tracking_pattern` of `None` strips no parameters
    pub fn new(keep_fragments: bool, tracking_pattern: Option<&str>) -> Result<Self, FingerprintError> {
        let tracking_params = tracking_pattern.map(Regex::new).transpose()?;
        Ok(Self {
            keep_fragments,
            tracking_params,
        })
    }

    /// Legacy behaviour: fragments kept, no parameter stripped
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            keep_fragments: true,
            tracking_params: None,
        }
    }

    #[must_use]
    pub const fn keeps_fragments(&self) -> bool {
        self.keep_fragments
    }

    fn is_tracking(&self, key: &str) -> bool {
        self.tracking_params
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(key))
    }

    /// Returns the canonical form of `raw`
    ///
    /// Query parameters are sorted by key then value; blank values are kept.
    pub fn canonicalize(&self, raw: &str) -> Result<String, FingerprintError> {
        let mut url = Url::parse(raw.trim()).map_err(|source| FingerprintError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;

        if !self.keep_fragments {
            url.set_fragment(None);
        }

        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !self.is_tracking(key))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        pairs.sort();

        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs.iter());
        }

        Ok(url.into())
    }

    /// Canonicalizes and hashes `raw` in one step
    pub fn fingerprint(&self, raw: &str) -> Result<Fingerprint, FingerprintError> {
        Ok(Fingerprint::of_canonical(&self.canonicalize(raw)?))
    }
}

impl Default for CanonicalPolicy {
    fn default() -> Self {
        Self {
            keep_fragments: false,
            tracking_params: Regex::new(DEFAULT_TRACKING_PATTERN).ok(),
        }
    }
}

/// Dedup identity of a request or item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fingerprint {
    /// First 16 bytes of BLAKE3 over a canonical URL. These members do not
    /// match MurmurHash3 URL fingerprints written by legacy crawlers.
    Hash(u128),

    /// Raw incremental-crawl cursor, stored unhashed
    Cursor(i64),
}

impl Fingerprint {
    #[must_use]
    pub fn of_canonical(canonical: &str) -> Self {
        let digest = blake3::hash(canonical.as_bytes());
        let mut prefix = [0u8; 16];
        prefix.copy_from_slice(&digest.as_bytes()[..16]);
        Self::Hash(u128::from_be_bytes(prefix))
    }

    #[must_use]
    pub const fn of_cursor(cursor: i64) -> Self {
        Self::Cursor(cursor)
    }

    /// Sorted-set member under which this fingerprint is stored
    #[must_use]
    pub fn member(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hash(hash) => write!(f, "{hash}"),
            Self::Cursor(cursor) => write!(f, "{cursor}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("HTTPS://X.Test:443/a?b=2&a=1", "https://x.test/a?a=1&b=2")]
    #[case("https://x.test/a?utm=1", "https://x.test/a")]
    #[case("https://x.test/a?utm_source=feed&id=7", "https://x.test/a?id=7")]
    #[case("https://x.test/a?fbclid=abc&gclid=def", "https://x.test/a")]
    #[case("https://x.test/a#comments", "https://x.test/a")]
    #[case("http://x.test:80/a?k=", "http://x.test/a?k=")]
    fn default_policy_canonical_forms(#[case] raw: &str, #[case] expected: &str) {
        let policy = CanonicalPolicy::default();
        assert_eq!(policy.canonicalize(raw).unwrap(), expected);
    }

    #[test]
    fn strict_policy_keeps_fragment_and_tracking_params() {
        let policy = CanonicalPolicy::strict();
        assert_eq!(
            policy.canonicalize("https://x.test/a?utm=1#top").unwrap(),
            "https://x.test/a?utm=1#top"
        );
        assert_ne!(
            policy.fingerprint("https://x.test/a?utm=1").unwrap(),
            policy.fingerprint("https://x.test/a?utm=2").unwrap()
        );
    }

    #[test]
    fn tracking_variants_share_a_fingerprint() {
        let policy = CanonicalPolicy::default();
        assert_eq!(
            policy.fingerprint("https://x.test/a?utm=1").unwrap(),
            policy.fingerprint("https://x.test/a?utm=2").unwrap()
        );
    }

    #[test]
    fn custom_pattern_is_validated() {
        assert!(CanonicalPolicy::new(false, Some("(unclosed")).is_err());

        let policy = CanonicalPolicy::new(true, Some("^session$")).unwrap();
        assert!(policy.keeps_fragments());
        assert_eq!(
            policy.canonicalize("https://x.test/?session=9&utm=1#f").unwrap(),
            "https://x.test/?utm=1#f"
        );
    }

    #[test]
    fn invalid_url_is_rejected() {
        let err = CanonicalPolicy::default().canonicalize("not a url").unwrap_err();
        assert!(matches!(err, FingerprintError::InvalidUrl { .. }));
    }

    #[test]
    fn member_is_decimal() {
        assert_eq!(Fingerprint::of_cursor(115).member(), "115");
        assert_eq!(Fingerprint::Hash(42).member(), "42");
    }
}
