//! Proxy endpoints and the leases that carry their issue time

use std::fmt;

use serde::{Deserialize, Serialize};

/// Egress proxy address, e.g. `http://10.0.0.1:8080`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyEndpoint(String);

impl ProxyEndpoint {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(endpoint.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Endpoint drawn from the shared pool with the time it entered the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLease {
    pub endpoint: ProxyEndpoint,
    pub issued_at_ms: i64,
}

impl ProxyLease {
    #[must_use]
    pub const fn new(endpoint: ProxyEndpoint, issued_at_ms: i64) -> Self {
        Self {
            endpoint,
            issued_at_ms,
        }
    }

    /// A lease is expired once strictly more than `ttl_ms` has elapsed
    #[must_use]
    pub const fn is_expired(&self, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms - self.issued_at_ms > ttl_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_boundary() {
        let lease = ProxyLease::new(ProxyEndpoint::new("http://p:1"), 1_000);
        assert!(!lease.is_expired(31_000, 30_000));
        assert!(lease.is_expired(31_001, 30_000));
    }
}
