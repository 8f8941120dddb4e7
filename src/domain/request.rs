//! Request model and its queue encoding
//!
//! A [`Request`] is an opaque unit of work. Its encoded bytes are also its
//! identity inside the work queue, so the encoding must be deterministic:
//! fields serialize in declaration order and `meta` is an ordered map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::fingerprint::{CanonicalPolicy, Fingerprint, FingerprintError};
use super::proxy::ProxyEndpoint;

/// Encoding version written with every queue element
pub const CODEC_VERSION: u8 = 1;

fn default_method() -> String {
    "GET".to_string()
}

/// Unit of crawl work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Target resource
    pub url: String,

    /// Name of the downstream handler that consumes the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,

    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,

    /// Producer-assigned priority, carried for handlers
    #[serde(default)]
    pub priority: i32,

    /// Bypass every dedup tier
    #[serde(default)]
    pub dont_filter: bool,

    /// Alternate URL used as the dedup key instead of `url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_url: Option<String>,

    /// Incremental-crawl cursor; when set it is the dedup key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<i64>,

    /// Fetch through a leased proxy
    #[serde(default)]
    pub use_proxy: bool,

    /// Take a fresh proxy lease after transport failures
    #[serde(default)]
    pub rotate_proxy: bool,

    /// Proxy leased for the current attempt; never encoded
    #[serde(skip)]
    pub proxy: Option<ProxyEndpoint>,

    /// Free-form metadata for handlers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl Request {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            callback: None,
            method: default_method(),
            priority: 0,
            dont_filter: false,
            filter_url: None,
            cursor: None,
            use_proxy: false,
            rotate_proxy: false,
            proxy: None,
            meta: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_cursor(mut self, cursor: i64) -> Self {
        self.cursor = Some(cursor);
        self
    }

    #[must_use]
    pub fn with_filter_url(mut self, filter_url: impl Into<String>) -> Self {
        self.filter_url = Some(filter_url.into());
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyEndpoint) -> Self {
        self.proxy = Some(proxy);
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    #[must_use]
    pub const fn unfiltered(mut self) -> Self {
        self.dont_filter = true;
        self
    }

    #[must_use]
    pub const fn using_proxy(mut self) -> Self {
        self.use_proxy = true;
        self
    }

    #[must_use]
    pub const fn rotating_proxy(mut self) -> Self {
        self.use_proxy = true;
        self.rotate_proxy = true;
        self
    }

    /// True when the request opted into proxy leasing
    #[must_use]
    pub const fn needs_proxy(&self) -> bool {
        self.use_proxy || self.rotate_proxy
    }

    /// Dedup key: none for `dont_filter`, then cursor, then `filter_url`, then `url`
    pub fn dedup_key(&self, policy: &CanonicalPolicy) -> Result<Option<Fingerprint>, FingerprintError> {
        if self.dont_filter {
            return Ok(None);
        }
        if let Some(cursor) = self.cursor {
            return Ok(Some(Fingerprint::of_cursor(cursor)));
        }
        let target = self.filter_url.as_deref().unwrap_or(&self.url);
        policy.fingerprint(target).map(Some)
    }
}

/// Queue element identity: the encoded request bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementId(Vec<u8>);

impl ElementId {
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode queue element: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Unsupported request encoding version {0}")]
    UnsupportedVersion(u8),
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u8,
    request: &'a Request,
}

#[derive(Deserialize)]
struct Envelope {
    v: u8,
    request: Request,
}

/// Versioned JSON encoding of queue elements
pub struct RequestCodec;

impl RequestCodec {
    pub fn encode(request: &Request) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&EnvelopeRef {
            v: CODEC_VERSION,
            request,
        })
        .map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Request, CodecError> {
        let envelope: Envelope = serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
        if envelope.v != CODEC_VERSION {
            return Err(CodecError::UnsupportedVersion(envelope.v));
        }
        Ok(envelope.request)
    }

    pub fn element_id(request: &Request) -> Result<ElementId, CodecError> {
        Self::encode(request).map(ElementId::from_bytes)
    }
}
