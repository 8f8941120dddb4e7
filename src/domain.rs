//! Domain layer: plain data shared by every coordination component

pub mod clock;        // Injectable wall clock
pub mod cursor;       // Cursor records and ID windows
pub mod fingerprint;  // URL canonicalization and dedup identities
pub mod item;         // Extracted items and drop reasons
pub mod proxy;        // Proxy endpoints and leases
pub mod request;      // Request model and queue codec

pub use clock::{Clock, MockClock, SystemClock};
pub use cursor::{CursorRecord, CursorState, IdWindow, Offset, RoundOutcome};
pub use fingerprint::{CanonicalPolicy, Fingerprint, FingerprintError};
pub use item::{CrawledItem, DropReason, Severity};
pub use proxy::{ProxyEndpoint, ProxyLease};
pub use request::{CodecError, ElementId, Request, RequestCodec};
