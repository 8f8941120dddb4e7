//! Incremental-crawl cursor records, window math and tracker states

use serde::{Deserialize, Serialize};

/// Persisted high-water mark for one crawl source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub site_id: i64,

    pub cursor_name: String,

    pub cursor_value: i64,

    /// Human-readable source name
    pub name: String,
}

/// Probe distance around the cursor: `[cursor - back, cursor + forward)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    back: i64,
    forward: i64,
}

impl Offset {
    /// Returns `None` when either side is negative
    #[must_use]
    pub const fn new(back: i64, forward: i64) -> Option<Self> {
        if back < 0 || forward < 0 {
            None
        } else {
            Some(Self { back, forward })
        }
    }

    #[must_use]
    pub const fn back(&self) -> i64 {
        self.back
    }

    #[must_use]
    pub const fn forward(&self) -> i64 {
        self.forward
    }

    #[must_use]
    pub const fn window_around(&self, cursor: i64) -> IdWindow {
        IdWindow {
            start: cursor.saturating_sub(self.back),
            end: cursor.saturating_add(self.forward),
        }
    }
}

/// Half-open ID range probed in one round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdWindow {
    pub start: i64,
    pub end: i64,
}

impl IdWindow {
    #[must_use]
    pub const fn len(&self) -> u64 {
        if self.end > self.start {
            self.end.abs_diff(self.start)
        } else {
            0
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn contains(&self, id: i64) -> bool {
        id >= self.start && id < self.end
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> {
        self.start..self.end
    }
}

/// Round lifecycle of a cursor tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorState {
    Uninitialized,
    Loaded,
    Unchanged,
    Advanced,
    Persisted,
    Discarded,
}

impl CursorState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Persisted | Self::Discarded)
    }
}

/// What `finish` did with the round's high-water mark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// New mark written
    Persisted { previous: i64, cursor: i64 },

    /// Mark advanced but the source does not persist (mock mode)
    Skipped { previous: i64, cursor: i64 },

    /// No candidate exceeded the loaded mark
    Unchanged { cursor: i64 },

    /// The tracker was never loaded
    NotLoaded,
}
