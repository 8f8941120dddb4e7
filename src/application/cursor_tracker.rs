//! # Cursor Tracker
//!
//! Per-round high-water mark for incremental ID crawls.
//!
//! ```text
//! Uninitialized -> Loaded -> (Unchanged | Advanced) -> (Persisted | Discarded)
//! ```
//!
//! A round loads the mark once, probes a fixed window around it, keeps the
//! largest candidate seen and writes it back only when it exceeds the loaded
//! value. One tracker per `(site_id, cursor_name)` may run at a time; this is
//! a precondition of the deployment, not a lock.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::{CursorRecord, CursorState, IdWindow, Offset, Request, RoundOutcome};
use crate::infrastructure::{CursorRepository, RepositoryError};

/// Placeholder replaced by each probed ID in a URL template
pub const CURSOR_PLACEHOLDER: &str = "{cursor}";

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("No cursor record for site {site_id} ({cursor_name})")]
    MissingRecord { site_id: i64, cursor_name: String },

    #[error("Cursor repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Cursor has not been loaded for this round")]
    NotLoaded,

    #[error("Cursor round already finished")]
    Finished,

    #[error("Cursor offsets must be non-negative (back {back}, forward {forward})")]
    InvalidOffset { back: i64, forward: i64 },

    #[error("Cursor record for site {site_id} ({cursor_name}) already holds {existing}; overwrite must be forced")]
    RecordExists {
        site_id: i64,
        cursor_name: String,
        existing: i64,
    },
}

/// Result of [`seed_cursor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Created,
    Overwritten { previous: i64 },
}

/// Writes the starting record of an incremental source
///
/// An existing record is replaced only when `force` is set; the previous
/// value is logged at warn when that happens.
pub async fn seed_cursor(
    repository: &dyn CursorRepository,
    record: &CursorRecord,
    force: bool,
) -> Result<SeedOutcome, CursorError> {
    let previous = repository.load(record.site_id, &record.cursor_name).await?;

    let outcome = match previous {
        None => SeedOutcome::Created,
        Some(existing) if !force => {
            return Err(CursorError::RecordExists {
                site_id: existing.site_id,
                cursor_name: existing.cursor_name,
                existing: existing.cursor_value,
            });
        }
        Some(existing) => {
            warn!(
                site_id = record.site_id,
                cursor_name = %record.cursor_name,
                previous = existing.cursor_value,
                cursor = record.cursor_value,
                "⚠️ Overwriting existing cursor record"
            );
            SeedOutcome::Overwritten {
                previous: existing.cursor_value,
            }
        }
    };

    repository.upsert(record).await?;
    Ok(outcome)
}

/// Where the round's starting mark comes from
pub enum CursorSource {
    /// Production: read and written through the repository
    Repository(Arc<dyn CursorRepository>),

    /// Fixed starting value, never persisted
    Mock(i64),
}

impl std::fmt::Debug for CursorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repository(_) => f.write_str("Repository"),
            Self::Mock(value) => write!(f, "Mock({value})"),
        }
    }
}

#[derive(Debug)]
pub struct CursorTracker {
    site_id: i64,
    cursor_name: String,
    name: String,
    offset: Offset,
    source: CursorSource,
    state: CursorState,
    loaded: Option<i64>,
    current: Option<i64>,
}

impl CursorTracker {
    #[must_use]
    pub fn new(
        site_id: i64,
        cursor_name: impl Into<String>,
        name: impl Into<String>,
        offset: Offset,
        source: CursorSource,
    ) -> Self {
        Self {
            site_id,
            cursor_name: cursor_name.into(),
            name: name.into(),
            offset,
            source,
            state: CursorState::Uninitialized,
            loaded: None,
            current: None,
        }
    }

    /// Validates raw offsets before building the tracker
    pub fn with_offsets(
        site_id: i64,
        cursor_name: impl Into<String>,
        name: impl Into<String>,
        back: i64,
        forward: i64,
        source: CursorSource,
    ) -> Result<Self, CursorError> {
        let offset = Offset::new(back, forward).ok_or(CursorError::InvalidOffset { back, forward })?;
        Ok(Self::new(site_id, cursor_name, name, offset, source))
    }

    /// Reads the starting mark; later calls in the same round return it unchanged
    pub async fn load(&mut self) -> Result<i64, CursorError> {
        if let Some(loaded) = self.loaded {
            return Ok(loaded);
        }

        let value = match &self.source {
            CursorSource::Repository(repository) => repository
                .load(self.site_id, &self.cursor_name)
                .await?
                .map(|record| record.cursor_value)
                .ok_or_else(|| CursorError::MissingRecord {
                    site_id: self.site_id,
                    cursor_name: self.cursor_name.clone(),
                })?,
            CursorSource::Mock(value) => {
                info!(site_id = self.site_id, cursor = value, "🧪 Using mock cursor");
                *value
            }
        };

        self.loaded = Some(value);
        self.current = Some(value);
        self.state = CursorState::Loaded;
        info!(
            site_id = self.site_id,
            cursor_name = %self.cursor_name,
            cursor = value,
            "📍 Cursor loaded"
        );
        Ok(value)
    }

    /// Highest value seen so far this round
    #[must_use]
    pub const fn cursor(&self) -> Option<i64> {
        self.current
    }

    /// Value read at round start
    #[must_use]
    pub const fn loaded(&self) -> Option<i64> {
        self.loaded
    }

    #[must_use]
    pub const fn state(&self) -> CursorState {
        self.state
    }

    #[must_use]
    pub const fn site_id(&self) -> i64 {
        self.site_id
    }

    /// Records a candidate; returns `true` when it raised the mark
    pub fn observe(&mut self, candidate: i64) -> bool {
        if self.state.is_terminal() {
            warn!(candidate, "Cursor candidate after round end ignored");
            return false;
        }
        let Some(current) = self.current else {
            debug!(candidate, "Cursor candidate before load ignored");
            return false;
        };

        if candidate > current {
            self.current = Some(candidate);
            self.state = CursorState::Advanced;
            debug!(previous = current, cursor = candidate, "cursor advanced");
            true
        } else {
            if self.state == CursorState::Loaded {
                self.state = CursorState::Unchanged;
            }
            false
        }
    }

    /// IDs probed this round, anchored on the loaded mark
    pub fn window(&self) -> Result<IdWindow, CursorError> {
        self.loaded
            .map(|cursor| self.offset.window_around(cursor))
            .ok_or(CursorError::NotLoaded)
    }

    /// One request per probed ID, each keyed on its cursor for dedup
    pub fn requests_for_window(&self, url_template: &str) -> Result<Vec<Request>, CursorError> {
        let window = self.window()?;
        Ok(window
            .ids()
            .map(|id| Request::get(url_template.replace(CURSOR_PLACEHOLDER, &id.to_string())).with_cursor(id))
            .collect())
    }

    /// Ends the round, persisting the mark only if it advanced
    pub async fn finish(&mut self) -> Result<RoundOutcome, CursorError> {
        if self.state.is_terminal() {
            return Err(CursorError::Finished);
        }
        let (Some(previous), Some(cursor)) = (self.loaded, self.current) else {
            return Ok(RoundOutcome::NotLoaded);
        };

        if self.state != CursorState::Advanced {
            self.state = CursorState::Discarded;
            info!(site_id = self.site_id, cursor, "Cursor unchanged, nothing to persist");
            return Ok(RoundOutcome::Unchanged { cursor });
        }

        match &self.source {
            CursorSource::Repository(repository) => {
                let record = CursorRecord {
                    site_id: self.site_id,
                    cursor_name: self.cursor_name.clone(),
                    cursor_value: cursor,
                    name: self.name.clone(),
                };
                repository.upsert(&record).await?;
                self.state = CursorState::Persisted;
                info!(site_id = self.site_id, previous, cursor, "💾 Cursor persisted");
                Ok(RoundOutcome::Persisted { previous, cursor })
            }
            CursorSource::Mock(_) => {
                self.state = CursorState::Discarded;
                info!(site_id = self.site_id, previous, cursor, "🧪 Mock cursor advanced, write skipped");
                Ok(RoundOutcome::Skipped { previous, cursor })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock(start: i64) -> CursorTracker {
        CursorTracker::new(7, "article_id", "news", Offset::new(50, 20).unwrap(), CursorSource::Mock(start))
    }

    #[tokio::test]
    async fn only_larger_candidates_advance() {
        let mut tracker = mock(100);
        assert_eq!(tracker.load().await.unwrap(), 100);

        assert!(!tracker.observe(90));
        assert_eq!(tracker.state(), CursorState::Unchanged);
        assert!(tracker.observe(115));
        assert!(!tracker.observe(110));
        assert_eq!(tracker.cursor(), Some(115));
        assert_eq!(tracker.state(), CursorState::Advanced);
    }

    #[tokio::test]
    async fn mock_rounds_skip_the_write() {
        let mut tracker = mock(100);
        tracker.load().await.unwrap();
        tracker.observe(101);

        assert_eq!(
            tracker.finish().await.unwrap(),
            RoundOutcome::Skipped { previous: 100, cursor: 101 }
        );
        assert!(matches!(tracker.finish().await, Err(CursorError::Finished)));
    }

    #[tokio::test]
    async fn window_requests_carry_their_cursor() {
        let mut tracker = mock(100);
        assert!(matches!(tracker.window(), Err(CursorError::NotLoaded)));
        tracker.load().await.unwrap();

        let requests = tracker.requests_for_window("https://x.test/item/{cursor}").unwrap();
        assert_eq!(requests.len(), 70);
        assert_eq!(requests[0].url, "https://x.test/item/50");
        assert_eq!(requests[0].cursor, Some(50));
        assert_eq!(requests[69].url, "https://x.test/item/119");
    }

    #[tokio::test]
    async fn unloaded_round_finishes_without_outcome() {
        let mut tracker = mock(1);
        assert!(!tracker.observe(5));
        assert_eq!(tracker.finish().await.unwrap(), RoundOutcome::NotLoaded);
    }

    #[test]
    fn negative_offsets_are_rejected() {
        let result = CursorTracker::with_offsets(1, "id", "n", -1, 5, CursorSource::Mock(0));
        assert!(matches!(result, Err(CursorError::InvalidOffset { back: -1, forward: 5 })));
    }
}
