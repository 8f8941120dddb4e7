// Cursor record persistence
// One row per (site_id, cursor_name) in SQLite, managed through sqlx

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::domain::CursorRecord;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage for incremental-crawl high-water marks
#[async_trait]
pub trait CursorRepository: Send + Sync {
    async fn load(&self, site_id: i64, cursor_name: &str) -> Result<Option<CursorRecord>, RepositoryError>;

    /// Inserts or replaces the record for its `(site_id, cursor_name)`
    async fn upsert(&self, record: &CursorRecord) -> Result<(), RepositoryError>;
}

pub struct SqlCursorRepository {
    pool: SqlitePool,
}

impl SqlCursorRepository {
    /// Connects to `database_url` and creates the `cursor_state` table if needed
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let db_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        if !db_path.starts_with(":memory:") {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let repository = Self { pool };
        repository.migrate().await?;
        info!("✅ Cursor repository ready: {}", database_url);
        Ok(repository)
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), RepositoryError> {
        let create_cursor_state_sql = r"
            CREATE TABLE IF NOT EXISTS cursor_state (
                site_id INTEGER NOT NULL,
                cursor_name TEXT NOT NULL,
                cursor_value INTEGER NOT NULL,
                name TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (site_id, cursor_name)
            )
        ";

        sqlx::query(create_cursor_state_sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CursorRepository for SqlCursorRepository {
    async fn load(&self, site_id: i64, cursor_name: &str) -> Result<Option<CursorRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT site_id, cursor_name, cursor_value, name FROM cursor_state WHERE site_id = ? AND cursor_name = ?",
        )
        .bind(site_id)
        .bind(cursor_name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(CursorRecord {
            site_id: row.try_get("site_id")?,
            cursor_name: row.try_get("cursor_name")?,
            cursor_value: row.try_get("cursor_value")?,
            name: row.try_get("name")?,
        }))
    }

    async fn upsert(&self, record: &CursorRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO cursor_state (site_id, cursor_name, cursor_value, name, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (site_id, cursor_name) DO UPDATE SET
                cursor_value = excluded.cursor_value,
                name = excluded.name,
                updated_at = excluded.updated_at
            ",
        )
        .bind(record.site_id)
        .bind(&record.cursor_name)
        .bind(record.cursor_value)
        .bind(&record.name)
        .execute(&self.pool)
        .await?;

        debug!(
            site_id = record.site_id,
            cursor_name = %record.cursor_name,
            cursor_value = record.cursor_value,
            "cursor record upserted"
        );
        Ok(())
    }
}
