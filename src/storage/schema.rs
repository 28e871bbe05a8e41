use std::str::FromStr;
use std::time::Duration;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::config::StorageConfig;
use crate::error::{ReaderError, Result};

/// Current schema version, recorded in the `version` table.
const SCHEMA_VERSION: i64 = 1;

// ============================================================================
// Database
// ============================================================================

/// Handle to the durable store.
///
/// Cheap to clone; every clone shares one connection pool. Independent
/// handles opened on the same file are safe to use concurrently: SQLite
/// serializes writers and WAL mode keeps readers off the write lock.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open (or create) a store with default settings.
    ///
    /// `":memory:"` opens an ephemeral store that lives as long as the handle.
    pub async fn open(path: &str) -> Result<Self> {
        Self::open_with(path, &StorageConfig::default()).await
    }

    /// Open (or create) a store.
    ///
    /// # Errors
    ///
    /// Returns `ReaderError::Storage` if the file cannot be opened, the
    /// schema cannot be created, or the schema version is unknown.
    pub async fn open_with(path: &str, config: &StorageConfig) -> Result<Self> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout is the only bound on how long a writer waits for the lock.
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReaderError::storage(format!("invalid database path {:?}", path), e))?
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool_options = if in_memory {
            // Each in-memory connection would be its own database; keep exactly
            // one and never let it expire.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| ReaderError::storage(format!("cannot open database {:?}", path), e))?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::debug!(path = %path, "Opened database");
        Ok(db)
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create or check the schema atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// store is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let version_table: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'version'",
        )
        .fetch_optional(&mut *tx)
        .await?;

        if version_table.is_some() {
            let (version,): (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM version")
                .fetch_one(&mut *tx)
                .await?;
            match version {
                Some(SCHEMA_VERSION) => {
                    tx.commit().await?;
                    return Ok(());
                }
                other => {
                    return Err(ReaderError::Storage {
                        message: format!(
                            "unsupported schema version {:?} (expected {})",
                            other, SCHEMA_VERSION
                        ),
                        cause: None,
                    });
                }
            }
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                url TEXT PRIMARY KEY NOT NULL,
                updated TEXT,
                title TEXT,
                link TEXT,
                author TEXT,
                http_etag TEXT,
                http_last_modified TEXT,
                stale INTEGER NOT NULL DEFAULT 0,
                last_updated TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                feed_url TEXT NOT NULL REFERENCES feeds(url)
                    ON UPDATE CASCADE ON DELETE CASCADE,
                id TEXT NOT NULL,
                updated TEXT,
                title TEXT,
                link TEXT,
                author TEXT,
                published TEXT,
                summary TEXT,
                content TEXT NOT NULL DEFAULT '[]',
                enclosures TEXT NOT NULL DEFAULT '[]',
                read INTEGER NOT NULL DEFAULT 0,
                first_updated TEXT NOT NULL,
                PRIMARY KEY (feed_url, id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Matches the listing order and the keyset predicate of get_entries().
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_order \
             ON entries(COALESCE(updated, '') DESC, feed_url, id)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_feed_read ON entries(feed_url, read)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_tags (
                feed_url TEXT NOT NULL REFERENCES feeds(url)
                    ON UPDATE CASCADE ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (feed_url, key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_tags (
                feed_url TEXT NOT NULL,
                entry_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (feed_url, entry_id, key),
                FOREIGN KEY (feed_url, entry_id) REFERENCES entries(feed_url, id)
                    ON UPDATE CASCADE ON DELETE CASCADE
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS version (version INTEGER NOT NULL)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO version VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute(&mut *tx)
            .await?;

        // Commit all migrations atomically
        tx.commit().await?;
        tracing::info!(version = SCHEMA_VERSION, "Created database schema");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_creates_schema() {
        let db = Database::open(":memory:").await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(
            names,
            vec!["entries", "entry_tags", "feed_tags", "feeds", "version"]
        );
    }

    #[tokio::test]
    async fn test_reopen_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let path = path.to_str().unwrap();

        Database::open(path).await.unwrap().close().await;
        let db = Database::open(path).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM version")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_unknown_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let path = path.to_str().unwrap();

        let db = Database::open(path).await.unwrap();
        sqlx::query("UPDATE version SET version = 99")
            .execute(&db.pool)
            .await
            .unwrap();
        db.close().await;

        match Database::open(path).await {
            Err(ReaderError::Storage { message, .. }) => {
                assert!(message.contains("unsupported schema version"), "{}", message)
            }
            Err(e) => panic!("Expected Storage error, got {:?}", e),
            Ok(_) => panic!("Expected Storage error, got Ok"),
        }
    }
}
