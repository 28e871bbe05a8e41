use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{
    decode_timestamp, encode_timestamp, CachingInfo, Feed, FeedData, FeedDbRow,
};
use crate::error::{ReaderError, Result};

/// Stored state the update loop and the reconciler need for one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForUpdate {
    pub url: String,
    pub updated: Option<DateTime<Utc>>,
    pub caching: CachingInfo,
    pub stale: bool,
}

type FeedForUpdateRow = (String, Option<String>, Option<String>, Option<String>, bool);

fn into_feed_for_update(row: FeedForUpdateRow) -> FeedForUpdate {
    let (url, updated, etag, last_modified, stale) = row;
    FeedForUpdate {
        url,
        updated: decode_timestamp(updated),
        caching: CachingInfo {
            etag,
            last_modified,
        },
        stale,
    }
}

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert a feed with only its URL set.
    ///
    /// The URL is not validated here; [`crate::Reader::add_feed`] does that.
    ///
    /// # Errors
    ///
    /// Returns `ReaderError::FeedExists` if the URL is already stored.
    pub async fn add_feed(&self, url: &str) -> Result<()> {
        let result = sqlx::query("INSERT OR IGNORE INTO feeds (url) VALUES (?)")
            .bind(url)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ReaderError::FeedExists {
                url: url.to_string(),
            });
        }
        tracing::info!(feed = %url, "Added feed");
        Ok(())
    }

    /// Delete a feed; its entries and tags go with it (ON DELETE CASCADE).
    pub async fn remove_feed(&self, url: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM feeds WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ReaderError::feed_not_found(url));
        }
        tracing::info!(feed = %url, "Removed feed");
        Ok(())
    }

    /// Get one feed, or `None` if it was never added.
    pub async fn get_feed(&self, url: &str) -> Result<Option<Feed>> {
        let row = sqlx::query_as::<_, FeedDbRow>(
            "SELECT url, updated, title, link, author FROM feeds WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Get all feeds, ordered by URL.
    pub async fn get_feeds(&self) -> Result<Vec<Feed>> {
        let rows = sqlx::query_as::<_, FeedDbRow>(
            "SELECT url, updated, title, link, author FROM feeds ORDER BY url",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Get the update bookkeeping for every feed, ordered by URL.
    pub async fn get_feeds_for_update(&self) -> Result<Vec<FeedForUpdate>> {
        let rows: Vec<FeedForUpdateRow> = sqlx::query_as(
            "SELECT url, updated, http_etag, http_last_modified, stale FROM feeds ORDER BY url",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(into_feed_for_update).collect())
    }

    /// Get the update bookkeeping for one feed.
    pub async fn get_feed_for_update(&self, url: &str) -> Result<Option<FeedForUpdate>> {
        let mut conn = self.pool.acquire().await?;
        load_feed_for_update(&mut conn, url).await
    }

    /// Force the next update to ignore caching headers and `updated`.
    pub async fn mark_as_stale(&self, url: &str) -> Result<()> {
        let result = sqlx::query("UPDATE feeds SET stale = 1 WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ReaderError::feed_not_found(url));
        }
        Ok(())
    }
}

// ============================================================================
// Transaction Primitives
// ============================================================================

pub(crate) async fn load_feed_for_update(
    conn: &mut SqliteConnection,
    url: &str,
) -> Result<Option<FeedForUpdate>> {
    let row: Option<FeedForUpdateRow> = sqlx::query_as(
        "SELECT url, updated, http_etag, http_last_modified, stale FROM feeds WHERE url = ?",
    )
    .bind(url)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(into_feed_for_update))
}

/// Overwrite the feed's metadata and clear the stale flag.
pub(crate) async fn write_feed(
    conn: &mut SqliteConnection,
    url: &str,
    feed: &FeedData,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE feeds
        SET updated = ?, title = ?, link = ?, author = ?, stale = 0, last_updated = ?
        WHERE url = ?
    "#,
    )
    .bind(feed.updated.as_ref().map(encode_timestamp))
    .bind(&feed.title)
    .bind(&feed.link)
    .bind(&feed.author)
    .bind(encode_timestamp(&now))
    .bind(url)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn write_caching_info(
    conn: &mut SqliteConnection,
    url: &str,
    caching: &CachingInfo,
) -> Result<()> {
    sqlx::query("UPDATE feeds SET http_etag = ?, http_last_modified = ? WHERE url = ?")
        .bind(&caching.etag)
        .bind(&caching.last_modified)
        .bind(url)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
