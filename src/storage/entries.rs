use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::{QueryBuilder, SqliteConnection};

use super::schema::Database;
use super::types::{
    decode_timestamp, encode_timestamp, Entry, EntryData, EntryDbRow, EntryFilter,
    EntryWithFeedRow, Feed,
};
use crate::error::{ReaderError, Result};

const ENTRY_COLUMNS: &str = "e.feed_url AS feed_url, e.id AS id, e.updated AS updated, \
     e.title AS title, e.link AS link, e.author AS author, e.published AS published, \
     e.summary AS summary, e.content AS content, e.enclosures AS enclosures, e.read AS read";

/// Position of the last row handed out; the next chunk starts strictly after it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cursor {
    updated: String,
    feed_url: String,
    id: String,
}

type Chunk = Vec<(String, (Feed, Entry))>;

/// Drop the sort keys and yield the rows of one chunk.
fn chunk_items(rows: Chunk) -> impl futures::Stream<Item = Result<(Feed, Entry)>> {
    stream::iter(rows.into_iter().map(|(_, pair)| Ok(pair)))
}

impl Database {
    // ========================================================================
    // Entry Queries
    // ========================================================================

    /// Lazily list entries ordered by `(updated DESC, feed_url ASC, id ASC)`.
    ///
    /// Entries without `updated` sort last. With `chunk_size > 0` each chunk
    /// is a separate short query resuming after the last returned key, so no
    /// connection or transaction is held while the caller consumes the stream
    /// and concurrent writers never wait on it. Dropping the stream between
    /// chunks leaves nothing open.
    ///
    /// `chunk_size == 0` runs a single query for the whole result.
    pub fn get_entries(
        &self,
        filter: EntryFilter,
        chunk_size: usize,
    ) -> BoxStream<'static, Result<(Feed, Entry)>> {
        let db = self.clone();

        if chunk_size == 0 {
            return stream::once(async move { db.query_entries(&filter, None, None).await })
                .map_ok(chunk_items)
                .try_flatten()
                .boxed();
        }

        let init = Some((db, filter, None::<Cursor>));
        stream::try_unfold(init, move |state| async move {
            let Some((db, filter, cursor)) = state else {
                return Ok::<_, ReaderError>(None);
            };

            let rows = db
                .query_entries(&filter, cursor.as_ref(), Some(chunk_size))
                .await?;
            tracing::debug!(rows = rows.len(), chunk_size = chunk_size, "Fetched entries chunk");

            let next = match rows.last() {
                Some((updated, (_, entry))) if rows.len() == chunk_size => Some((
                    db,
                    filter,
                    Some(Cursor {
                        updated: updated.clone(),
                        feed_url: entry.feed_url.clone(),
                        id: entry.id.clone(),
                    }),
                )),
                Some(_) => None,
                None => return Ok(None),
            };
            Ok::<_, ReaderError>(Some((rows, next)))
        })
        .map_ok(chunk_items)
        .try_flatten()
        .boxed()
    }

    async fn query_entries(
        &self,
        filter: &EntryFilter,
        after: Option<&Cursor>,
        limit: Option<usize>,
    ) -> Result<Chunk> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("SELECT ");
        builder.push(ENTRY_COLUMNS);
        builder.push(
            ", f.updated AS f_updated, f.title AS f_title, f.link AS f_link, \
             f.author AS f_author, COALESCE(e.updated, '') AS sort_updated \
             FROM entries e JOIN feeds f ON f.url = e.feed_url WHERE 1 = 1",
        );

        if let Some(read) = filter.read {
            builder.push(" AND e.read = ");
            builder.push_bind(read);
        }
        if let Some(feed_url) = &filter.feed_url {
            builder.push(" AND e.feed_url = ");
            builder.push_bind(feed_url.clone());
        }
        if let Some(cursor) = after {
            // Mixed sort directions rule out a row-value comparison.
            builder.push(" AND (COALESCE(e.updated, '') < ");
            builder.push_bind(cursor.updated.clone());
            builder.push(" OR (COALESCE(e.updated, '') = ");
            builder.push_bind(cursor.updated.clone());
            builder.push(" AND (e.feed_url > ");
            builder.push_bind(cursor.feed_url.clone());
            builder.push(" OR (e.feed_url = ");
            builder.push_bind(cursor.feed_url.clone());
            builder.push(" AND e.id > ");
            builder.push_bind(cursor.id.clone());
            builder.push("))))");
        }

        builder.push(" ORDER BY COALESCE(e.updated, '') DESC, e.feed_url ASC, e.id ASC");
        if let Some(limit) = limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<EntryWithFeedRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(EntryWithFeedRow::into_pair).collect())
    }

    /// Get a single entry.
    pub async fn get_entry(&self, feed_url: &str, id: &str) -> Result<Option<Entry>> {
        let sql = format!(
            "SELECT {} FROM entries e WHERE e.feed_url = ? AND e.id = ?",
            ENTRY_COLUMNS
        );
        let row = sqlx::query_as::<_, EntryDbRow>(&sql)
            .bind(feed_url)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(EntryDbRow::into_entry))
    }

    // ========================================================================
    // Entry Mutations
    // ========================================================================

    /// Set the read flag unconditionally; repeating it is a successful no-op.
    ///
    /// # Errors
    ///
    /// Returns `ReaderError::EntryNotFound` if the entry does not exist.
    pub async fn set_entry_read(&self, feed_url: &str, id: &str, read: bool) -> Result<()> {
        let result = sqlx::query("UPDATE entries SET read = ? WHERE feed_url = ? AND id = ?")
            .bind(read)
            .bind(feed_url)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ReaderError::entry_not_found(feed_url, id));
        }
        tracing::debug!(feed = %feed_url, entry = %id, read = read, "Set entry read state");
        Ok(())
    }
}

// ============================================================================
// Transaction Primitives
// ============================================================================

/// `updated` of every stored entry of a feed, by entry id.
pub(crate) async fn load_entries_updated(
    conn: &mut SqliteConnection,
    feed_url: &str,
) -> Result<HashMap<String, Option<DateTime<Utc>>>> {
    let rows: Vec<(String, Option<String>)> =
        sqlx::query_as("SELECT id, updated FROM entries WHERE feed_url = ?")
            .bind(feed_url)
            .fetch_all(&mut *conn)
            .await?;

    Ok(rows
        .into_iter()
        .map(|(id, updated)| (id, decode_timestamp(updated)))
        .collect())
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ReaderError::storage("cannot encode entry", e))
}

pub(crate) async fn insert_entry(
    conn: &mut SqliteConnection,
    feed_url: &str,
    entry: &EntryData,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entries (
            feed_url, id, updated, title, link, author, published, summary,
            content, enclosures, read, first_updated
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
    "#,
    )
    .bind(feed_url)
    .bind(&entry.id)
    .bind(entry.updated.as_ref().map(encode_timestamp))
    .bind(&entry.title)
    .bind(&entry.link)
    .bind(&entry.author)
    .bind(entry.published.as_ref().map(encode_timestamp))
    .bind(&entry.summary)
    .bind(encode_json(&entry.content)?)
    .bind(encode_json(&entry.enclosures)?)
    .bind(encode_timestamp(&now))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Overwrite an entry's content fields; `read` is left alone.
pub(crate) async fn update_entry(
    conn: &mut SqliteConnection,
    feed_url: &str,
    entry: &EntryData,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE entries
        SET updated = ?, title = ?, link = ?, author = ?, published = ?,
            summary = ?, content = ?, enclosures = ?
        WHERE feed_url = ? AND id = ?
    "#,
    )
    .bind(entry.updated.as_ref().map(encode_timestamp))
    .bind(&entry.title)
    .bind(&entry.link)
    .bind(&entry.author)
    .bind(entry.published.as_ref().map(encode_timestamp))
    .bind(&entry.summary)
    .bind(encode_json(&entry.content)?)
    .bind(encode_json(&entry.enclosures)?)
    .bind(feed_url)
    .bind(&entry.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Content, Enclosure};
    use chrono::TimeZone;

    const FEED: &str = "https://example.com/feed.xml";

    fn day(d: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2010, 1, d, 0, 0, 0).unwrap())
    }

    fn entry(id: &str, updated: Option<DateTime<Utc>>) -> EntryData {
        EntryData {
            id: id.to_string(),
            updated,
            title: Some(format!("Entry {}", id)),
            ..Default::default()
        }
    }

    async fn db_with_entries(entries: &[EntryData]) -> Database {
        let db = Database::open(":memory:").await.unwrap();
        db.add_feed(FEED).await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();
        for e in entries {
            insert_entry(&mut conn, FEED, e, Utc::now()).await.unwrap();
        }
        db
    }

    async fn ids(db: &Database, filter: EntryFilter, chunk_size: usize) -> Vec<String> {
        db.get_entries(filter, chunk_size)
            .map_ok(|(_, e)| e.id)
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_entries_without_updated_sort_last() {
        let db = db_with_entries(&[entry("a", None), entry("b", day(1)), entry("c", day(2))]).await;
        for chunk_size in [0, 1, 2, 5] {
            assert_eq!(ids(&db, EntryFilter::all(), chunk_size).await, vec!["c", "b", "a"]);
        }
    }

    #[tokio::test]
    async fn test_filter_unread_and_feed() {
        let db = db_with_entries(&[entry("1", day(1)), entry("2", day(2))]).await;
        db.set_entry_read(FEED, "2", true).await.unwrap();

        assert_eq!(ids(&db, EntryFilter::unread(), 1).await, vec!["1"]);
        assert_eq!(
            ids(&db, EntryFilter { read: Some(true), feed_url: None }, 1).await,
            vec!["2"]
        );
        assert!(ids(&db, EntryFilter::all().with_feed("https://other/"), 1)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_store_yields_nothing() {
        let db = db_with_entries(&[]).await;
        assert!(ids(&db, EntryFilter::all(), 3).await.is_empty());
        assert!(ids(&db, EntryFilter::all(), 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_set_entry_read_missing_entry() {
        let db = db_with_entries(&[]).await;
        match db.set_entry_read(FEED, "nope", true).await {
            Err(ReaderError::EntryNotFound { feed_url, id }) => {
                assert_eq!(feed_url, FEED);
                assert_eq!(id, "nope");
            }
            other => panic!("Expected EntryNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_content_round_trips_through_json_columns() {
        let mut data = entry("1", day(1));
        data.content = vec![Content {
            value: "<p>hi</p>".into(),
            content_type: Some("text/html".into()),
            language: None,
        }];
        data.enclosures = vec![Enclosure {
            href: "https://example.com/a.mp3".into(),
            content_type: Some("audio/mpeg".into()),
            length: Some(1234),
        }];
        let db = db_with_entries(&[data.clone()]).await;

        let stored = db.get_entry(FEED, "1").await.unwrap().unwrap();
        assert_eq!(stored, data.into_entry(FEED));
    }

    #[tokio::test]
    async fn test_update_entry_keeps_read_flag() {
        let db = db_with_entries(&[entry("1", day(1))]).await;
        db.set_entry_read(FEED, "1", true).await.unwrap();

        let mut newer = entry("1", day(2));
        newer.title = Some("Changed".into());
        let mut conn = db.pool.acquire().await.unwrap();
        update_entry(&mut conn, FEED, &newer).await.unwrap();
        drop(conn);

        let stored = db.get_entry(FEED, "1").await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("Changed"));
        assert!(stored.read);
    }
}
