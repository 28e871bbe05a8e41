use serde_json::Value;

use super::schema::Database;
use super::types::ResourceId;
use crate::error::{ReaderError, Result};

fn decode_value(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| ReaderError::storage("corrupt tag value", e))
}

impl Database {
    // ========================================================================
    // Tag Operations
    // ========================================================================

    /// Set (create or overwrite) a tag on a feed or entry.
    ///
    /// # Errors
    ///
    /// Returns `FeedNotFound` / `EntryNotFound` if the resource does not exist.
    pub async fn set_tag(&self, resource: &ResourceId, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value)
            .map_err(|e| ReaderError::storage("cannot encode tag value", e))?;

        // INSERT ... SELECT only inserts if the parent row exists, in one statement.
        let result = match resource {
            ResourceId::Feed(url) => {
                sqlx::query(
                    r#"
                    INSERT INTO feed_tags (feed_url, key, value)
                    SELECT url, ?, ? FROM feeds WHERE url = ?
                    ON CONFLICT(feed_url, key) DO UPDATE SET value = excluded.value
                "#,
                )
                .bind(key)
                .bind(&raw)
                .bind(url)
                .execute(&self.pool)
                .await?
            }
            ResourceId::Entry(feed_url, id) => {
                sqlx::query(
                    r#"
                    INSERT INTO entry_tags (feed_url, entry_id, key, value)
                    SELECT feed_url, id, ?, ? FROM entries WHERE feed_url = ? AND id = ?
                    ON CONFLICT(feed_url, entry_id, key) DO UPDATE SET value = excluded.value
                "#,
                )
                .bind(key)
                .bind(&raw)
                .bind(feed_url)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(not_found(resource));
        }
        Ok(())
    }

    /// Get a tag value.
    ///
    /// # Errors
    ///
    /// - `FeedNotFound` / `EntryNotFound` if the resource does not exist
    /// - `TagNotFound` if the key is not set on the resource
    pub async fn get_tag(&self, resource: &ResourceId, key: &str) -> Result<Value> {
        let row: Option<(String,)> = match resource {
            ResourceId::Feed(url) => {
                sqlx::query_as("SELECT value FROM feed_tags WHERE feed_url = ? AND key = ?")
                    .bind(url)
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?
            }
            ResourceId::Entry(feed_url, id) => {
                sqlx::query_as(
                    "SELECT value FROM entry_tags WHERE feed_url = ? AND entry_id = ? AND key = ?",
                )
                .bind(feed_url)
                .bind(id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some((raw,)) => decode_value(&raw),
            None => Err(self.tag_not_found(resource, key).await),
        }
    }

    /// Get all tags of a resource, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns `FeedNotFound` / `EntryNotFound` if the resource does not exist.
    pub async fn get_tags(&self, resource: &ResourceId) -> Result<Vec<(String, Value)>> {
        let rows: Vec<(String, String)> = match resource {
            ResourceId::Feed(url) => {
                sqlx::query_as("SELECT key, value FROM feed_tags WHERE feed_url = ? ORDER BY key")
                    .bind(url)
                    .fetch_all(&self.pool)
                    .await?
            }
            ResourceId::Entry(feed_url, id) => {
                sqlx::query_as(
                    "SELECT key, value FROM entry_tags WHERE feed_url = ? AND entry_id = ? ORDER BY key",
                )
                .bind(feed_url)
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        if rows.is_empty() && !self.resource_exists(resource).await? {
            return Err(not_found(resource));
        }

        rows.into_iter()
            .map(|(key, raw)| Ok((key, decode_value(&raw)?)))
            .collect()
    }

    /// Delete a tag.
    ///
    /// # Errors
    ///
    /// - `FeedNotFound` / `EntryNotFound` if the resource does not exist
    /// - `TagNotFound` if the key is not set on the resource
    pub async fn delete_tag(&self, resource: &ResourceId, key: &str) -> Result<()> {
        let result = match resource {
            ResourceId::Feed(url) => {
                sqlx::query("DELETE FROM feed_tags WHERE feed_url = ? AND key = ?")
                    .bind(url)
                    .bind(key)
                    .execute(&self.pool)
                    .await?
            }
            ResourceId::Entry(feed_url, id) => {
                sqlx::query("DELETE FROM entry_tags WHERE feed_url = ? AND entry_id = ? AND key = ?")
                    .bind(feed_url)
                    .bind(id)
                    .bind(key)
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(self.tag_not_found(resource, key).await);
        }
        Ok(())
    }

    async fn resource_exists(&self, resource: &ResourceId) -> Result<bool> {
        let row: Option<(i64,)> = match resource {
            ResourceId::Feed(url) => {
                sqlx::query_as("SELECT 1 FROM feeds WHERE url = ?")
                    .bind(url)
                    .fetch_optional(&self.pool)
                    .await?
            }
            ResourceId::Entry(feed_url, id) => {
                sqlx::query_as("SELECT 1 FROM entries WHERE feed_url = ? AND id = ?")
                    .bind(feed_url)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        Ok(row.is_some())
    }

    /// The error for a missing tag row: the resource's own not-found error
    /// if the resource is gone, else `TagNotFound`.
    async fn tag_not_found(&self, resource: &ResourceId, key: &str) -> ReaderError {
        match self.resource_exists(resource).await {
            Ok(true) => ReaderError::TagNotFound {
                resource: resource.clone(),
                key: key.to_string(),
            },
            Ok(false) => not_found(resource),
            Err(e) => e,
        }
    }
}

fn not_found(resource: &ResourceId) -> ReaderError {
    match resource {
        ResourceId::Feed(url) => ReaderError::feed_not_found(url.clone()),
        ResourceId::Entry(feed_url, id) => ReaderError::entry_not_found(feed_url.clone(), id.clone()),
    }
}
