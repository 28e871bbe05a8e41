//! Engine facade: owns the store handle and the injected parser.
//!
//! [`Reader`] is cheap to clone; clones share the connection pool and the
//! parser, so one instance can be handed to several tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::config::ReaderConfig;
use crate::error::{ErrorCause, ReaderError, Result};
use crate::feed::{FeedParser, ParseResponse};
use crate::mark_as_read;
use crate::reconcile::{reconcile, ReconcileOutcome};
use crate::storage::{
    BozoException, CachingInfo, Database, Entry, EntryFilter, Feed, FeedForUpdate, ParsedFeed,
    ResourceId,
};
use crate::util::validate_feed_url;

/// Outcome of updating one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedUpdate {
    /// The snapshot was reconciled (possibly with no visible change).
    Updated(ReconcileOutcome),
    /// The parser reported the feed unchanged; nothing was written.
    NotModified,
}

/// Per-feed outcomes of [`Reader::update_feeds`], keyed by feed URL.
pub type UpdateResults = BTreeMap<String, Result<FeedUpdate>>;

#[derive(Clone)]
pub struct Reader {
    db: Database,
    parser: Arc<dyn FeedParser>,
    config: ReaderConfig,
}

impl Reader {
    pub fn new(db: Database, parser: Arc<dyn FeedParser>, config: ReaderConfig) -> Self {
        Self { db, parser, config }
    }

    /// Open (or create) the store at `path` using `config.storage`.
    pub async fn open(
        path: &str,
        parser: Arc<dyn FeedParser>,
        config: ReaderConfig,
    ) -> Result<Self> {
        let db = Database::open_with(path, &config.storage).await?;
        Ok(Self::new(db, parser, config))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    // ------------------------------------------------------------------------
    // Feeds
    // ------------------------------------------------------------------------

    /// Subscribe to `url`. The string is stored as given.
    ///
    /// # Errors
    ///
    /// - `InvalidFeedUrl` if the URL is not http(s) or file
    /// - `FeedExists` if already subscribed
    pub async fn add_feed(&self, url: &str) -> Result<()> {
        validate_feed_url(url)?;
        self.db.add_feed(url).await
    }

    /// Unsubscribe from `url`, deleting its entries and tags.
    pub async fn remove_feed(&self, url: &str) -> Result<()> {
        self.db.remove_feed(url).await
    }

    /// `None` if the feed was never added.
    pub async fn get_feed(&self, url: &str) -> Result<Option<Feed>> {
        self.db.get_feed(url).await
    }

    pub async fn get_feeds(&self) -> Result<Vec<Feed>> {
        self.db.get_feeds().await
    }

    /// Force the next update to skip conditional fetch and the newer-wins rule.
    pub async fn mark_as_stale(&self, url: &str) -> Result<()> {
        self.db.mark_as_stale(url).await
    }

    // ------------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------------

    /// Entries matching `filter`, newest first, fetched in chunks of
    /// `entries_chunk_size`.
    pub fn get_entries(&self, filter: EntryFilter) -> BoxStream<'static, Result<(Feed, Entry)>> {
        self.db.get_entries(filter, self.config.entries_chunk_size)
    }

    pub async fn get_entry(&self, feed_url: &str, id: &str) -> Result<Option<Entry>> {
        self.db.get_entry(feed_url, id).await
    }

    pub async fn mark_as_read(&self, feed_url: &str, id: &str) -> Result<()> {
        self.db.set_entry_read(feed_url, id, true).await
    }

    pub async fn mark_as_unread(&self, feed_url: &str, id: &str) -> Result<()> {
        self.db.set_entry_read(feed_url, id, false).await
    }

    // ------------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------------

    pub async fn set_tag(&self, resource: &ResourceId, key: &str, value: &Value) -> Result<()> {
        self.db.set_tag(resource, key, value).await
    }

    pub async fn get_tag(&self, resource: &ResourceId, key: &str) -> Result<Value> {
        self.db.get_tag(resource, key).await
    }

    pub async fn get_tags(&self, resource: &ResourceId) -> Result<Vec<(String, Value)>> {
        self.db.get_tags(resource).await
    }

    pub async fn delete_tag(&self, resource: &ResourceId, key: &str) -> Result<()> {
        self.db.delete_tag(resource, key).await
    }

    // ------------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------------

    /// Update every feed, `update_workers` at a time.
    ///
    /// Parse and not-found errors are recorded per feed and never stop the
    /// batch. A storage error aborts the whole call.
    pub async fn update_feeds(&self) -> Result<UpdateResults> {
        let feeds = self.db.get_feeds_for_update().await?;
        let workers = self.config.update_workers.max(1);
        tracing::info!(feeds = feeds.len(), workers = workers, "Updating feeds");

        let results: UpdateResults = stream::iter(feeds)
            .map(|feed| async move {
                let url = feed.url.clone();
                match self.update_one(feed).await {
                    Err(e) if e.is_storage() => Err(e),
                    result => {
                        if let Err(e) = &result {
                            tracing::warn!(feed = %url, error = %e, "Feed update failed");
                        }
                        Ok((url, result))
                    }
                }
            })
            .buffer_unordered(workers)
            .try_collect()
            .await?;

        Ok(results)
    }

    /// Update one feed. Unlike [`Reader::update_feeds`], errors are returned.
    pub async fn update_feed(&self, url: &str) -> Result<FeedUpdate> {
        let feed = self
            .db
            .get_feed_for_update(url)
            .await?
            .ok_or_else(|| ReaderError::feed_not_found(url))?;
        self.update_one(feed).await
    }

    async fn update_one(&self, feed: FeedForUpdate) -> Result<FeedUpdate> {
        if self.config.mark_as_read_by_title {
            mark_as_read::backfill(&self.db, &feed.url, self.config.entries_chunk_size).await?;
        }

        let caching = if feed.stale {
            CachingInfo::default()
        } else {
            feed.caching
        };

        let parsed = match self.parser.parse(&feed.url, &caching).await? {
            ParseResponse::NotModified => return Ok(FeedUpdate::NotModified),
            ParseResponse::Parsed(parsed) => parsed,
        };
        check_bozo(&feed.url, &parsed)?;

        let outcome = reconcile(&self.db, &feed.url, &parsed).await?;

        if self.config.mark_as_read_by_title {
            mark_as_read::apply(&self.db, &feed.url, &outcome.new_entries, &parsed.entries)
                .await?;
        }

        Ok(FeedUpdate::Updated(outcome))
    }
}

/// A malformed document is a per-feed parse error, unless the parser only
/// had to override the declared encoding.
fn check_bozo(url: &str, parsed: &ParsedFeed) -> Result<()> {
    if !parsed.bozo {
        return Ok(());
    }
    match &parsed.bozo_exception {
        Some(BozoException::EncodingOverride(message)) => {
            tracing::warn!(feed = %url, reason = %message, "Feed parsed with encoding override");
            Ok(())
        }
        Some(BozoException::Malformed(message)) => Err(ReaderError::Parse {
            url: url.to_string(),
            message: "error while parsing feed".to_string(),
            cause: Some(ErrorCause::message("BozoException", message.clone())),
        }),
        None => Err(ReaderError::parse_message(url, "error while parsing feed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://example.com/feed.xml";

    fn bozo(exception: Option<BozoException>) -> ParsedFeed {
        ParsedFeed {
            bozo: true,
            bozo_exception: exception,
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_snapshot_passes() {
        assert!(check_bozo(URL, &ParsedFeed::default()).is_ok());
    }

    #[test]
    fn test_encoding_override_is_only_a_warning() {
        let parsed = bozo(Some(BozoException::EncodingOverride("latin-1".into())));
        assert!(check_bozo(URL, &parsed).is_ok());
    }

    #[test]
    fn test_malformed_is_parse_error_with_cause() {
        let parsed = bozo(Some(BozoException::Malformed("mismatched tag".into())));
        let err = check_bozo(URL, &parsed).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"error while parsing feed: "https://example.com/feed.xml": BozoException: mismatched tag"#
        );
    }

    #[test]
    fn test_bozo_without_exception_is_parse_error() {
        let err = check_bozo(URL, &bozo(None)).unwrap_err();
        assert!(matches!(err, ReaderError::Parse { cause: None, .. }));
    }
}
