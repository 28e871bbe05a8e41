//! Marks newly added entries as read when their title matches a per-feed rule.
//!
//! A feed opts in with the `.reader.mark-as-read` tag:
//!
//! ```json
//! { "title": ["^\\[ad\\]", "(?i)sponsored"] }
//! ```
//!
//! Only entries inserted by a reconciliation are considered; modified
//! entries keep whatever read state the user gave them.
//!
//! Setting `.reader.mark-as-read.once` (any value) on a feed applies the
//! rules to the feed's existing entries before its next update, once.

use futures::TryStreamExt;
use regex::Regex;
use serde_json::Value;

use crate::error::{ReaderError, Result};
use crate::storage::{Database, EntryData, EntryFilter, ResourceId};

/// Tag key holding the rule configuration.
pub const MARK_AS_READ_TAG: &str = ".reader.mark-as-read";

/// Tag key requesting a one-shot pass over existing entries.
pub const MARK_AS_READ_ONCE_TAG: &str = ".reader.mark-as-read.once";

/// Compiled title patterns for one feed.
#[derive(Debug, Default)]
pub struct TitleRules {
    patterns: Vec<Regex>,
}

impl TitleRules {
    /// Build rules from a tag value.
    ///
    /// Anything other than `{"title": [string, ...]}` is logged and yields
    /// no rules. Patterns that fail to compile are skipped individually.
    pub fn from_value(feed_url: &str, value: &Value) -> Self {
        let Some(raw) = value
            .as_object()
            .map(|o| o.get("title").cloned().unwrap_or(Value::Array(Vec::new())))
            .and_then(|t| match t {
                Value::Array(items) => items
                    .into_iter()
                    .map(|i| match i {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect::<Option<Vec<_>>>(),
                _ => None,
            })
        else {
            tracing::warn!(feed = %feed_url, key = MARK_AS_READ_TAG, "Invalid mark-as-read config");
            return Self::default();
        };

        let patterns = raw
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(feed = %feed_url, pattern = %p, error = %e, "Invalid mark-as-read pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if any pattern matches anywhere in `title` (missing title = "").
    pub fn matches(&self, title: Option<&str>) -> bool {
        let title = title.unwrap_or("");
        self.patterns.iter().any(|re| re.is_match(title))
    }
}

/// Load the rules configured on `feed_url`, if any.
pub async fn load_rules(db: &Database, feed_url: &str) -> Result<TitleRules> {
    let resource = ResourceId::Feed(feed_url.to_string());
    match db.get_tag(&resource, MARK_AS_READ_TAG).await {
        Ok(value) => Ok(TitleRules::from_value(feed_url, &value)),
        Err(ReaderError::TagNotFound { .. }) | Err(ReaderError::FeedNotFound { .. }) => {
            Ok(TitleRules::default())
        }
        Err(e) => Err(e),
    }
}

/// Apply the feed's rules to the entries just inserted.
///
/// `new_ids` are the ids reported by the reconciler; titles come from the
/// snapshot that inserted them. Returns the ids marked as read.
pub async fn apply(
    db: &Database,
    feed_url: &str,
    new_ids: &[String],
    snapshot: &[EntryData],
) -> Result<Vec<String>> {
    if new_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rules = load_rules(db, feed_url).await?;
    if rules.is_empty() {
        return Ok(Vec::new());
    }

    let mut marked = Vec::new();
    for id in new_ids {
        // Duplicate ids in a snapshot: the last occurrence is the one stored.
        let title = snapshot
            .iter()
            .rev()
            .find(|e| &e.id == id)
            .and_then(|e| e.title.as_deref());
        if !rules.matches(title) {
            continue;
        }

        match db.set_entry_read(feed_url, id, true).await {
            Ok(()) => marked.push(id.clone()),
            Err(ReaderError::EntryNotFound { .. }) => {
                tracing::info!(feed = %feed_url, entry = %id, "Entry was deleted, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    if !marked.is_empty() {
        tracing::debug!(feed = %feed_url, count = marked.len(), "Marked entries as read by title");
    }
    Ok(marked)
}

/// Apply the feed's rules to all of its stored entries if the feed carries
/// [`MARK_AS_READ_ONCE_TAG`], then remove that tag.
///
/// Returns the ids marked as read.
pub async fn backfill(db: &Database, feed_url: &str, chunk_size: usize) -> Result<Vec<String>> {
    let resource = ResourceId::Feed(feed_url.to_string());
    match db.get_tag(&resource, MARK_AS_READ_ONCE_TAG).await {
        Ok(_) => {}
        Err(ReaderError::TagNotFound { .. }) | Err(ReaderError::FeedNotFound { .. }) => {
            return Ok(Vec::new())
        }
        Err(e) => return Err(e),
    }
    tracing::info!(feed = %feed_url, tag = MARK_AS_READ_ONCE_TAG, "Backfilling mark-as-read");

    let rules = load_rules(db, feed_url).await?;
    let mut marked = Vec::new();
    if !rules.is_empty() {
        let candidates: Vec<String> = db
            .get_entries(EntryFilter::unread().with_feed(feed_url), chunk_size)
            .try_filter_map(|(_, entry)| {
                let hit = rules.matches(entry.title.as_deref());
                futures::future::ready(Ok(hit.then_some(entry.id)))
            })
            .try_collect()
            .await?;

        for id in candidates {
            match db.set_entry_read(feed_url, &id, true).await {
                Ok(()) => marked.push(id),
                Err(ReaderError::EntryNotFound { .. }) => {
                    tracing::info!(feed = %feed_url, entry = %id, "Entry was deleted, skipping");
                }
                Err(e) => return Err(e),
            }
        }
    }

    match db.delete_tag(&resource, MARK_AS_READ_ONCE_TAG).await {
        Ok(()) | Err(ReaderError::TagNotFound { .. }) | Err(ReaderError::FeedNotFound { .. }) => {}
        Err(e) => return Err(e),
    }
    Ok(marked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::reconcile;
    use crate::storage::{FeedData, ParsedFeed};
    use serde_json::json;

    const FEED: &str = "https://example.com/feed.xml";

    fn entry(id: &str, title: &str) -> EntryData {
        EntryData {
            id: id.into(),
            title: Some(title.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_rules_from_value() {
        let rules = TitleRules::from_value(FEED, &json!({"title": ["^ad", "sponsored"]}));
        assert!(rules.matches(Some("ad: buy now")));
        assert!(rules.matches(Some("this post is sponsored")));
        assert!(!rules.matches(Some("a real post")));
        assert!(!rules.matches(None));
    }

    #[test]
    fn test_invalid_config_yields_no_rules() {
        assert!(TitleRules::from_value(FEED, &json!("^ad")).is_empty());
        assert!(TitleRules::from_value(FEED, &json!({"title": "^ad"})).is_empty());
        assert!(TitleRules::from_value(FEED, &json!({"title": ["^ad", 1]})).is_empty());
        assert!(TitleRules::from_value(FEED, &json!({})).is_empty());
    }

    #[test]
    fn test_bad_pattern_is_skipped() {
        let rules = TitleRules::from_value(FEED, &json!({"title": ["(unclosed", "^ok"]}));
        assert!(rules.matches(Some("ok then")));
        assert!(!rules.matches(Some("(unclosed")));
    }

    #[tokio::test]
    async fn test_apply_marks_matching_new_entries() {
        let db = Database::open(":memory:").await.unwrap();
        db.add_feed(FEED).await.unwrap();
        db.set_tag(
            &ResourceId::Feed(FEED.into()),
            MARK_AS_READ_TAG,
            &json!({"title": ["^One"]}),
        )
        .await
        .unwrap();

        let entries = vec![entry("1", "One"), entry("2", "Two")];
        let parsed = ParsedFeed {
            feed: FeedData {
                url: FEED.into(),
                ..Default::default()
            },
            entries: entries.clone(),
            ..Default::default()
        };
        let outcome = reconcile(&db, FEED, &parsed).await.unwrap();

        let marked = apply(&db, FEED, &outcome.new_entries, &entries).await.unwrap();
        assert_eq!(marked, vec!["1".to_string()]);
        assert!(db.get_entry(FEED, "1").await.unwrap().unwrap().read);
        assert!(!db.get_entry(FEED, "2").await.unwrap().unwrap().read);
    }

    #[tokio::test]
    async fn test_apply_skips_deleted_entries() {
        let db = Database::open(":memory:").await.unwrap();
        db.add_feed(FEED).await.unwrap();
        db.set_tag(
            &ResourceId::Feed(FEED.into()),
            MARK_AS_READ_TAG,
            &json!({"title": [".*"]}),
        )
        .await
        .unwrap();

        // "gone" was never stored.
        let marked = apply(&db, FEED, &["gone".to_string()], &[entry("gone", "x")])
            .await
            .unwrap();
        assert!(marked.is_empty());
    }

    #[tokio::test]
    async fn test_backfill_marks_existing_entries_and_drops_tag() {
        let db = Database::open(":memory:").await.unwrap();
        db.add_feed(FEED).await.unwrap();
        let parsed = ParsedFeed {
            feed: FeedData {
                url: FEED.into(),
                ..Default::default()
            },
            entries: vec![entry("1", "Two of them"), entry("2", "One"), entry("3", "Twofold")],
            ..Default::default()
        };
        reconcile(&db, FEED, &parsed).await.unwrap();

        let feed = ResourceId::Feed(FEED.into());
        db.set_tag(&feed, MARK_AS_READ_TAG, &json!({"title": ["^Two"]}))
            .await
            .unwrap();
        db.set_tag(&feed, MARK_AS_READ_ONCE_TAG, &Value::Null)
            .await
            .unwrap();

        let mut marked = backfill(&db, FEED, 1).await.unwrap();
        marked.sort();
        assert_eq!(marked, vec!["1".to_string(), "3".to_string()]);
        assert!(db.get_entry(FEED, "1").await.unwrap().unwrap().read);
        assert!(!db.get_entry(FEED, "2").await.unwrap().unwrap().read);
        assert!(matches!(
            db.get_tag(&feed, MARK_AS_READ_ONCE_TAG).await,
            Err(ReaderError::TagNotFound { .. })
        ));

        // One-shot: without the tag nothing more happens.
        db.set_entry_read(FEED, "1", false).await.unwrap();
        assert!(backfill(&db, FEED, 1).await.unwrap().is_empty());
        assert!(!db.get_entry(FEED, "1").await.unwrap().unwrap().read);
    }

    #[tokio::test]
    async fn test_backfill_without_rules_still_drops_tag() {
        let db = Database::open(":memory:").await.unwrap();
        db.add_feed(FEED).await.unwrap();
        let feed = ResourceId::Feed(FEED.into());
        db.set_tag(&feed, MARK_AS_READ_ONCE_TAG, &json!(true))
            .await
            .unwrap();

        assert!(backfill(&db, FEED, 0).await.unwrap().is_empty());
        assert!(db.get_tags(&feed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_without_tag_is_noop() {
        let db = Database::open(":memory:").await.unwrap();
        db.add_feed(FEED).await.unwrap();
        let marked = apply(&db, FEED, &["1".to_string()], &[entry("1", "One")])
            .await
            .unwrap();
        assert!(marked.is_empty());
    }
}
