use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Resource Identity
// ============================================================================

/// Identity of a taggable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    /// A feed, by URL.
    Feed(String),
    /// An entry, by (feed URL, entry id).
    Entry(String, String),
}

impl ResourceId {
    pub fn feed_url(&self) -> &str {
        match self {
            ResourceId::Feed(url) | ResourceId::Entry(url, _) => url,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Feed(url) => write!(f, "{:?}", url),
            ResourceId::Entry(url, id) => write!(f, "{:?}: {:?}", url, id),
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed as stored.
///
/// Everything except `url` stays `None` until the first successful update.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Feed {
    pub url: String,
    pub updated: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
}

impl Feed {
    /// A feed that was added but never updated.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            updated: None,
            title: None,
            link: None,
            author: None,
        }
    }
}

/// A piece of entry content (e.g. the HTML body).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Content {
    pub value: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// An external file attached to an entry (podcast audio, etc.).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Enclosure {
    pub href: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

/// An entry as stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    pub feed_url: String,
    pub id: String,
    pub updated: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub content: Vec<Content>,
    pub enclosures: Vec<Enclosure>,
    pub read: bool,
}

impl Entry {
    pub fn resource_id(&self) -> ResourceId {
        ResourceId::Entry(self.feed_url.clone(), self.id.clone())
    }
}

// ============================================================================
// Parser Snapshot Types
// ============================================================================

/// Feed metadata as reported by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedData {
    pub url: String,
    pub updated: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
}

/// One entry as reported by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryData {
    pub id: String,
    pub updated: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub content: Vec<Content>,
    pub enclosures: Vec<Enclosure>,
}

impl EntryData {
    /// The stored form of a freshly seen entry (always unread).
    pub fn into_entry(self, feed_url: &str) -> Entry {
        Entry {
            feed_url: feed_url.to_string(),
            id: self.id,
            updated: self.updated,
            title: self.title,
            link: self.link,
            author: self.author,
            published: self.published,
            summary: self.summary,
            content: self.content,
            enclosures: self.enclosures,
            read: false,
        }
    }
}

/// Conditional-fetch metadata carried between updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachingInfo {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Why a document was flagged as malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BozoException {
    /// The declared encoding was wrong but the document was recovered.
    EncodingOverride(String),
    /// The document could not be parsed reliably.
    Malformed(String),
}

/// Everything the parser collaborator returns for one successful fetch.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub feed: FeedData,
    pub entries: Vec<EntryData>,
    pub caching: CachingInfo,
    pub bozo: bool,
    pub bozo_exception: Option<BozoException>,
    /// Detected format, e.g. `rss2.0`, `atom`, `json`.
    pub version: Option<String>,
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
}

// ============================================================================
// Query Types
// ============================================================================

/// Filter for entry listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    /// `Some(false)` for unread only, `Some(true)` for read only.
    pub read: Option<bool>,
    /// Restrict to one feed.
    pub feed_url: Option<String>,
}

impl EntryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn unread() -> Self {
        Self {
            read: Some(false),
            feed_url: None,
        }
    }

    pub fn with_feed(mut self, feed_url: impl Into<String>) -> Self {
        self.feed_url = Some(feed_url.into());
        self
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
///
/// The width is only fixed for years 0000 to 9999; parsers drop values
/// outside that range (see `feed::parse_document`).
pub(crate) fn encode_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    let value = value?;
    match DateTime::parse_from_rfc3339(&value) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(value = %value, error = %e, "Unparseable stored timestamp, treating as missing");
            None
        }
    }
}

fn decode_json_list<T: serde::de::DeserializeOwned>(value: &str, column: &str) -> Vec<T> {
    match serde_json::from_str(value) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(column = column, error = %e, "Corrupt JSON column, treating as empty");
            Vec::new()
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct FeedDbRow {
    pub url: String,
    pub updated: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
}

impl FeedDbRow {
    pub fn into_feed(self) -> Feed {
        Feed {
            url: self.url,
            updated: decode_timestamp(self.updated),
            title: self.title,
            link: self.link,
            author: self.author,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct EntryDbRow {
    pub feed_url: String,
    pub id: String,
    pub updated: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<String>,
    pub summary: Option<String>,
    pub content: String,
    pub enclosures: String,
    pub read: bool,
}

impl EntryDbRow {
    pub fn into_entry(self) -> Entry {
        Entry {
            content: decode_json_list(&self.content, "content"),
            enclosures: decode_json_list(&self.enclosures, "enclosures"),
            feed_url: self.feed_url,
            id: self.id,
            updated: decode_timestamp(self.updated),
            title: self.title,
            link: self.link,
            author: self.author,
            published: decode_timestamp(self.published),
            summary: self.summary,
            read: self.read,
        }
    }
}

/// Joined row for entry listings: the entry plus its feed's columns.
#[derive(Debug, FromRow)]
pub(crate) struct EntryWithFeedRow {
    #[sqlx(flatten)]
    pub entry: EntryDbRow,
    pub f_updated: Option<String>,
    pub f_title: Option<String>,
    pub f_link: Option<String>,
    pub f_author: Option<String>,
    /// Sort key: `COALESCE(updated, '')`.
    pub sort_updated: String,
}

impl EntryWithFeedRow {
    pub fn into_pair(self) -> (String, (Feed, Entry)) {
        let feed = Feed {
            url: self.entry.feed_url.clone(),
            updated: decode_timestamp(self.f_updated),
            title: self.f_title,
            link: self.f_link,
            author: self.f_author,
        };
        (self.sort_updated, (feed, self.entry.into_entry()))
    }
}
