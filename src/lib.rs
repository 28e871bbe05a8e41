//! Feed reconciliation and storage engine.
//!
//! Polls subscribed feeds through an injected [`FeedParser`], merges each
//! snapshot into SQLite under a newer-wins rule, and serves entries back in a
//! stable `(updated DESC, feed_url, id)` order without blocking writers.
//!
//! ```ignore
//! use std::sync::Arc;
//! use feedrec::{HttpFeedParser, Reader, ReaderConfig, EntryFilter};
//!
//! let config = ReaderConfig::default();
//! let parser = Arc::new(HttpFeedParser::new(&config.fetch)?);
//! let reader = Reader::open("feeds.db", parser, config).await?;
//! reader.add_feed("https://example.com/feed.xml").await?;
//! let results = reader.update_feeds().await?;
//! let mut entries = reader.get_entries(EntryFilter::unread());
//! ```

pub mod config;
pub mod error;
pub mod feed;
pub mod mark_as_read;
pub mod reader;
pub mod reconcile;
pub mod storage;
pub mod util;

pub use config::{ConfigError, FetchConfig, ReaderConfig, StorageConfig};
pub use error::{ErrorCause, ReaderError, Result};
pub use feed::{FeedParser, HttpFeedParser, ParseResponse};
pub use reader::{FeedUpdate, Reader, UpdateResults};
pub use reconcile::ReconcileOutcome;
pub use storage::{
    BozoException, CachingInfo, Content, Database, Enclosure, Entry, EntryData, EntryFilter,
    Feed, FeedData, ParsedFeed, ResourceId,
};
