//! Durable store: SQLite-backed feeds, entries and tags.
//!
//! Every public method is one short transaction (or one statement). The
//! reconciler composes the `pub(crate)` primitives in `feeds` and `entries`
//! inside a single write transaction of its own.

pub(crate) mod entries;
pub(crate) mod feeds;
mod schema;
mod tags;
mod types;

pub use feeds::FeedForUpdate;
pub use schema::Database;
pub use types::{
    BozoException, CachingInfo, Content, Enclosure, Entry, EntryData, EntryFilter, Feed,
    FeedData, ParsedFeed, ResourceId,
};
