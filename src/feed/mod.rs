//! Parser collaborator: retrieves and parses one feed into a snapshot.
//!
//! The engine only sees the [`FeedParser`] trait. The default implementation,
//! [`HttpFeedParser`], is split in two:
//!
//! - [`parser`] - document parsing using the `feed-rs` crate
//! - [`fetcher`] - conditional HTTP retrieval with retries and size limits
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use feedrec::feed::HttpFeedParser;
//!
//! let parser = Arc::new(HttpFeedParser::new(&config.fetch)?);
//! let reader = Reader::new(db, parser, config);
//! ```

mod fetcher;
mod parser;

use futures::future::BoxFuture;

use crate::error::ReaderError;
use crate::storage::{CachingInfo, ParsedFeed};

pub use fetcher::HttpFeedParser;
pub use parser::parse_document;

/// Result of one parser invocation.
#[derive(Debug, Clone)]
pub enum ParseResponse {
    /// The document was retrieved and parsed.
    Parsed(ParsedFeed),
    /// The conditional-fetch metadata says nothing changed.
    NotModified,
}

/// Retrieves and parses a feed.
///
/// Implementations must be shareable across tasks; the engine holds one
/// behind an `Arc` and may call it for several feeds at once.
pub trait FeedParser: Send + Sync {
    /// Fetch and parse `url`, sending `caching` as conditional-fetch headers.
    ///
    /// Retrieval and parse failures are reported as `ReaderError::Parse`.
    fn parse<'a>(
        &'a self,
        url: &'a str,
        caching: &'a CachingInfo,
    ) -> BoxFuture<'a, Result<ParseResponse, ReaderError>>;
}
