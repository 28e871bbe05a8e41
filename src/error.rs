//! Error taxonomy shared by the store, the reconciler and the update loop.
//!
//! Every variant renders as `message: 'resource'[: CauseType: cause]` so a
//! failure can be diagnosed from a log line alone.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::storage::ResourceId;

// ============================================================================
// Error Cause
// ============================================================================

/// An underlying error chained to a [`ReaderError`].
///
/// Keeps the type name of the original error next to the boxed value, since
/// `dyn Error` cannot report it after erasure.
pub struct ErrorCause {
    type_name: &'static str,
    inner: Box<dyn StdError + Send + Sync + 'static>,
}

impl ErrorCause {
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            type_name: std::any::type_name::<E>(),
            inner: Box::new(err),
        }
    }

    /// A cause that only exists as text (e.g. a parser's bozo message).
    pub fn message(type_name: &'static str, message: impl Into<String>) -> Self {
        Self {
            type_name,
            inner: Box::new(MessageError(message.into())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.inner)
    }
}

impl fmt::Debug for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorCause")
            .field("type_name", &self.type_name)
            .field("inner", &self.inner)
            .finish()
    }
}

impl StdError for ErrorCause {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.inner)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageError {}

/// Renders `: <cause>` or nothing.
struct CauseSuffix<'a>(&'a Option<ErrorCause>);

impl fmt::Display for CauseSuffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(cause) => write!(f, ": {}", cause),
            None => Ok(()),
        }
    }
}

fn suffix(cause: &Option<ErrorCause>) -> CauseSuffix<'_> {
    CauseSuffix(cause)
}

// ============================================================================
// Reader Error
// ============================================================================

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("feed exists: {url:?}")]
    FeedExists { url: String },

    #[error("no such feed: {url:?}")]
    FeedNotFound { url: String },

    #[error("invalid feed URL: {url:?}{}", suffix(.cause))]
    InvalidFeedUrl {
        url: String,
        #[source]
        cause: Option<ErrorCause>,
    },

    /// The parser signaled a malformed document or a retrieval failure.
    /// Per-feed and never fatal to a batch update.
    #[error("{message}: {url:?}{}", suffix(.cause))]
    Parse {
        url: String,
        message: String,
        #[source]
        cause: Option<ErrorCause>,
    },

    #[error("no such entry: ({feed_url:?}, {id:?})")]
    EntryNotFound { feed_url: String, id: String },

    #[error("{message}{}", suffix(.cause))]
    Storage {
        message: String,
        #[source]
        cause: Option<ErrorCause>,
    },

    #[error("no such tag: {resource}: {key:?}")]
    TagNotFound { resource: ResourceId, key: String },
}

impl ReaderError {
    pub fn feed_not_found(url: impl Into<String>) -> Self {
        ReaderError::FeedNotFound { url: url.into() }
    }

    pub fn entry_not_found(feed_url: impl Into<String>, id: impl Into<String>) -> Self {
        ReaderError::EntryNotFound {
            feed_url: feed_url.into(),
            id: id.into(),
        }
    }

    /// A parse error with a chained cause.
    pub fn parse<E>(url: impl Into<String>, err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ReaderError::Parse {
            url: url.into(),
            message: "error while updating feed".to_string(),
            cause: Some(ErrorCause::new(err)),
        }
    }

    /// A parse error without an underlying error value.
    pub fn parse_message(url: impl Into<String>, message: impl Into<String>) -> Self {
        ReaderError::Parse {
            url: url.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn storage<E>(message: impl Into<String>, err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ReaderError::Storage {
            message: message.into(),
            cause: Some(ErrorCause::new(err)),
        }
    }

    /// True for the feed/entry/tag not-found family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ReaderError::FeedNotFound { .. }
                | ReaderError::EntryNotFound { .. }
                | ReaderError::TagNotFound { .. }
        )
    }

    /// True for storage failures, which must always reach the caller.
    pub fn is_storage(&self) -> bool {
        matches!(self, ReaderError::Storage { .. })
    }

    /// The resource the error is about, if any.
    pub fn resource_id(&self) -> Option<ResourceId> {
        match self {
            ReaderError::FeedExists { url }
            | ReaderError::FeedNotFound { url }
            | ReaderError::InvalidFeedUrl { url, .. }
            | ReaderError::Parse { url, .. } => Some(ResourceId::Feed(url.clone())),
            ReaderError::EntryNotFound { feed_url, id } => {
                Some(ResourceId::Entry(feed_url.clone(), id.clone()))
            }
            ReaderError::TagNotFound { resource, .. } => Some(resource.clone()),
            ReaderError::Storage { .. } => None,
        }
    }
}

impl From<sqlx::Error> for ReaderError {
    fn from(err: sqlx::Error) -> Self {
        ReaderError::storage("sqlite storage error", err)
    }
}

pub type Result<T, E = ReaderError> = std::result::Result<T, E>;
