use thiserror::Error;
use url::Url;

use crate::error::{ErrorCause, ReaderError};

/// Why a feed URL was rejected.
///
/// Chained as the cause of `ReaderError::InvalidFeedUrl`.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme the default parser cannot retrieve.
    #[error("Unsupported scheme: {0} (only http/https/file allowed)")]
    UnsupportedScheme(String),
    /// An http(s) URL without a host.
    #[error("Missing host")]
    MissingHost,
}

/// Validates a URL string for use as a feed key.
///
/// Accepts `http`, `https` and `file` URLs; http(s) URLs need a host.
/// The input string (not the normalized [`Url`]) stays the feed's key, so
/// callers must store `url_str` unchanged.
///
/// # Examples
///
/// ```
/// use feedrec::util::validate_feed_url;
///
/// assert!(validate_feed_url("https://example.com/feed.xml").is_ok());
/// assert!(validate_feed_url("file:///tmp/feed.xml").is_ok());
/// assert!(validate_feed_url("ftp://example.com/feed").is_err());
/// assert!(validate_feed_url("not a url").is_err());
/// ```
pub fn validate_feed_url(url_str: &str) -> Result<Url, ReaderError> {
    check(url_str).map_err(|e| ReaderError::InvalidFeedUrl {
        url: url_str.to_string(),
        cause: Some(ErrorCause::new(e)),
    })
}

fn check(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {
            if url.host_str().map_or(true, str::is_empty) {
                return Err(UrlValidationError::MissingHost);
            }
        }
        "file" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        assert!(validate_feed_url("https://example.com/feed.xml").is_ok());
        assert!(validate_feed_url("http://news.example.org").is_ok());
        assert!(validate_feed_url("https://example.com:443/feed.xml").is_ok());
        assert!(validate_feed_url("http://127.0.0.1:8080/feed").is_ok());
    }

    #[test]
    fn test_file_urls_accepted() {
        assert!(validate_feed_url("file:///var/feeds/local.xml").is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        assert!(validate_feed_url("ftp://example.com").is_err());
        assert!(validate_feed_url("javascript:alert(1)").is_err());
    }

    #[test]
    fn test_unparseable_url() {
        match validate_feed_url("not a url") {
            Err(ReaderError::InvalidFeedUrl { url, cause }) => {
                assert_eq!(url, "not a url");
                let cause = cause.expect("cause should be chained");
                assert!(cause.type_name().ends_with("UrlValidationError"));
            }
            other => panic!("Expected InvalidFeedUrl, got {:?}", other),
        }
    }

    #[test]
    fn test_error_message_names_scheme() {
        let err = validate_feed_url("gopher://example.com/").unwrap_err();
        assert!(err.to_string().contains("gopher"), "{}", err);
    }
}
