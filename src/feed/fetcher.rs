use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use super::parser::parse_document;
use super::{FeedParser, ParseResponse};
use crate::config::FetchConfig;
use crate::error::ReaderError;
use crate::storage::CachingInfo;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while retrieving a feed document.
///
/// Always chained as the cause of a `ReaderError::Parse`.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Local file could not be read
    #[error("Cannot read file: {0}")]
    File(#[from] std::io::Error),
    /// `file://` URL that does not name a local path
    #[error("Not a local file path: {0}")]
    FilePath(String),
}

/// Default parser collaborator: conditional HTTP GET plus `feed-rs`.
///
/// `file://` URLs are read from disk without caching headers.
#[derive(Debug, Clone)]
pub struct HttpFeedParser {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    /// Base delay for exponential backoff (doubles each retry).
    backoff: Duration,
}

impl HttpFeedParser {
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Use a preconfigured client (custom TLS, proxies, ...).
    pub fn with_client(client: reqwest::Client, config: &FetchConfig) -> Self {
        Self {
            client,
            timeout: config.request_timeout(),
            max_retries: config.max_retries,
            backoff: Duration::from_secs(2),
        }
    }

    /// Override the base backoff delay.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn parse_url(&self, url: &str, caching: &CachingInfo) -> Result<ParseResponse, ReaderError> {
        let fetched = if url.starts_with("file:") {
            let path = local_path(url).map_err(|e| ReaderError::parse(url, e))?;
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| ReaderError::parse(url, FetchError::File(e)))?;
            Fetched::Body {
                bytes,
                status: None,
                headers: HeaderMap::new(),
            }
        } else {
            self.fetch(url, caching)
                .await
                .map_err(|e| ReaderError::parse(url, e))?
        };

        let (bytes, status, headers) = match fetched {
            Fetched::NotModified => {
                tracing::info!(feed = %url, "Feed not modified, skipping");
                return Ok(ParseResponse::NotModified);
            }
            Fetched::Body {
                bytes,
                status,
                headers,
            } => (bytes, status, headers),
        };

        let mut parsed = parse_document(url, &bytes).map_err(|e| ReaderError::parse(url, e))?;
        parsed.caching = CachingInfo {
            etag: header_value(&headers, header::ETAG),
            last_modified: header_value(&headers, header::LAST_MODIFIED),
        };
        parsed.status = status;
        parsed.headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect::<HashMap<_, _>>();

        Ok(ParseResponse::Parsed(parsed))
    }

    async fn fetch(&self, url: &str, caching: &CachingInfo) -> Result<Fetched, FetchError> {
        let mut retry_count = 0;

        loop {
            let mut request = self.client.get(url);
            if let Some(etag) = &caching.etag {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &caching.last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified);
            }

            let response = tokio::time::timeout(self.timeout, request.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                return Ok(Fetched::NotModified);
            }

            // Rate limiting and server errors retry with exponential backoff
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= self.max_retries {
                    return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                        FetchError::RateLimited(self.max_retries)
                    } else {
                        FetchError::HttpStatus(status.as_u16())
                    });
                }

                let delay = self.backoff * 2u32.pow(retry_count);
                tracing::warn!(
                    feed = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Retryable HTTP status, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx errors fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            let headers = response.headers().clone();
            match read_limited_bytes(response, MAX_FEED_SIZE).await {
                Ok(bytes) => {
                    return Ok(Fetched::Body {
                        bytes,
                        status: Some(status.as_u16()),
                        headers,
                    })
                }
                Err(FetchError::IncompleteResponse { expected, received }) => {
                    if retry_count >= self.max_retries {
                        return Err(FetchError::IncompleteResponse { expected, received });
                    }
                    let delay = self.backoff * 2u32.pow(retry_count);
                    tracing::debug!(
                        feed = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl FeedParser for HttpFeedParser {
    fn parse<'a>(
        &'a self,
        url: &'a str,
        caching: &'a CachingInfo,
    ) -> BoxFuture<'a, Result<ParseResponse, ReaderError>> {
        Box::pin(self.parse_url(url, caching))
    }
}

enum Fetched {
    NotModified,
    Body {
        bytes: Vec<u8>,
        status: Option<u16>,
        headers: HeaderMap,
    },
}

/// Percent-decoded filesystem path of a `file://` URL (`localhost` host allowed).
fn local_path(url: &str) -> Result<PathBuf, FetchError> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.to_file_path().ok())
        .ok_or_else(|| FetchError::FilePath(url.to_string()))
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
