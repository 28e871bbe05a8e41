//! Configuration file parser for the reader engine.
//!
//! The config file is optional; a missing file yields `ReaderConfig::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Settings for opening the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// How long a writer waits for the SQLite lock before failing.
    pub busy_timeout_ms: u64,

    /// Pool size for file-backed stores (in-memory stores always use one).
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            max_connections: 5,
        }
    }
}

/// Settings for the default HTTP parser.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-request timeout.
    pub request_timeout_secs: u64,

    /// Retries for 429 and 5xx responses.
    pub max_retries: u32,

    /// User-Agent header sent with every request.
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            max_retries: 3,
            user_agent: format!("feedrec/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Top-level engine configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Rows per read transaction in `get_entries`. 0 = one unchunked query.
    pub entries_chunk_size: usize,

    /// Feeds updated concurrently by `update_feeds`.
    pub update_workers: usize,

    /// Apply the per-feed `.reader.mark-as-read` title rules to new entries.
    pub mark_as_read_by_title: bool,

    pub storage: StorageConfig,

    pub fetch: FetchConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            entries_chunk_size: Self::DEFAULT_CHUNK_SIZE,
            update_workers: 1,
            mark_as_read_by_title: true,
            storage: StorageConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl ReaderConfig {
    pub const DEFAULT_CHUNK_SIZE: usize = 256;

    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(ReaderConfig::default())`
    /// - Empty file → `Ok(ReaderConfig::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "entries_chunk_size",
                "update_workers",
                "mark_as_read_by_title",
                "storage",
                "fetch",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: ReaderConfig = toml::from_str(content)?;
        tracing::info!(
            chunk_size = config.entries_chunk_size,
            workers = config.update_workers,
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
