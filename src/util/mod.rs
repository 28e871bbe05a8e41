//! Utility functions shared by the engine.
//!
//! - **URL validation**: which feed URLs the engine accepts

mod url_validator;

pub use url_validator::{validate_feed_url, UrlValidationError};
