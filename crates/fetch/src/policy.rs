use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::FetchError;

/// Media types accepted by default. Parameters such as `charset` are ignored
/// when matching.
pub const DEFAULT_ALLOWED_CONTENT_TYPES: &[&str] = &[
    "text/plain",
    "text/markdown",
    "text/x-markdown",
    "application/markdown",
];

/// Limits applied to every download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPolicy {
    /// Whole-request timeout per hop.
    pub timeout: Duration,
    /// Body ceiling in bytes.
    pub max_bytes: u64,
    /// Lowercase media types, no parameters.
    pub allowed_content_types: Vec<String>,
    /// Redirects followed before giving up.
    pub max_redirects: u32,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 50 * 1024 * 1024,
            allowed_content_types: DEFAULT_ALLOWED_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_redirects: 5,
        }
    }
}

impl DownloadPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn validate(&self) -> Result<(), FetchError> {
        if self.max_bytes == 0 {
            return Err(FetchError::InvalidPolicy("max_bytes must be > 0".into()));
        }
        if self.timeout.is_zero() {
            return Err(FetchError::InvalidPolicy("timeout must be > 0".into()));
        }
        if self.allowed_content_types.is_empty() {
            return Err(FetchError::InvalidPolicy(
                "allowed_content_types must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// True when the media type part of `content_type` is on the allowlist.
    pub fn allows_content_type(&self, content_type: &str) -> bool {
        let media = media_type(content_type);
        !media.is_empty() && self.allowed_content_types.iter().any(|t| t == &media)
    }
}

/// Lowercased media type without parameters.
pub(crate) fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Value of the `charset` parameter, if any.
pub(crate) fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    })
}
