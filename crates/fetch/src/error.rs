//! Error types produced by the fetch crate.
//!
//! | Error | Category | Retryable |
//! |-------|----------|-----------|
//! | [`Blocked`](FetchError::Blocked), [`RedirectBlocked`](FetchError::RedirectBlocked) | Validation | no |
//! | [`UnsupportedContentType`](FetchError::UnsupportedContentType), [`BinaryContent`](FetchError::BinaryContent), [`Decode`](FetchError::Decode), [`UnsupportedCharset`](FetchError::UnsupportedCharset) | Content policy | no |
//! | [`ContentLengthExceeded`](FetchError::ContentLengthExceeded), [`SizeExceeded`](FetchError::SizeExceeded) | Size limit | no |
//! | [`Transport`](FetchError::Transport), [`Timeout`](FetchError::Timeout), [`HttpStatus`](FetchError::HttpStatus) | Upstream | caller decides |

use guard::GuardError;
use thiserror::Error;

/// Failures while downloading a document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FetchError {
    /// The initial URL failed SSRF validation.
    #[error(transparent)]
    Blocked(#[from] GuardError),

    /// A redirect target failed SSRF validation. The hop was not followed.
    #[error("redirect to {location} blocked by SSRF guard: {source}")]
    RedirectBlocked {
        location: String,
        #[source]
        source: GuardError,
    },

    /// Redirect response without a usable `Location`.
    #[error("invalid redirect: {0}")]
    InvalidRedirect(String),

    /// Redirect chain longer than the policy allows.
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(u32),

    /// Declared content type missing or outside the allowlist.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Body sniffed as binary regardless of its declared type.
    #[error("binary content detected: {0}")]
    BinaryContent(&'static str),

    /// Declared charset is not one we decode.
    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),

    /// Body bytes are invalid for the declared charset.
    #[error("could not decode body as {charset}: {reason}")]
    Decode { charset: String, reason: String },

    /// Declared `Content-Length` over the ceiling; no body bytes were read.
    #[error("Content-Length {declared} exceeds limit of {limit} bytes")]
    ContentLengthExceeded { declared: u64, limit: u64 },

    /// Streamed body crossed the ceiling; the download was aborted.
    #[error("download exceeded limit of {limit} bytes")]
    SizeExceeded { limit: u64 },

    /// Non-success, non-redirect status from the remote.
    #[error("remote returned HTTP {0}")]
    HttpStatus(u16),

    #[error("download timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    /// Policy or client construction problem.
    #[error("invalid download policy: {0}")]
    InvalidPolicy(String),
}

impl FetchError {
    /// Content-type, sniffing and decoding rejections.
    pub fn is_content_policy(&self) -> bool {
        matches!(
            self,
            FetchError::UnsupportedContentType(_)
                | FetchError::BinaryContent(_)
                | FetchError::UnsupportedCharset(_)
                | FetchError::Decode { .. }
        )
    }

    pub fn is_size_limit(&self) -> bool {
        matches!(
            self,
            FetchError::ContentLengthExceeded { .. } | FetchError::SizeExceeded { .. }
        )
    }

    /// SSRF rejections, initial or mid-redirect.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            FetchError::Blocked(_) | FetchError::RedirectBlocked { .. }
        )
    }

    /// Suggested HTTP status when surfaced to a client.
    pub fn http_status_code(&self) -> u16 {
        if self.is_blocked() {
            400
        } else if self.is_size_limit() {
            413
        } else if self.is_content_policy() {
            422
        } else {
            502
        }
    }

    /// Short label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            FetchError::Blocked(_) | FetchError::RedirectBlocked { .. } => "blocked",
            FetchError::InvalidRedirect(_) | FetchError::TooManyRedirects(_) => "redirect",
            FetchError::UnsupportedContentType(_) => "content_type",
            FetchError::BinaryContent(_) => "binary",
            FetchError::UnsupportedCharset(_) | FetchError::Decode { .. } => "decode",
            FetchError::ContentLengthExceeded { .. } | FetchError::SizeExceeded { .. } => "size",
            FetchError::HttpStatus(_) => "http_status",
            FetchError::Timeout => "timeout",
            FetchError::Transport(_) => "transport",
            FetchError::InvalidPolicy(_) => "policy",
        }
    }
}
