//! Docflow Safe Fetcher
//!
//! Downloads a caller-supplied document as text without letting the caller
//! steer us at internal services or feed us binaries.
//!
//! ## What happens on [`SafeFetcher::fetch`]
//!
//! - The URL is validated by the [`UrlGuard`]. A client built by
//!   [`SafeFetcher::new`] also resolves through [`GuardedDns`], so the
//!   address it connects to is re-checked.
//! - Redirects are followed by hand, up to [`DownloadPolicy::max_redirects`].
//!   Each `Location` is resolved against the current URL and validated before
//!   any request is sent to it.
//! - The declared `Content-Type` must be on the allowlist. A missing header
//!   is a rejection.
//! - A declared `Content-Length` over the ceiling is rejected before the body
//!   is read. Without one, the body is streamed chunk by chunk and the
//!   download aborts as soon as the ceiling is crossed.
//! - The first 512 bytes are sniffed for binary magic numbers and null bytes.
//! - The body is decoded strictly with the declared charset.

use std::sync::Arc;
use std::time::Instant;

use guard::{mask_url, GuardedDns, UrlGuard};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{redirect, Client, Response};
use tracing::{debug, info, warn};
use url::Url;

mod content;
mod error;
mod policy;

pub use crate::content::{decode, sniff_binary, CappedBuffer, SNIFF_LEN};
pub use crate::error::FetchError;
pub use crate::policy::{DownloadPolicy, DEFAULT_ALLOWED_CONTENT_TYPES};

use crate::policy::{charset_param, media_type};

/// Redirect-aware downloader bound to one guard and one policy.
#[derive(Debug, Clone)]
pub struct SafeFetcher {
    client: Client,
    guard: UrlGuard,
    policy: DownloadPolicy,
}

impl SafeFetcher {
    /// Build a fetcher with its own HTTP client. Automatic redirects are
    /// disabled on that client and its DNS lookups go through the guard.
    pub fn new(guard: UrlGuard, policy: DownloadPolicy) -> Result<Self, FetchError> {
        policy.validate()?;
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .dns_resolver(Arc::new(GuardedDns::new(guard.clone(), "document_url")))
            .timeout(policy.timeout)
            .build()
            .map_err(|e| FetchError::InvalidPolicy(e.to_string()))?;
        Ok(Self {
            client,
            guard,
            policy,
        })
    }

    /// Use a caller-built client. It must not follow redirects itself.
    pub fn with_client(client: Client, guard: UrlGuard, policy: DownloadPolicy) -> Self {
        Self {
            client,
            guard,
            policy,
        }
    }

    pub fn policy(&self) -> &DownloadPolicy {
        &self.policy
    }

    /// Download `raw_url` and return its decoded text.
    pub async fn fetch(&self, raw_url: &str) -> Result<String, FetchError> {
        let start = Instant::now();
        let masked = mask_url(raw_url);
        match self.fetch_inner(raw_url).await {
            Ok(text) => {
                info!(
                    url = %masked,
                    bytes = text.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "fetch_success"
                );
                Ok(text)
            }
            Err(err) => {
                metrics::counter!("docflow_fetch_rejections_total", "reason" => err.reason())
                    .increment(1);
                warn!(
                    url = %masked,
                    error = %err,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "fetch_failure"
                );
                Err(err)
            }
        }
    }

    async fn fetch_inner(&self, raw_url: &str) -> Result<String, FetchError> {
        let mut url = self.guard.validate(raw_url, "document_url").await?;
        let mut hops = 0u32;

        loop {
            let response = self
                .client
                .get(url.clone())
                .timeout(self.policy.timeout)
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if status.is_redirection() {
                if hops >= self.policy.max_redirects {
                    return Err(FetchError::TooManyRedirects(self.policy.max_redirects));
                }
                let next = self.next_hop(&url, &response).await?;
                debug!(from = %mask_url(url.as_str()), to = %mask_url(next.as_str()), "fetch_redirect");
                url = next;
                hops += 1;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            return self.read_body(response).await;
        }
    }

    async fn next_hop(&self, current: &Url, response: &Response) -> Result<Url, FetchError> {
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| FetchError::InvalidRedirect("missing Location header".into()))?;
        let next = current
            .join(location)
            .map_err(|e| FetchError::InvalidRedirect(format!("{location}: {e}")))?;
        self.guard
            .validate_url(&next, "redirect")
            .await
            .map_err(|source| FetchError::RedirectBlocked {
                location: mask_url(next.as_str()),
                source,
            })?;
        Ok(next)
    }

    async fn read_body(&self, mut response: Response) -> Result<String, FetchError> {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !self.policy.allows_content_type(&content_type) {
            let shown = if content_type.is_empty() {
                "<missing>".to_string()
            } else {
                media_type(&content_type)
            };
            return Err(FetchError::UnsupportedContentType(shown));
        }

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(declared) = declared {
            if declared > self.policy.max_bytes {
                return Err(FetchError::ContentLengthExceeded {
                    declared,
                    limit: self.policy.max_bytes,
                });
            }
        }

        let mut buf = CappedBuffer::new(self.policy.max_bytes);
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            buf.push(&chunk)?;
        }
        let bytes = buf.finish()?;
        decode(bytes, charset_param(&content_type).as_deref())
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.without_url().to_string())
    }
}
