//! Docflow Webhook Dispatcher
//!
//! Delivers job outcomes to caller-supplied URLs. Delivery is fire-and-log:
//! [`WebhookDispatcher::deliver`] never returns an error, it returns a
//! [`DeliveryReport`] and logs the outcome.
//!
//! - The target is re-validated by the SSRF guard at delivery time, and the
//!   dispatcher's own client checks the address again when it connects.
//! - With a shared secret configured, every attempt carries a fresh
//!   `X-Webhook-Timestamp` and an `X-Webhook-Signature` computed by [`sign`].
//! - Transport errors and 5xx responses are retried with exponential backoff
//!   up to [`RetryConfig::max_attempts`]. Any other non-2xx is final.
//! - Redirects are not followed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use guard::{mask_url, GuardedDns, UrlGuard};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{redirect, Client};
use serde_json::Value;
use tracing::{error, info, warn};

mod error;
mod retry;
mod signing;

pub use crate::error::DeliveryError;
pub use crate::retry::{calculate_delay, execute_with_retry_async, RetryConfig, RetryResult};
pub use crate::signing::{sign, verify, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    /// Shared signing secret. `None` disables signing.
    pub secret: Option<String>,
    pub retry: RetryConfig,
    /// Per-attempt request timeout.
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl WebhookConfig {
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.secret = if secret.is_empty() { None } else { Some(secret) };
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of one `deliver` call, across all attempts.
pub type DeliveryReport = RetryResult<u16, DeliveryError>;

/// Signs and POSTs JSON payloads with bounded retry.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Client,
    guard: UrlGuard,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    /// Build a dispatcher whose client resolves through the guard.
    pub fn new(guard: UrlGuard, config: WebhookConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .dns_resolver(Arc::new(GuardedDns::new(guard.clone(), "callback_url")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| DeliveryError::Invalid(e.to_string()))?;
        Ok(Self::with_client(client, guard, config))
    }

    /// Use a caller-built client. It must not follow redirects.
    pub fn with_client(client: Client, guard: UrlGuard, config: WebhookConfig) -> Self {
        Self {
            client,
            guard,
            config,
        }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// POST `payload` to `url`. Never fails; the report says what happened.
    pub async fn deliver(
        &self,
        url: &str,
        payload: &Value,
        extra_headers: &HashMap<String, String>,
    ) -> DeliveryReport {
        let masked = mask_url(url);
        let report = self.deliver_inner(url, payload, extra_headers).await;

        let outcome = match &report.result {
            Ok(status) => {
                info!(
                    url = %masked,
                    status,
                    attempts = report.attempts,
                    elapsed_ms = report.total_duration.as_millis() as u64,
                    "webhook_delivered"
                );
                "delivered"
            }
            Err(err) => {
                error!(
                    url = %masked,
                    error = %err,
                    attempts = report.attempts,
                    elapsed_ms = report.total_duration.as_millis() as u64,
                    "webhook_failed"
                );
                err.label()
            }
        };
        metrics::counter!("docflow_webhook_deliveries_total", "outcome" => outcome).increment(1);
        report
    }

    async fn deliver_inner(
        &self,
        url: &str,
        payload: &Value,
        extra_headers: &HashMap<String, String>,
    ) -> DeliveryReport {
        let prepared = async {
            let target = self.guard.validate(url, "callback_url").await?;
            let body = serde_json::to_vec(payload).map_err(|e| DeliveryError::Invalid(e.to_string()))?;
            Ok::<_, DeliveryError>((target, body, build_headers(extra_headers)))
        }
        .await;

        let (target, body, headers) = match prepared {
            Ok(parts) => parts,
            Err(err) => {
                return RetryResult {
                    result: Err(err),
                    attempts: 0,
                    total_duration: Duration::ZERO,
                    succeeded: false,
                }
            }
        };

        execute_with_retry_async(
            &self.config.retry,
            |attempt| {
                let request = self.signed_request(target.clone(), &body, &headers);
                let masked = mask_url(target.as_str());
                async move {
                    metrics::counter!("docflow_webhook_attempts_total").increment(1);
                    let result = match request.send().await {
                        Ok(response) => {
                            let status = response.status();
                            if status.is_success() {
                                Ok(status.as_u16())
                            } else if status.is_server_error() {
                                Err(DeliveryError::ServerError(status.as_u16()))
                            } else {
                                Err(DeliveryError::Rejected(status.as_u16()))
                            }
                        }
                        Err(err) if err.is_timeout() => Err(DeliveryError::Timeout),
                        Err(err) => Err(DeliveryError::Transport(err.without_url().to_string())),
                    };
                    if let Err(err) = &result {
                        warn!(url = %masked, attempt = attempt + 1, error = %err, "webhook_attempt_failed");
                    }
                    result
                }
            },
            DeliveryError::is_retryable,
        )
        .await
    }

    fn signed_request(
        &self,
        target: reqwest::Url,
        body: &[u8],
        headers: &HeaderMap,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(target)
            .headers(headers.clone())
            .timeout(self.config.timeout);

        if let Some(secret) = &self.config.secret {
            let timestamp = unix_now();
            request = request
                .header(SIGNATURE_HEADER, sign(secret, timestamp, body))
                .header(TIMESTAMP_HEADER, timestamp.to_string());
        }

        request.body(body.to_vec())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Caller headers plus `Content-Type`. Invalid names or values are dropped
/// with a warning.
fn build_headers(extra: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in extra {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "webhook_header_skipped"),
        }
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}
