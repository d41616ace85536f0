use guard::GuardError;
use thiserror::Error;

/// Why a delivery attempt did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeliveryError {
    /// Target failed SSRF re-validation. Nothing was sent.
    #[error("webhook URL blocked: {0}")]
    Blocked(#[from] GuardError),
    /// Network-level failure before a response arrived.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    /// 5xx from the receiver.
    #[error("receiver returned server error {0}")]
    ServerError(u16),
    /// Any other non-2xx. Treated as a permanent rejection.
    #[error("receiver rejected delivery with status {0}")]
    Rejected(u16),
    /// Payload or client could not be prepared.
    #[error("invalid delivery: {0}")]
    Invalid(String),
}

impl DeliveryError {
    /// Transport failures and 5xx responses are retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Transport(_) | DeliveryError::Timeout | DeliveryError::ServerError(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeliveryError::Blocked(_) => "blocked",
            DeliveryError::Transport(_) => "transport",
            DeliveryError::Timeout => "timeout",
            DeliveryError::ServerError(_) => "server_error",
            DeliveryError::Rejected(_) => "rejected",
            DeliveryError::Invalid(_) => "invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(DeliveryError::ServerError(503).is_retryable());
        assert!(DeliveryError::Timeout.is_retryable());
        assert!(DeliveryError::Transport("reset".into()).is_retryable());
        assert!(!DeliveryError::Rejected(404).is_retryable());
        assert!(!DeliveryError::Invalid("bad header".into()).is_retryable());
    }

    #[test]
    fn messages() {
        assert!(DeliveryError::Rejected(410).to_string().contains("410"));
        assert!(DeliveryError::ServerError(500).to_string().contains("server error"));
    }
}
