use thiserror::Error;

/// Errors surfaced by storage backends and the typed stores above them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The storage engine failed (I/O, transaction, poisoned lock).
    #[error("store backend error: {0}")]
    Backend(String),
    /// A stored value could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(String),
    /// The requested backend is not compiled in.
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        StoreError::Backend(msg.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_message() {
        let err = StoreError::backend("poisoned lock");
        assert!(err.to_string().contains("store backend error"));
        assert!(err.to_string().contains("poisoned lock"));
    }

    #[test]
    fn from_serde_json() {
        let err: StoreError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
