//! Error types produced by the guard crate.
//!
//! Every variant carries the `purpose` the URL was validated for (for example
//! `document_url` or `callback_url`) so HTTP callers can name the offending
//! field back to the client.

use std::net::IpAddr;

use thiserror::Error;

/// Reasons an outbound URL is refused.
///
/// All variants are client-side validation failures. None of them are
/// retryable, including [`GuardError::Unresolvable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GuardError {
    /// The string is not a parseable absolute URL.
    #[error("{purpose}: invalid URL: {reason}")]
    InvalidUrl { purpose: String, reason: String },

    /// Only `http` and `https` are permitted.
    #[error("{purpose}: scheme '{scheme}' is not allowed, expected http or https")]
    DisallowedScheme { purpose: String, scheme: String },

    /// URL parsed but carries no host component.
    #[error("{purpose}: URL has no hostname")]
    MissingHost { purpose: String },

    /// DNS lookup failed or returned no addresses.
    #[error("{purpose}: could not resolve hostname '{host}': {reason}")]
    Unresolvable {
        purpose: String,
        host: String,
        reason: String,
    },

    /// An allowlist is configured and the host is not on it.
    #[error("{purpose}: domain '{host}' is not in the allowed domain list")]
    DomainNotAllowed { purpose: String, host: String },

    /// At least one resolved address lies in a blocked network.
    #[error("{purpose}: '{host}' resolves to blocked address {addr}")]
    BlockedAddress {
        purpose: String,
        host: String,
        addr: IpAddr,
    },
}

impl GuardError {
    /// The field name this URL was validated for.
    pub fn purpose(&self) -> &str {
        match self {
            GuardError::InvalidUrl { purpose, .. }
            | GuardError::DisallowedScheme { purpose, .. }
            | GuardError::MissingHost { purpose }
            | GuardError::Unresolvable { purpose, .. }
            | GuardError::DomainNotAllowed { purpose, .. }
            | GuardError::BlockedAddress { purpose, .. } => purpose,
        }
    }
}
