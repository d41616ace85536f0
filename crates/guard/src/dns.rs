//! Connect-time resolution for HTTP clients.
//!
//! [`UrlGuard::validate`] checks the addresses a hostname resolves to, but an
//! HTTP client normally resolves the name again when it dials. Installing
//! [`GuardedDns`] as the client's resolver makes that second lookup go
//! through the guard too, so a name that re-points at a private address
//! between the two lookups fails to connect.

use std::net::SocketAddr;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use crate::UrlGuard;

/// `reqwest` resolver that refuses blocked addresses.
#[derive(Debug, Clone)]
pub struct GuardedDns {
    guard: UrlGuard,
    purpose: &'static str,
}

impl GuardedDns {
    /// `purpose` names the field in errors, as with [`UrlGuard::validate`].
    pub fn new(guard: UrlGuard, purpose: &'static str) -> Self {
        Self { guard, purpose }
    }
}

impl Resolve for GuardedDns {
    fn resolve(&self, name: Name) -> Resolving {
        let guard = self.guard.clone();
        let purpose = self.purpose;
        Box::pin(async move {
            let addrs = guard.resolve_checked(name.as_str(), purpose).await?;
            // The connector fills in the request's port.
            let addrs: Addrs = Box::new(addrs.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}
