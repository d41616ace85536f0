//! Docflow SSRF Guard
//!
//! Every URL the system will contact on a caller's behalf passes through
//! [`UrlGuard::validate`]: document sources at submission, each redirect hop
//! while fetching, and webhook targets at delivery time.
//!
//! ## Checks, in order
//!
//! 1. Scheme must be `http` or `https`.
//! 2. The hostname must resolve. A DNS failure is a validation failure.
//! 3. If an allowlist is configured, the hostname must be on it.
//! 4. Every resolved address must lie outside [`BLOCKED_RANGES`].
//!
//! IP-literal hosts skip DNS and are checked directly. HTTP clients install
//! [`GuardedDns`] so the lookup made when connecting is checked as well.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use guard::{GuardConfig, StaticResolver, UrlGuard};
//!
//! # tokio_test_block_on(async {
//! let resolver = StaticResolver::new().with_host("docs.example", ["93.184.216.34".parse().unwrap()]);
//! let guard = UrlGuard::new(&GuardConfig::default()).with_resolver(Arc::new(resolver));
//!
//! assert!(guard.validate("https://docs.example/a.md", "document_url").await.is_ok());
//! assert!(guard.validate("http://127.0.0.1/", "document_url").await.is_err());
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::warn;
use url::{Host, Url};

mod dns;
mod error;
mod resolver;

pub use crate::dns::GuardedDns;
pub use crate::error::GuardError;
pub use crate::resolver::{Resolver, StaticResolver, SystemResolver};

/// Networks no outbound request may reach.
pub const BLOCKED_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "100.64.0.0/10",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "::/128",
    "::1/128",
    "fe80::/10",
    "fc00::/7",
    "::ffff:0:0/96",
    "ff00::/8",
];

/// Guard settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardConfig {
    /// Hostnames permitted as outbound targets. Empty disables the allowlist.
    pub allowed_domains: Vec<String>,
}

impl GuardConfig {
    pub fn with_allowed_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_domains = domains.into_iter().map(Into::into).collect();
        self
    }
}

/// Validates outbound URLs against the blocked networks and the allowlist.
#[derive(Clone)]
pub struct UrlGuard {
    allowed_domains: HashSet<String>,
    blocked_networks: Vec<IpNet>,
    resolver: Arc<dyn Resolver>,
}

impl fmt::Debug for UrlGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlGuard")
            .field("allowed_domains", &self.allowed_domains)
            .field("blocked_networks", &self.blocked_networks)
            .finish_non_exhaustive()
    }
}

impl UrlGuard {
    /// Guard using the system resolver.
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            allowed_domains: config
                .allowed_domains
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            blocked_networks: blocked_networks(),
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Replace the resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Validate `raw` for use as `purpose`, returning the parsed URL.
    pub async fn validate(&self, raw: &str, purpose: &str) -> Result<Url, GuardError> {
        let url = Url::parse(raw).map_err(|e| GuardError::InvalidUrl {
            purpose: purpose.to_string(),
            reason: e.to_string(),
        })?;
        self.validate_url(&url, purpose).await?;
        Ok(url)
    }

    /// Validate an already parsed URL. Used for redirect hops.
    pub async fn validate_url(&self, url: &Url, purpose: &str) -> Result<(), GuardError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GuardError::DisallowedScheme {
                purpose: purpose.to_string(),
                scheme: url.scheme().to_string(),
            });
        }

        let (host, addrs) = match url.host() {
            None => {
                return Err(GuardError::MissingHost {
                    purpose: purpose.to_string(),
                })
            }
            Some(Host::Ipv4(ip)) => (ip.to_string(), vec![IpAddr::V4(ip)]),
            Some(Host::Ipv6(ip)) => (ip.to_string(), vec![IpAddr::V6(ip)]),
            Some(Host::Domain(domain)) if domain.is_empty() => {
                return Err(GuardError::MissingHost {
                    purpose: purpose.to_string(),
                })
            }
            Some(Host::Domain(domain)) => {
                let port = url.port_or_known_default().unwrap_or(80);
                let addrs = self.lookup(domain, port, purpose).await?;
                (domain.to_ascii_lowercase(), addrs)
            }
        };

        if !self.allowed_domains.is_empty() && !self.allowed_domains.contains(&host) {
            warn!(purpose, host = %host, "url_guard_domain_not_allowed");
            return Err(GuardError::DomainNotAllowed {
                purpose: purpose.to_string(),
                host,
            });
        }

        if let Err(err) = self.reject_blocked(&host, &addrs, purpose) {
            warn!(purpose, host = %host, url = %mask_url(url.as_str()), error = %err, "url_guard_blocked");
            return Err(err);
        }

        Ok(())
    }

    /// Resolve `host` and refuse it if any address is blocked. HTTP clients
    /// call this at connect time through [`GuardedDns`], so the addresses
    /// dialled are the addresses checked.
    pub async fn resolve_checked(&self, host: &str, purpose: &str) -> Result<Vec<IpAddr>, GuardError> {
        let addrs = self.lookup(host, 0, purpose).await?;
        if let Err(err) = self.reject_blocked(host, &addrs, purpose) {
            warn!(purpose, host, error = %err, "url_guard_blocked_at_connect");
            return Err(err);
        }
        Ok(addrs)
    }

    async fn lookup(&self, host: &str, port: u16, purpose: &str) -> Result<Vec<IpAddr>, GuardError> {
        let addrs = self
            .resolver
            .lookup(host, port)
            .await
            .map_err(|e| GuardError::Unresolvable {
                purpose: purpose.to_string(),
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        if addrs.is_empty() {
            return Err(GuardError::Unresolvable {
                purpose: purpose.to_string(),
                host: host.to_string(),
                reason: "no addresses returned".to_string(),
            });
        }
        Ok(addrs)
    }

    fn reject_blocked(&self, host: &str, addrs: &[IpAddr], purpose: &str) -> Result<(), GuardError> {
        match addrs.iter().find(|addr| self.is_blocked(**addr)) {
            Some(addr) => Err(GuardError::BlockedAddress {
                purpose: purpose.to_string(),
                host: host.to_string(),
                addr: *addr,
            }),
            None => Ok(()),
        }
    }

    /// True when `addr` falls inside any blocked network.
    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        self.blocked_networks.iter().any(|net| net.contains(&addr))
    }
}

fn blocked_networks() -> Vec<IpNet> {
    BLOCKED_RANGES
        .iter()
        .filter_map(|cidr| cidr.parse().ok())
        .collect()
}

/// Replace the query string with `?<token>` so signed URLs stay out of logs.
pub fn mask_url(url: &str) -> String {
    let Some(q) = url.find('?') else {
        return url.to_string();
    };
    let fragment = url[q..].find('#').map(|f| &url[q + f..]).unwrap_or("");
    format!("{}?<token>{}", &url[..q], fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_with(resolver: StaticResolver) -> UrlGuard {
        UrlGuard::new(&GuardConfig::default()).with_resolver(Arc::new(resolver))
    }

    fn public_resolver() -> StaticResolver {
        StaticResolver::new()
            .with_host("public-host", ["93.184.216.34".parse().unwrap()])
            .with_host("internal.corp", ["10.0.0.5".parse().unwrap()])
            .with_host(
                "mixed.example",
                ["93.184.216.34".parse().unwrap(), "192.168.1.10".parse().unwrap()],
            )
    }

    #[test]
    fn all_blocked_ranges_parse() {
        assert_eq!(blocked_networks().len(), BLOCKED_RANGES.len());
    }

    #[tokio::test]
    async fn loopback_literal_is_blocked() {
        let guard = guard_with(public_resolver());
        for raw in ["http://127.0.0.1/", "http://0.0.0.0:8080/", "http://0.1.2.3/"] {
            let err = guard.validate(raw, "document_url").await.unwrap_err();
            assert!(matches!(err, GuardError::BlockedAddress { .. }), "{raw}");
        }
    }

    #[tokio::test]
    async fn metadata_endpoint_is_blocked() {
        let guard = guard_with(public_resolver());
        let err = guard
            .validate("http://169.254.169.254/latest/meta-data", "document_url")
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::BlockedAddress { .. }));
    }

    #[tokio::test]
    async fn hostname_resolving_to_private_address_is_blocked() {
        let guard = guard_with(public_resolver());
        let err = guard.validate("http://internal.corp/", "callback_url").await.unwrap_err();
        assert_eq!(err.purpose(), "callback_url");
        assert!(err.to_string().contains("10.0.0.5"));
    }

    #[tokio::test]
    async fn public_hostname_passes() {
        let guard = guard_with(public_resolver());
        let url = guard.validate("https://public-host/doc.md", "document_url").await.unwrap();
        assert_eq!(url.host_str(), Some("public-host"));
    }

    #[tokio::test]
    async fn any_blocked_address_among_many_blocks() {
        let guard = guard_with(public_resolver());
        assert!(guard.validate("https://mixed.example/", "document_url").await.is_err());
    }

    #[tokio::test]
    async fn non_http_scheme_rejected() {
        let guard = guard_with(public_resolver());
        let err = guard.validate("file:///etc/passwd", "document_url").await.unwrap_err();
        assert!(matches!(err, GuardError::DisallowedScheme { .. }));
        let err = guard.validate("ftp://public-host/x", "document_url").await.unwrap_err();
        assert!(matches!(err, GuardError::DisallowedScheme { .. }));
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_validation_failure() {
        let guard = guard_with(public_resolver());
        let err = guard.validate("https://nowhere.invalid/", "document_url").await.unwrap_err();
        assert!(matches!(err, GuardError::Unresolvable { .. }));
    }

    #[tokio::test]
    async fn garbage_is_invalid_url() {
        let guard = guard_with(public_resolver());
        let err = guard.validate("not a url", "document_url").await.unwrap_err();
        assert!(matches!(err, GuardError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn allowlist_restricts_hosts() {
        let config = GuardConfig::default().with_allowed_domains(["public-host"]);
        let resolver = public_resolver().with_host("other.example", ["93.184.216.35".parse().unwrap()]);
        let guard = UrlGuard::new(&config).with_resolver(Arc::new(resolver));

        assert!(guard.validate("https://public-host/", "document_url").await.is_ok());
        let err = guard.validate("https://other.example/", "document_url").await.unwrap_err();
        assert!(matches!(err, GuardError::DomainNotAllowed { .. }));
    }

    #[tokio::test]
    async fn ipv6_ranges_blocked() {
        let guard = guard_with(public_resolver());
        for raw in [
            "http://[::1]/",
            "http://[::]/",
            "http://[fe80::1]/",
            "http://[fd00::1]/",
            "http://[::ffff:10.0.0.1]/",
        ] {
            let err = guard.validate(raw, "document_url").await.unwrap_err();
            assert!(matches!(err, GuardError::BlockedAddress { .. }), "{raw}");
        }
    }

    #[test]
    fn unspecified_multicast_and_reserved_are_blocked() {
        let guard = UrlGuard::new(&GuardConfig::default());
        for addr in [
            "0.0.0.0",
            "::",
            "224.0.0.1",
            "239.255.255.250",
            "240.0.0.1",
            "255.255.255.255",
            "ff02::1",
        ] {
            assert!(guard.is_blocked(addr.parse().unwrap()), "{addr}");
        }
        assert!(!guard.is_blocked("93.184.216.34".parse().unwrap()));
        assert!(!guard.is_blocked("2606:2800:220:1::".parse().unwrap()));
    }

    #[test]
    fn cgnat_is_blocked() {
        let guard = UrlGuard::new(&GuardConfig::default());
        assert!(guard.is_blocked("100.64.1.1".parse().unwrap()));
        assert!(!guard.is_blocked("100.128.0.1".parse().unwrap()));
    }

    #[test]
    fn mask_url_hides_query() {
        assert_eq!(
            mask_url("https://bucket.example/doc.md?sig=abc&exp=1"),
            "https://bucket.example/doc.md?<token>"
        );
        assert_eq!(mask_url("https://a.example/x"), "https://a.example/x");
        assert_eq!(
            mask_url("https://a.example/x?t=1#part"),
            "https://a.example/x?<token>#part"
        );
    }
}
