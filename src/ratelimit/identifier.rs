//! Actor identification for admission checks.
//!
//! Authenticated callers are keyed by user id, everyone else by client
//! address. The address comes from an ordered chain of proxy headers that is
//! configured per deployment, then the socket peer.

use axum::http::{HeaderMap, HeaderName};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use tracing::trace;

use crate::error::{Result, TollgateError};

/// Client address used when nothing identifies the caller.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Header chain used when the deployment does not configure one.
pub const DEFAULT_TRUSTED_HEADERS: [&str; 3] = ["cf-connecting-ip", "x-real-ip", "x-forwarded-for"];

const MAX_ADDRESS_LEN: usize = 64;
const MAX_USER_ID_LEN: usize = 128;

/// The resolved actor for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Stable key counted against policies (`user_{id}` or `ip_{address}`)
    pub identifier: String,
    /// Best-effort client address, recorded on events
    pub client_ip: String,
}

/// Derives actor identifiers from session state and request metadata.
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    trusted_headers: Vec<HeaderName>,
}

impl IdentifierResolver {
    /// Create a resolver trusting `headers` in precedence order.
    ///
    /// Only list headers that a reverse proxy you control sets or overwrites;
    /// anything else lets clients choose their own identity.
    pub fn new<S: AsRef<str>>(headers: &[S]) -> Result<Self> {
        let trusted_headers = headers
            .iter()
            .map(|h| {
                let name = h.as_ref().trim().to_ascii_lowercase();
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    TollgateError::Config(format!("invalid trusted header '{}': {}", h.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { trusted_headers })
    }

    /// Resolver that trusts no proxy headers and keys on the socket peer only.
    pub fn peer_only() -> Self {
        Self {
            trusted_headers: Vec::new(),
        }
    }

    /// Resolve the identifier for a request.
    ///
    /// Never fails: a request without any usable address resolves to
    /// `ip_unknown`.
    pub fn resolve(
        &self,
        user_id: Option<&str>,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
    ) -> String {
        self.resolve_actor(user_id, headers, peer).identifier
    }

    /// Resolve both the identifier and the client address.
    pub fn resolve_actor(
        &self,
        user_id: Option<&str>,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
    ) -> Actor {
        let client_ip = self.client_address(headers, peer);

        let identifier = match user_id.and_then(sanitize_user_id) {
            Some(id) => format!("user_{}", id),
            None => format!("ip_{}", client_ip),
        };

        trace!(identifier = %identifier, client_ip = %client_ip, "Resolved actor");
        Actor {
            identifier,
            client_ip,
        }
    }

    /// The client address from the trusted header chain, then the peer.
    ///
    /// Header values must parse as an IP address, optionally bracketed or
    /// with a port; the port is dropped so one client keeps one identifier.
    pub fn client_address(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> String {
        for name in &self.trusted_headers {
            let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            // forwarded-for style lists carry the original client first
            let first_hop = value.split(',').next().unwrap_or_default().trim();
            if let Some(ip) = parse_address(first_hop) {
                return ip.to_string();
            }
        }

        match peer {
            Some(ip) => ip.to_string(),
            None => UNKNOWN_ADDRESS.to_string(),
        }
    }
}

impl Default for IdentifierResolver {
    fn default() -> Self {
        Self {
            trusted_headers: DEFAULT_TRUSTED_HEADERS
                .into_iter()
                .map(HeaderName::from_static)
                .collect(),
        }
    }
}

/// Parse `1.2.3.4`, `1.2.3.4:8080`, `2001:db8::1`, `[2001:db8::1]` or
/// `[2001:db8::1]:443` into the bare address.
fn parse_address(value: &str) -> Option<IpAddr> {
    if value.is_empty() || value.len() > MAX_ADDRESS_LEN {
        return None;
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .and_then(|v| v.parse::<Ipv6Addr>().ok())
        .map(IpAddr::V6)
}

fn sanitize_user_id(id: &str) -> Option<&str> {
    let id = id.trim();
    let valid = !id.is_empty()
        && id.len() <= MAX_USER_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    valid.then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::net::Ipv4Addr;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 9)))
    }

    #[test]
    fn test_authenticated_user_wins() {
        let resolver = IdentifierResolver::default();
        let map = headers(&[("x-real-ip", "10.0.0.1")]);

        assert_eq!(resolver.resolve(Some("42"), &map, peer()), "user_42");
    }

    #[test]
    fn test_header_precedence() {
        let resolver = IdentifierResolver::default();
        let map = headers(&[
            ("x-forwarded-for", "10.0.0.3, 10.0.0.4"),
            ("x-real-ip", "10.0.0.2"),
            ("cf-connecting-ip", "10.0.0.1"),
        ]);
        assert_eq!(resolver.resolve(None, &map, peer()), "ip_10.0.0.1");

        let map = headers(&[
            ("x-forwarded-for", "10.0.0.3, 10.0.0.4"),
            ("x-real-ip", "10.0.0.2"),
        ]);
        assert_eq!(resolver.resolve(None, &map, peer()), "ip_10.0.0.2");
    }

    #[test]
    fn test_forwarded_for_first_hop() {
        let resolver = IdentifierResolver::default();
        let map = headers(&[("x-forwarded-for", " 203.0.113.7 , 10.0.0.4")]);

        assert_eq!(resolver.client_address(&map, peer()), "203.0.113.7");
    }

    #[test]
    fn test_falls_back_to_peer() {
        let resolver = IdentifierResolver::default();
        assert_eq!(resolver.resolve(None, &HeaderMap::new(), peer()), "ip_192.168.0.9");
    }

    #[test]
    fn test_unknown_sentinel() {
        let resolver = IdentifierResolver::default();
        let actor = resolver.resolve_actor(None, &HeaderMap::new(), None);

        assert_eq!(actor.client_ip, UNKNOWN_ADDRESS);
        assert_eq!(actor.identifier, "ip_unknown");
    }

    #[test]
    fn test_malformed_values_are_skipped() {
        let resolver = IdentifierResolver::default();
        let map = headers(&[
            ("cf-connecting-ip", "<script>"),
            ("x-real-ip", ""),
            ("x-forwarded-for", "2001:db8::1"),
        ]);

        assert_eq!(resolver.client_address(&map, None), "2001:db8::1");
    }

    #[test]
    fn test_non_address_values_are_skipped() {
        let resolver = IdentifierResolver::default();
        let map = headers(&[
            ("cf-connecting-ip", "cafe"),
            ("x-real-ip", "1.2.3"),
            ("x-forwarded-for", "deadbeef::1::2, 10.0.0.4"),
        ]);

        assert_eq!(resolver.client_address(&map, peer()), "192.168.0.9");
    }

    #[test]
    fn test_port_and_brackets_are_stripped() {
        let resolver = IdentifierResolver::default();

        let map = headers(&[("x-real-ip", "1.2.3.4:8080")]);
        assert_eq!(resolver.resolve(None, &map, None), "ip_1.2.3.4");

        let map = headers(&[("x-real-ip", "[2001:db8::1]:443")]);
        assert_eq!(resolver.client_address(&map, None), "2001:db8::1");

        let map = headers(&[("x-real-ip", "[2001:DB8:0::1]")]);
        assert_eq!(resolver.client_address(&map, None), "2001:db8::1");

        // the same client on two source ports shares one identifier
        let a = headers(&[("x-forwarded-for", "203.0.113.7:50000")]);
        let b = headers(&[("x-forwarded-for", "203.0.113.7:50001")]);
        assert_eq!(resolver.resolve(None, &a, None), resolver.resolve(None, &b, None));
    }

    #[test]
    fn test_malformed_user_id_falls_back_to_address() {
        let resolver = IdentifierResolver::default();
        let map = headers(&[("x-real-ip", "10.0.0.2")]);

        assert_eq!(resolver.resolve(Some("  "), &map, None), "ip_10.0.0.2");
        assert_eq!(resolver.resolve(Some("a b;c"), &map, None), "ip_10.0.0.2");
    }

    #[test]
    fn test_custom_chain_ignores_untrusted_headers() {
        let resolver = IdentifierResolver::new(&["X-Client-IP"]).unwrap();
        let map = headers(&[("cf-connecting-ip", "10.0.0.1"), ("x-client-ip", "10.9.9.9")]);
        assert_eq!(resolver.client_address(&map, peer()), "10.9.9.9");

        let resolver = IdentifierResolver::peer_only();
        assert_eq!(resolver.client_address(&map, peer()), "192.168.0.9");
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        assert!(IdentifierResolver::new(&["bad header"]).is_err());
    }
}
