//! Outbound URL policy: only public `http(s)` hosts may be fetched.
//!
//! Checks the literal host of the parsed URL. The `url` crate normalizes
//! shorthand IPv4 forms (`127.1`, `0x7f000001`) before we see them.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use url::{Host, Url};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlPolicyError {
    #[error("invalid URL {url:?}: {reason}")]
    Parse { url: String, reason: String },
    #[error("unsupported URL scheme {0:?} (only http/https)")]
    Scheme(String),
    #[error("URL has no host: {0}")]
    NoHost(String),
    #[error("blocked private or local address: {0}")]
    BlockedHost(String),
}

/// Parse `raw` and reject anything that is not a public http(s) URL.
pub fn validate_public_url(raw: &str) -> Result<Url, UrlPolicyError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|e| UrlPolicyError::Parse {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;
    check_public_url(&url)?;
    Ok(url)
}

/// Policy check for an already parsed URL (used for redirect hops too).
pub fn check_public_url(url: &Url) -> Result<(), UrlPolicyError> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlPolicyError::Scheme(other.to_string())),
    }
    let host = url
        .host()
        .ok_or_else(|| UrlPolicyError::NoHost(url.to_string()))?;
    if is_blocked_host(&host) {
        return Err(UrlPolicyError::BlockedHost(host.to_string()));
    }
    Ok(())
}

pub fn is_blocked_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(name) => {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            name == "localhost"
                || name.ends_with(".localhost")
                || name.ends_with(".local")
                || name == "0.0.0.0"
        }
        Host::Ipv4(ip) => is_blocked_ipv4(ip),
        Host::Ipv6(ip) => is_blocked_ipv6(ip),
    }
}

fn is_blocked_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.octets()[0] == 0
        || is_shared_address_space(ip)
}

/// 100.64.0.0/10, carrier-grade NAT.
fn is_shared_address_space(ip: &Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 100 && (b & 0xc0) == 64
}

fn is_blocked_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(&v4);
    }
    let first = ip.segments()[0];
    // fc00::/7 unique local, fe80::/10 link local
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}
