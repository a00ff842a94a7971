//! Address helpers for the values a mirror advertises about itself.
//!
//! Configured addresses arrive in loose forms: a full URL
//! (`https://mirror.example/api/`), a `host:port` pair (`192.168.1.8:8000`), or
//! a bare host.  These helpers turn them into the pieces discovery needs.

use std::net::IpAddr;

use url::{Host, Url};

/// Normalises an API base URL.
///
/// Trims whitespace and trailing slashes, adds `http://` when no `http://` or
/// `https://` scheme is present, and appends `/api` unless the path already
/// ends with it.
///
/// # Examples
///
/// ```rust
/// use mirror_core::protocol::normalize_base_url;
///
/// assert_eq!(normalize_base_url("10.0.0.4:8000/"), "http://10.0.0.4:8000/api");
/// assert_eq!(normalize_base_url("https://m.local/api"), "https://m.local/api");
/// ```
pub fn normalize_base_url(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    if with_scheme.ends_with("/api") {
        with_scheme
    } else {
        format!("{with_scheme}/api")
    }
}

/// Splits a configured address into host and port.
///
/// Values containing `://` are parsed as URLs; anything else is treated as
/// `host[:port][/path]`.  Either part is `None` when absent or unparseable.
pub fn parse_host_port(value: &str) -> (Option<String>, Option<u16>) {
    let value = value.trim();
    if value.is_empty() {
        return (None, None);
    }

    if value.contains("://") {
        return match Url::parse(value) {
            Ok(url) => {
                let host = url.host().map(|h| match h {
                    Host::Domain(d) => d.to_string(),
                    Host::Ipv4(ip) => ip.to_string(),
                    Host::Ipv6(ip) => ip.to_string(),
                });
                (host, url.port())
            }
            Err(_) => (None, None),
        };
    }

    let authority = value.split('/').next().unwrap_or(value);
    match authority.rsplit_once(':') {
        Some((host, raw_port)) => {
            let host = (!host.is_empty()).then(|| host.to_string());
            (host, raw_port.parse().ok())
        }
        None => (Some(authority.to_string()), None),
    }
}

/// Returns `true` when `value` is an IPv4 or IPv6 literal.
pub fn is_ip_literal(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
