//! What this mirror tells the LAN about itself.
//!
//! Three values go into every `announce`:
//!
//! | Value    | Precedence (first hit wins)                                           |
//! |----------|-----------------------------------------------------------------------|
//! | IP       | `discovery.advertised_ip` → public base URL host if it is an IP → device address host if it is an IP → auto-detect → `0.0.0.0` |
//! | Port     | public base URL port → device address port → `network.app_port`       |
//! | Base URL | public base URL → `http://<hostname base>:<port>` → `http://<ip>:<port>`, always normalised to end in `/api` |
//!
//! Auto-detect first asks the OS which local address it would use to reach a
//! public host (a UDP "connect" sends nothing), then falls back to resolving
//! the machine's OS hostname (`identity.hostname` only if the OS name cannot
//! be read).  Loopback results are discarded.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use mirror_core::protocol::{is_ip_literal, normalize_base_url, parse_host_port};
use tracing::debug;

use crate::infrastructure::storage::config::AppConfig;

/// Public address used only to pick a route; no packet is sent to it.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Address, port, and base URL advertised in announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub ip: String,
    pub port: u16,
    pub base_url: String,
}

impl Advertisement {
    /// Resolves the advertisement using the host's network interfaces.
    pub fn resolve(config: &AppConfig) -> Self {
        let hostname = lookup_hostname(config, machine_hostname());
        Self::resolve_with(config, || detect_local_ip(&hostname))
    }

    /// Resolves the advertisement with a caller-supplied auto-detect step.
    pub fn resolve_with(config: &AppConfig, detect: impl FnOnce() -> Option<IpAddr>) -> Self {
        let ip = advertised_ip(config)
            .or_else(|| detect().map(|ip| ip.to_string()))
            .unwrap_or_else(|| Ipv4Addr::UNSPECIFIED.to_string());
        let port = backend_port(config);
        let base_url = advertised_base_url(config, &ip, port);
        debug!("advertising ip={ip} port={port} base_url={base_url}");
        Self { ip, port, base_url }
    }
}

/// The configured IP, before auto-detection.
fn advertised_ip(config: &AppConfig) -> Option<String> {
    let explicit = config.discovery.advertised_ip.trim();
    if !explicit.is_empty() {
        return Some(explicit.to_string());
    }
    [&config.network.public_base_url, &config.network.device_address]
        .into_iter()
        .filter_map(|value| parse_host_port(value).0)
        .find(|host| is_ip_literal(host))
}

/// Backend HTTP port.
pub fn backend_port(config: &AppConfig) -> u16 {
    parse_host_port(&config.network.public_base_url)
        .1
        .or_else(|| parse_host_port(&config.network.device_address).1)
        .unwrap_or(config.network.app_port)
}

/// Normalised base URL peers should call.
pub fn advertised_base_url(config: &AppConfig, ip: &str, port: u16) -> String {
    let public = config.network.public_base_url.trim();
    if !public.is_empty() {
        return normalize_base_url(public);
    }
    match hostname_base(config) {
        Some(host) => normalize_base_url(&format!("http://{host}:{port}")),
        None => normalize_base_url(&format!("http://{ip}:{port}")),
    }
}

/// Host to put in the base URL instead of the IP, if configured.
fn hostname_base(config: &AppConfig) -> Option<String> {
    let explicit = config.discovery.hostname.trim();
    if !explicit.is_empty() {
        return Some(explicit.to_string());
    }
    if !config.discovery.use_hostname {
        return None;
    }
    let hostname = config.identity.hostname.trim();
    if hostname.is_empty() {
        return None;
    }
    let suffix = config.discovery.hostname_suffix.trim();
    if !suffix.is_empty() && !hostname.contains('.') {
        Some(format!("{hostname}{suffix}"))
    } else {
        Some(hostname.to_string())
    }
}

/// The hostname the OS reports for this machine.
pub fn machine_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.trim().is_empty())
}

/// Name to resolve when route detection fails.
fn lookup_hostname(config: &AppConfig, os_hostname: Option<String>) -> String {
    os_hostname.unwrap_or_else(|| config.identity.hostname.clone())
}

/// Best-effort detection of this machine's LAN address.
pub fn detect_local_ip(hostname: &str) -> Option<IpAddr> {
    route_local_ip().or_else(|| resolve_hostname_ip(hostname))
}

fn route_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).ok()?;
    socket.connect(ROUTE_PROBE_ADDR).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

fn resolve_hostname_ip(hostname: &str) -> Option<IpAddr> {
    (hostname, 0)
        .to_socket_addrs()
        .ok()?
        .map(|addr| addr.ip())
        .find(|ip| ip.is_ipv4() && !ip.is_loopback())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
