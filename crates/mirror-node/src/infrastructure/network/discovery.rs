//! UDP broadcast-based peer discovery.
//!
//! Every mirror binds one UDP socket on the announce port (default 5005) and
//! runs a single background thread that:
//!
//! 1. Broadcasts an `announce` describing itself every `interval` (default
//!    10s), starting immediately.
//! 2. Answers each `discover` probe with exactly one unicast `announce` sent
//!    back to the probe's source address.
//! 3. Turns every `announce` from another mirror into a
//!    [`PeerSighting`] and upserts it into the [`PeerRegistry`].
//!
//! Datagrams that are not JSON objects with a known `type` are dropped and
//! logged at debug level.  Announces that identify as this mirror (same
//! mirror id or same hostname) are ignored, so a node never registers its
//! own broadcast echo.
//!
//! # How UDP discovery works (for beginners)
//!
//! UDP is connectionless and unreliable, which suits discovery: a lost
//! announce is simply repeated on the next tick.  Sending to the broadcast
//! address `255.255.255.255` delivers the datagram to every host on the LAN
//! segment listening on that port.  `SO_REUSEADDR` (and `SO_REUSEPORT` where
//! available) let several processes on one machine share the port.
//!
//! # Read timeout
//!
//! The socket has a 1-second read timeout.  `recv_from` blocks for at most
//! that long, then the loop re-checks the `running` flag and the announce
//! timer.  Stopping therefore takes at most about one second.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use mirror_core::protocol::{
    decode_datagram, encode_datagram, Announcement, DiscoveryMessage, MAX_DATAGRAM_SIZE,
};
use mirror_core::{Metadata, MirrorId};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::peer_registry::{PeerRegistry, PeerSighting};
use crate::infrastructure::network::advertise::Advertisement;
use crate::infrastructure::storage::config::{ConfigError, DiscoveryConfig};

/// Receive timeout; bounds how long `stop` waits for the thread.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Error type for discovery service operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be created, configured, or bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// The worker thread could not be spawned.
    #[error("failed to spawn discovery thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Socket addresses and timing for the discovery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Local address to bind.
    pub bind_addr: SocketAddr,
    /// Where periodic announces are sent.
    pub announce_target: SocketAddr,
    pub interval: Duration,
}

impl DiscoveryOptions {
    /// Binds all interfaces on `announce_port` and announces to
    /// `broadcast_address:announce_port`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a non-IP broadcast address.
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.announce_port)),
            announce_target: SocketAddr::new(config.broadcast_ip()?, config.announce_port),
            interval: config.interval(),
        })
    }
}

/// What happened to one inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// A probe was answered with a unicast announce.
    Replied,
    /// A peer row was inserted or refreshed under this hostname.
    PeerUpdated(String),
    /// The announce came from this mirror.
    IgnoredSelf,
    /// The announce carried neither a mirror id nor a hostname.
    IgnoredAnonymous,
    /// The datagram did not decode.
    Dropped,
}

/// The discovery service, configured but not yet running.
pub struct DiscoveryService {
    options: DiscoveryOptions,
    mirror_id: MirrorId,
    hostname: String,
    advertisement: Advertisement,
    metadata: Metadata,
    registry: Arc<PeerRegistry>,
}

impl DiscoveryService {
    pub fn new(
        options: DiscoveryOptions,
        mirror_id: MirrorId,
        hostname: impl Into<String>,
        advertisement: Advertisement,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            options,
            mirror_id,
            hostname: hostname.into(),
            advertisement,
            metadata: Metadata::new(),
            registry,
        }
    }

    /// Extra metadata to include in every announce (e.g. a public key).
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Binds the socket and spawns the worker thread.
    ///
    /// The thread runs while `running` is `true`.  Use the returned handle
    /// to stop it and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::BindFailed`] if the socket cannot be set up,
    /// or [`DiscoveryError::Spawn`] if the thread cannot be started.
    pub fn start(self, running: Arc<AtomicBool>) -> Result<DiscoveryHandle, DiscoveryError> {
        let socket = bind_socket(self.options.bind_addr)?;
        let bind_failed = |source| DiscoveryError::BindFailed {
            addr: self.options.bind_addr,
            source,
        };
        socket.set_read_timeout(Some(RECV_TIMEOUT)).map_err(bind_failed)?;
        let local_addr = socket.local_addr().map_err(bind_failed)?;

        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("mirror-discovery".to_string())
            .spawn(move || self.run(socket, flag))
            .map_err(DiscoveryError::Spawn)?;

        info!("discovery listening on UDP {local_addr}");
        Ok(DiscoveryHandle {
            local_addr,
            running,
            thread: Some(thread),
        })
    }

    /// The announce this mirror currently sends.
    pub fn announcement(&self) -> DiscoveryMessage {
        DiscoveryMessage::Announce(Announcement {
            mirror_id: Some(self.mirror_id.to_string()),
            hostname: Some(self.hostname.clone()),
            ip: Some(self.advertisement.ip.clone()),
            port: Some(self.advertisement.port),
            base_url: Some(self.advertisement.base_url.clone()),
            timestamp: Some(Utc::now().timestamp()),
            metadata: self.metadata.clone(),
        })
    }

    /// The main loop executed on the discovery thread.
    fn run(self, socket: UdpSocket, running: Arc<AtomicBool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut last_announce: Option<Instant> = None;

        while running.load(Ordering::Relaxed) {
            if last_announce.map_or(true, |t| t.elapsed() >= self.options.interval) {
                self.send_announce(&socket, self.options.announce_target);
                last_announce = Some(Instant::now());
            }

            let (len, src) = match socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if is_timeout_error(&e) => continue,
                Err(e) => {
                    warn!("discovery recv error: {e}");
                    continue;
                }
            };

            self.handle_datagram(&socket, &buf[..len], src);
        }

        info!("discovery stopped");
    }

    /// Processes one inbound datagram.
    pub fn handle_datagram(
        &self,
        socket: &UdpSocket,
        bytes: &[u8],
        src: SocketAddr,
    ) -> InboundOutcome {
        match decode_datagram(bytes) {
            Ok(DiscoveryMessage::Discover(_)) => {
                debug!("discover probe from {src}");
                self.send_announce(socket, src);
                InboundOutcome::Replied
            }
            Ok(DiscoveryMessage::Announce(announce)) => self.record_peer(&announce, src.ip()),
            Err(e) => {
                debug!("dropping datagram from {src}: {e}");
                InboundOutcome::Dropped
            }
        }
    }

    fn record_peer(&self, announce: &Announcement, source_ip: IpAddr) -> InboundOutcome {
        let Some(hostname) = announce.registry_hostname() else {
            return InboundOutcome::IgnoredAnonymous;
        };
        if announce.mirror_id() == Some(self.mirror_id.as_str()) || hostname == self.hostname {
            return InboundOutcome::IgnoredSelf;
        }

        let ip = announce
            .ip
            .as_deref()
            .and_then(|raw| raw.trim().parse::<IpAddr>().ok())
            .unwrap_or(source_ip);
        let sighting = PeerSighting {
            hostname: hostname.to_string(),
            mirror_id: announce.mirror_id().map(str::to_string),
            ip: Some(ip),
            port: announce.port.unwrap_or(self.advertisement.port),
            base_url: announce.base_url.clone().filter(|u| !u.trim().is_empty()),
            metadata: announce.metadata.clone(),
        };
        let mirror = self.registry.upsert(sighting, Utc::now());
        debug!("peer {} ({}) at {ip}:{}", mirror.hostname, mirror.mirror_id, mirror.port);
        InboundOutcome::PeerUpdated(mirror.hostname)
    }

    fn send_announce(&self, socket: &UdpSocket, dest: SocketAddr) {
        match encode_datagram(&self.announcement()) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, dest) {
                    debug!("failed to send announce to {dest}: {e}");
                }
            }
            Err(e) => warn!("failed to encode announce: {e}"),
        }
    }
}

/// Handle to a running discovery thread.  Dropping it stops the thread.
pub struct DiscoveryHandle {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DiscoveryHandle {
    /// The bound socket address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Clears the running flag and waits for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("discovery thread panicked");
            }
        }
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Creates the UDP socket with broadcast and address reuse enabled.
fn bind_socket(addr: SocketAddr) -> Result<UdpSocket, DiscoveryError> {
    let bind_failed = move |source| DiscoveryError::BindFailed { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_failed)?;
    socket.set_reuse_address(true).map_err(bind_failed)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).map_err(bind_failed)?;
    socket.set_broadcast(true).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    Ok(socket.into())
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
