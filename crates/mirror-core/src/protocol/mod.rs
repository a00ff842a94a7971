//! Discovery wire protocol.
//!
//! # Sub-modules
//!
//! - **`discovery`** – The JSON datagrams (`announce` / `discover`) mirrors
//!   exchange over UDP, and their encode/decode functions.
//!
//! - **`address`** – Helpers for turning configured addresses into the
//!   advertised base URL, host, and port.

pub mod address;
pub mod discovery;

pub use address::{is_ip_literal, normalize_base_url, parse_host_port};
pub use discovery::{
    decode_datagram, encode_datagram, Announcement, DiscoveryCodecError, DiscoveryMessage, Probe,
    DEFAULT_ANNOUNCE_PORT, MAX_DATAGRAM_SIZE,
};
