//! # mirror-core
//!
//! Shared library for the mirror handoff system containing the domain
//! entities, the discovery wire protocol, and the two signed-token protocols.
//!
//! This crate is used by every mirror node.  It has zero dependencies on
//! sockets, storage engines, or HTTP frameworks.
//!
//! # Architecture overview
//!
//! A fleet of "mirror" devices sits on one local network.  A user starts a
//! session on one mirror by scanning a QR code with their phone, records some
//! media, and can later hand that session off to another mirror.
//!
//! This crate defines:
//!
//! - **`domain`** – The records the system manipulates (`Mirror`, `Session`,
//!   `TransferRequest`, `VideoRecord`) and the pure session state machine.
//!   Transitions return a new `Session` value; persisting it is the caller's
//!   job.
//!
//! - **`protocol`** – The JSON datagrams exchanged over UDP for peer
//!   discovery, plus helpers for normalising advertised base URLs.
//!
//! - **`token`** – The asymmetrically-signed *transfer token* (mirror to
//!   mirror) and the symmetrically-signed *export token* (mirror to device).

pub mod domain;
pub mod protocol;
pub mod token;

// Re-export the most-used types at the crate root so callers can write
// `mirror_core::Session` instead of `mirror_core::domain::session::Session`.
pub use domain::mirror::{Metadata, Mirror, MirrorId};
pub use domain::session::{
    QrToken, Session, SessionEvent, SessionId, SessionStatus, TransitionError,
};
pub use domain::transfer::{TransferRequest, VideoDescriptor, VideoRecord};
pub use protocol::discovery::{Announcement, DiscoveryCodecError, DiscoveryMessage};
pub use token::TokenError;
