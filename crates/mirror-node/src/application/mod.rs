//! Application layer use cases for a mirror node.
//!
//! Everything here works against the repository traits in [`repository`]
//! and the pure types from `mirror_core`.  There are no sockets and no file
//! access in this layer; the infrastructure layer supplies both.
//!
//! # Sub-modules
//!
//! - **`repository`** – Persistence traits (`MirrorRepository`,
//!   `SessionRepository`, `VideoRepository`, `TransferRepository`) and their
//!   shared error type.
//!
//! - **`peer_registry`** – Hostname-keyed registry of every mirror seen on the
//!   LAN.  Written by discovery, read by the transfer orchestrator.
//!
//! - **`sessions`** – QR session lifecycle: create, activate or resume, end,
//!   and status queries.  Enforces "at most one live session per mirror".
//!
//! - **`transfer`** – Hands a session to another mirror (source side) and
//!   materialises a received session (destination side).
//!
//! - **`export`** – Issues and redeems device-bound export tokens.

pub mod export;
pub mod peer_registry;
pub mod repository;
pub mod sessions;
pub mod transfer;
