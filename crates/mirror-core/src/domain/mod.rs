//! Domain entities for the mirror handoff system.
//!
//! This module contains pure business logic with no infrastructure
//! dependencies.  Nothing in here opens a socket, touches the file system, or
//! reads the clock on its own: every operation that needs "now" takes it as a
//! parameter so tests can pin time.

/// Peer mirror descriptor.
pub mod mirror;

/// Session lifecycle and the QR activation token.
///
/// See [`session::Session::apply`] for the state machine.
pub mod session;

/// Transfer bookkeeping and media metadata records.
pub mod transfer;
