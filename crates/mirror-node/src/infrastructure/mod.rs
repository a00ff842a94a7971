//! Infrastructure layer for a mirror node.
//!
//! Contains OS-facing adapters: the UDP discovery socket, advertised-address
//! resolution, the TOML configuration file, and the in-memory record store.
//! `node` wires them to the application services.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `mirror_core`, but MUST NOT be imported by the `application` layer
//! outside of tests.

pub mod network;
pub mod node;
pub mod storage;
