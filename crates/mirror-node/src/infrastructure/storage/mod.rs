//! Storage infrastructure.
//!
//! - **`config`** – Reads and writes the TOML configuration file, with
//!   defaults for every field so a first run works without one.
//!
//! - **`memory`** – `InMemoryStore`, a lock-protected implementation of every
//!   repository trait.  Used by the binary and by tests; a durable backend
//!   would implement the same traits.

pub mod config;
pub mod memory;
