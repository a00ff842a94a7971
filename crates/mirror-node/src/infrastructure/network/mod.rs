//! Network infrastructure.
//!
//! # Sub-modules
//!
//! - **`discovery`** – The UDP service that broadcasts this mirror's
//!   `announce`, answers `discover` probes, and feeds peer sightings into the
//!   registry.  Runs on one dedicated thread.
//!
//! - **`advertise`** – Works out the IP, port, and base URL this mirror
//!   advertises, from configuration and the host's network interfaces.

pub mod advertise;
pub mod discovery;
