//! Host role of the latch sync protocol.
//!
//! The binary in `main.rs` wires [`HostSession`] to a TCP transport and the
//! shared [`ego_core::world::World`]; tests drive it over the loopback hub.

pub mod host;

pub use host::{HostEvent, HostSession, RemoteStatus};
