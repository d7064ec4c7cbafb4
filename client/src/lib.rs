//! Remote role of the latch sync protocol.

pub mod remote;

pub use remote::{RemoteEvent, RemotePhase, RemoteSession};
