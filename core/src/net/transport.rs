//! Transport seam between the sessions and whatever moves bytes

use std::fmt;

/// Connection id. The host is always [`HOST_PEER`]; remotes count up from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

pub const HOST_PEER: PeerId = PeerId(0);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// May be dropped or reordered.
    Unreliable = 0,
    /// Delivered in order.
    Guaranteed = 1,
}

impl Channel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Channel::Unreliable),
            1 => Some(Channel::Guaranteed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Peer(PeerId),
    Broadcast,
    BroadcastExcept(PeerId),
}

impl Target {
    pub fn includes(&self, peer: PeerId) -> bool {
        match *self {
            Target::Peer(id) => id == peer,
            Target::Broadcast => true,
            Target::BroadcastExcept(id) => id != peer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(PeerId),
    Received {
        peer: PeerId,
        channel: Channel,
        payload: Vec<u8>,
    },
    Disconnected(PeerId),
}

pub trait Transport {
    /// Drains everything that arrived since the last call. Never blocks.
    fn poll_events(&mut self) -> anyhow::Result<Vec<TransportEvent>>;

    fn send(&mut self, channel: Channel, payload: &[u8], target: Target) -> anyhow::Result<()>;

    /// Peers currently connected to this endpoint.
    fn peers(&self) -> Vec<PeerId>;
}
