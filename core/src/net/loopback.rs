//! In-process star network: one host endpoint and any number of remotes.
//!
//! Single threaded. Every endpoint shares the hub state, sending pushes
//! straight into the receivers' inboxes.

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
};

use anyhow::bail;

use super::transport::{Channel, PeerId, Target, Transport, TransportEvent, HOST_PEER};

#[derive(Default)]
struct HubState {
    inboxes: BTreeMap<PeerId, VecDeque<TransportEvent>>,
    next_remote: u32,
    drop_unreliable: bool,
}

impl HubState {
    fn deliver(&mut self, to: PeerId, event: TransportEvent) {
        if let Some(inbox) = self.inboxes.get_mut(&to) {
            inbox.push_back(event);
        }
    }
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Rc<RefCell<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The host endpoint. Calling it twice hands out two views of the same peer.
    pub fn host(&self) -> LoopbackEndpoint {
        self.state
            .borrow_mut()
            .inboxes
            .entry(HOST_PEER)
            .or_default();
        LoopbackEndpoint {
            id: HOST_PEER,
            state: Rc::clone(&self.state),
        }
    }

    /// Joins a new remote. The host sees a `Connected` event.
    pub fn connect_remote(&self) -> LoopbackEndpoint {
        let mut state = self.state.borrow_mut();
        state.next_remote += 1;
        let id = PeerId(state.next_remote);
        state.inboxes.insert(id, VecDeque::new());
        state.deliver(HOST_PEER, TransportEvent::Connected(id));
        if state.inboxes.contains_key(&HOST_PEER) {
            state.deliver(id, TransportEvent::Connected(HOST_PEER));
        }
        log::debug!("loopback: {} connected", id);
        LoopbackEndpoint {
            id,
            state: Rc::clone(&self.state),
        }
    }

    pub fn disconnect(&self, peer: PeerId) {
        let mut state = self.state.borrow_mut();
        if state.inboxes.remove(&peer).is_none() {
            return;
        }
        let others: Vec<PeerId> = state.inboxes.keys().copied().collect();
        for other in others {
            if peer == HOST_PEER || other == HOST_PEER {
                state.deliver(other, TransportEvent::Disconnected(peer));
            }
        }
        log::debug!("loopback: {} disconnected", peer);
    }

    /// Simulates a lossy link: every unreliable send is silently lost.
    pub fn set_drop_unreliable(&self, drop: bool) {
        self.state.borrow_mut().drop_unreliable = drop;
    }
}

pub struct LoopbackEndpoint {
    id: PeerId,
    state: Rc<RefCell<HubState>>,
}

impl LoopbackEndpoint {
    pub fn id(&self) -> PeerId {
        self.id
    }
}

impl Transport for LoopbackEndpoint {
    fn poll_events(&mut self) -> anyhow::Result<Vec<TransportEvent>> {
        let mut state = self.state.borrow_mut();
        match state.inboxes.get_mut(&self.id) {
            Some(inbox) => Ok(inbox.drain(..).collect()),
            None => Ok(Vec::new()),
        }
    }

    fn send(&mut self, channel: Channel, payload: &[u8], target: Target) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.inboxes.contains_key(&self.id) {
            bail!("{} is not connected", self.id);
        }
        if channel == Channel::Unreliable && state.drop_unreliable {
            return Ok(());
        }

        let receivers: Vec<PeerId> = state
            .inboxes
            .keys()
            .copied()
            .filter(|&peer| peer != self.id)
            .filter(|&peer| self.id == HOST_PEER || peer == HOST_PEER)
            .filter(|&peer| target.includes(peer))
            .collect();

        for peer in receivers {
            state.deliver(
                peer,
                TransportEvent::Received {
                    peer: self.id,
                    channel,
                    payload: payload.to_vec(),
                },
            );
        }
        Ok(())
    }

    fn peers(&self) -> Vec<PeerId> {
        let state = self.state.borrow();
        if !state.inboxes.contains_key(&self.id) {
            return Vec::new();
        }
        state
            .inboxes
            .keys()
            .copied()
            .filter(|&peer| peer != self.id)
            .filter(|&peer| self.id == HOST_PEER || peer == HOST_PEER)
            .collect()
    }
}
