//! Host side of the latch sync protocol.
//!
//! The host owns the authoritative latch table: its own players' input plus
//! whatever each remote reported for the characters it owns. Every frame the
//! whole table is stamped with the next frame number, written into the host's
//! own latch buffer and broadcast to every remote.

use std::{
    collections::BTreeMap,
    path::Path,
    thread,
    time::Duration,
};

use ego_core::{
    latch::Latch,
    latch_buffer::LatchBuffer,
    net::{
        send_message, FileSender, LatchPacket, Message, PeerId, Target, Transport,
        TransportEvent, HOST_PEER,
    },
    player::{InputDevices, PlayerRegistry},
    pool::Handle,
};

/// Where a remote stands in the module handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Connected,
    ModuleOffered,
    ModuleAccepted,
    ModuleRejected,
    Loaded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Joined(PeerId),
    /// A remote left; its characters were unbound.
    Left(PeerId, Vec<Handle>),
    ModuleAnswer { peer: PeerId, accepted: bool },
    Loaded(PeerId),
    Text { from: PeerId, text: String },
    FilesDelivered(PeerId),
}

pub struct HostSession<T: Transport> {
    transport: T,
    buffer: LatchBuffer,
    players: PlayerRegistry,
    authoritative: Vec<Option<Latch>>,
    remotes: BTreeMap<PeerId, RemoteStatus>,
    uploads: BTreeMap<PeerId, FileSender>,
    started: bool,
}

impl<T: Transport> HostSession<T> {
    /// `slots` is the size of the character pool the latches address.
    pub fn new(transport: T, slots: usize) -> Self {
        HostSession {
            transport,
            buffer: LatchBuffer::new(slots),
            players: PlayerRegistry::new(HOST_PEER),
            authoritative: vec![None; slots],
            remotes: BTreeMap::new(),
            uploads: BTreeMap::new(),
            started: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn buffer(&self) -> &LatchBuffer {
        &self.buffer
    }

    pub fn players(&self) -> &PlayerRegistry {
        &self.players
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn remote_status(&self, peer: PeerId) -> Option<RemoteStatus> {
        self.remotes.get(&peer).copied()
    }

    pub fn remotes(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.remotes.keys().copied()
    }

    pub fn add_local_player(&mut self, character: Handle, devices: InputDevices) -> bool {
        self.players.add_local(character, devices).is_some()
    }

    /// Lets `peer` drive `character`. Only its latches for owned characters are kept.
    pub fn assign_character(&mut self, peer: PeerId, character: Handle) -> bool {
        self.players
            .add(character, peer, InputDevices::empty())
            .is_some()
    }

    /// Records this machine's input for one of its own characters.
    pub fn capture_local(&mut self, character: Handle, latch: Latch) -> bool {
        if !self.players.is_owned_by(character, HOST_PEER) {
            log::warn!("{} is not a local player, input dropped", character);
            return false;
        }
        self.set_latch(character, latch)
    }

    fn set_latch(&mut self, character: Handle, latch: Latch) -> bool {
        match self.authoritative.get_mut(character.index()) {
            Some(slot) => {
                *slot = Some(latch);
                true
            }
            None => {
                log::warn!("latch for out of range {}", character);
                false
            }
        }
    }

    /// The latch every participant will apply to `character` next.
    pub fn latch(&self, character: Handle) -> Option<Latch> {
        self.authoritative.get(character.index()).copied().flatten()
    }

    /// Stamps the authoritative table with the next frame, stores it locally
    /// and broadcasts it unreliably. Returns the stamp.
    pub fn talk_to_remotes(&mut self) -> anyhow::Result<u32> {
        let stamp = self.buffer.current_frame().wrapping_add(1);
        let mut packet = LatchPacket::new(stamp);
        for (index, latch) in self.authoritative.iter().enumerate() {
            if let Some(latch) = latch {
                packet.push(Handle::new(index), latch.quantized());
            }
        }

        for (handle, latch) in &packet.entries {
            self.buffer.capture_local(*handle, stamp, *latch);
        }
        log::trace!("frame {}: broadcasting {} latches", stamp, packet.entries.len());
        send_message(
            &mut self.transport,
            &Message::RemoteLatch(packet),
            Target::Broadcast,
        )?;
        Ok(stamp)
    }

    /// Advances to the next frame and takes its latches.
    pub fn consume_frame(&mut self) -> Vec<(Handle, Latch)> {
        let frame = self.buffer.advance_frame();
        self.buffer.consume(frame)
    }

    /// Forgets the history of a character that respawned.
    pub fn reset_slot(&mut self, character: Handle) {
        self.buffer.reset_slot(character);
        if let Some(slot) = self.authoritative.get_mut(character.index()) {
            *slot = None;
        }
    }

    /// Sends each remote the module, its seed and the characters it drives.
    pub fn offer_module(&mut self, seed: u32, module: &str) -> anyhow::Result<()> {
        let peers: Vec<PeerId> = self.remotes.keys().copied().collect();
        for peer in peers {
            let characters: Vec<Handle> = self
                .players
                .iter()
                .filter(|player| player.owner == peer)
                .map(|player| player.character)
                .collect();
            log::info!("offering {} to {} with characters {:?}", module, peer, characters);
            send_message(
                &mut self.transport,
                &Message::RemoteModule {
                    seed,
                    module: module.to_string(),
                    characters,
                },
                Target::Peer(peer),
            )?;
            self.remotes.insert(peer, RemoteStatus::ModuleOffered);
        }
        Ok(())
    }

    /// Queues a directory tree for every connected remote.
    pub fn send_directory(&mut self, root: &Path, prefix: &str) -> anyhow::Result<()> {
        let peers: Vec<PeerId> = self.remotes.keys().copied().collect();
        for peer in peers {
            self.uploads
                .insert(peer, FileSender::from_directory(root, prefix)?);
        }
        Ok(())
    }

    pub fn uploads_acknowledged(&self) -> bool {
        self.uploads.values().all(FileSender::is_acknowledged)
    }

    /// Every remote that accepted the module has loaded it.
    pub fn all_loaded(&self) -> bool {
        self.remotes
            .values()
            .all(|status| matches!(status, RemoteStatus::Loaded | RemoteStatus::ModuleRejected))
    }

    pub fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        send_message(
            &mut self.transport,
            &Message::Text(text.to_string()),
            Target::Broadcast,
        )
    }

    /// Tells everyone to start at the current frame and clears the latch history.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let frame = self.buffer.current_frame();
        self.buffer.reset_all();
        send_message(
            &mut self.transport,
            &Message::RemoteStart { frame },
            Target::Broadcast,
        )?;
        self.started = true;
        log::info!("module started at frame {}", frame);
        Ok(())
    }

    /// Handles everything the transport has, pumping pending uploads first.
    pub fn poll(&mut self) -> anyhow::Result<Vec<HostEvent>> {
        for (peer, sender) in self.uploads.iter_mut() {
            sender.pump(&mut self.transport, Target::Peer(*peer), 16)?;
        }

        let mut events = Vec::new();
        for event in self.transport.poll_events()? {
            match event {
                TransportEvent::Connected(peer) => {
                    if self.started {
                        log::warn!("{} joined after the module started", peer);
                    }
                    log::info!("{} joined", peer);
                    self.remotes.insert(peer, RemoteStatus::Connected);
                    events.push(HostEvent::Joined(peer));
                }
                TransportEvent::Disconnected(peer) => {
                    self.remotes.remove(&peer);
                    self.uploads.remove(&peer);
                    let characters = self.players.remove_peer(peer);
                    for character in &characters {
                        if let Some(slot) = self.authoritative.get_mut(character.index()) {
                            *slot = None;
                        }
                    }
                    log::info!("{} left, unbound {:?}", peer, characters);
                    events.push(HostEvent::Left(peer, characters));
                }
                TransportEvent::Received { peer, payload, .. } => {
                    let message = match Message::decode(&payload) {
                        Ok(message) => message,
                        Err(e) => {
                            log::debug!("dropping packet from {}: {}", peer, e);
                            continue;
                        }
                    };
                    match self.handle_message(peer, message) {
                        Ok(Some(event)) => events.push(event),
                        Ok(None) => {}
                        Err(e) => log::warn!("failed to handle message from {}: {:#}", peer, e),
                    }
                }
            }
        }
        Ok(events)
    }

    /// Dispatches one decoded message from `peer`.
    pub fn handle_message(
        &mut self,
        peer: PeerId,
        message: Message,
    ) -> anyhow::Result<Option<HostEvent>> {
        let event = match message {
            Message::HostLatch(packet) => {
                log::trace!("{} sent {} latches for {}", peer, packet.entries.len(), packet.stamp);
                for (character, latch) in packet.entries {
                    if self.players.is_owned_by(character, peer) {
                        self.set_latch(character, latch);
                    } else {
                        log::warn!("{} sent a latch for {} which it does not own", peer, character);
                    }
                }
                None
            }
            Message::ModuleOk => {
                self.remotes.insert(peer, RemoteStatus::ModuleAccepted);
                Some(HostEvent::ModuleAnswer {
                    peer,
                    accepted: true,
                })
            }
            Message::ModuleBad => {
                log::warn!("{} does not have the module", peer);
                self.remotes.insert(peer, RemoteStatus::ModuleRejected);
                Some(HostEvent::ModuleAnswer {
                    peer,
                    accepted: false,
                })
            }
            Message::ImLoaded => {
                log::info!("{} is loaded", peer);
                self.remotes.insert(peer, RemoteStatus::Loaded);
                Some(HostEvent::Loaded(peer))
            }
            Message::Text(text) => {
                send_message(
                    &mut self.transport,
                    &Message::Text(text.clone()),
                    Target::BroadcastExcept(peer),
                )?;
                Some(HostEvent::Text { from: peer, text })
            }
            Message::TransferOk(path) => {
                let Some(sender) = self.uploads.get_mut(&peer) else {
                    log::debug!("{} acknowledged {} but nothing was sent", peer, path);
                    return Ok(None);
                };
                if !sender.acknowledge(&path) {
                    log::debug!("{} acknowledged unknown file {}", peer, path);
                }
                sender
                    .is_acknowledged()
                    .then_some(HostEvent::FilesDelivered(peer))
            }
            other => {
                log::debug!("{} sent unexpected {:?}", peer, other.kind());
                None
            }
        };
        Ok(event)
    }

    /// Polls until every remote has loaded, then starts the module.
    ///
    /// `cancel` is checked once per iteration. Returns `false` if it fired.
    pub fn wait_for_all_loaded<F>(&mut self, mut cancel: F) -> anyhow::Result<bool>
    where
        F: FnMut() -> bool,
    {
        log::info!("waiting for {} remotes to load", self.remotes.len());
        loop {
            self.poll()?;
            if self.all_loaded() {
                self.start()?;
                return Ok(true);
            }
            if cancel() {
                log::info!("stopped waiting for remotes");
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}
