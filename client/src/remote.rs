//! Remote side of the latch sync protocol.
//!
//! A remote stages its own players' input one frame ahead, reports it to the
//! host once the start-up grace period is over, and simulates whatever the
//! host broadcasts.

use std::{path::PathBuf, thread, time::Duration};

use ego_core::{
    constants::STARTTALK,
    latch::Latch,
    latch_buffer::{LatchBuffer, StampReceipt},
    net::{
        file_transfer::is_transfer_message, send_message, FileReceiver, LatchPacket, Message,
        PeerId, Target, Transport, TransportEvent, HOST_PEER,
    },
    player::{InputDevices, PlayerRegistry},
    pool::Handle,
};

/// Owner id of the players driven on this machine. The host never sees it.
const SELF_PEER: PeerId = PeerId(u32::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePhase {
    Connecting,
    /// The host offered a module; waiting for us to finish loading it.
    Loading,
    /// Loaded and reported, waiting for `TO_REMOTE_START`.
    Waiting,
    Started,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Connected,
    Disconnected,
    ModuleOffered {
        seed: u32,
        module: String,
        accepted: bool,
    },
    Started { frame: u32 },
    Latches(StampReceipt),
    Text(String),
    FilesReceived(u32),
}

pub struct RemoteSession<T: Transport> {
    transport: T,
    /// Latches broadcast by the host. The only input the simulation consumes.
    buffer: LatchBuffer,
    /// Local input waiting to be reported to the host.
    staged: LatchBuffer,
    players: PlayerRegistry,
    phase: RemotePhase,
    start_talk: u32,
    frames_since_start: u32,
    seed: Option<u32>,
    module_check: Box<dyn Fn(&str) -> bool>,
    receiver: Option<FileReceiver>,
}

impl<T: Transport> RemoteSession<T> {
    pub fn new(transport: T, slots: usize) -> Self {
        RemoteSession {
            transport,
            buffer: LatchBuffer::new(slots),
            staged: LatchBuffer::new(slots),
            players: PlayerRegistry::new(SELF_PEER),
            phase: RemotePhase::Connecting,
            start_talk: STARTTALK,
            frames_since_start: 0,
            seed: None,
            module_check: Box::new(|_| true),
            receiver: None,
        }
    }

    /// Frames to stay quiet after the start. Defaults to [`STARTTALK`].
    pub fn with_start_talk(mut self, frames: u32) -> Self {
        self.start_talk = frames;
        self
    }

    /// Decides whether an offered module is available here.
    pub fn with_module_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&str) -> bool + 'static,
    {
        self.module_check = Box::new(check);
        self
    }

    /// Accepts replicated files below `root`.
    pub fn with_download_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.receiver = Some(FileReceiver::new(root));
        self
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

    pub fn phase(&self) -> RemotePhase {
        self.phase
    }

    /// Random seed handed over with the module.
    pub fn seed(&self) -> Option<u32> {
        self.seed
    }

    pub fn downloads(&self) -> Option<&FileReceiver> {
        self.receiver.as_ref()
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.buffer.is_out_of_sync()
    }

    pub fn add_local_player(&mut self, character: Handle, devices: InputDevices) -> bool {
        self.players.add_local(character, devices).is_some()
    }

    /// Stages input for one of our characters, for the frame after the current one.
    ///
    /// Staged input only travels to the host. The frame itself is simulated
    /// with whatever the host broadcasts back.
    pub fn capture_local(&mut self, character: Handle, latch: Latch) -> bool {
        if !self.players.is_owned_by(character, SELF_PEER) {
            log::warn!("{} is not a local player, input dropped", character);
            return false;
        }
        let stamp = self.buffer.current_frame().wrapping_add(1);
        self.staged.capture_local(character, stamp, latch)
    }

    /// Sends the staged input of every local player to the host.
    ///
    /// Stays quiet until `start_talk` frames have passed since the start and
    /// when there are no local players. Returns whether a packet went out.
    pub fn talk_to_host(&mut self) -> anyhow::Result<bool> {
        if self.phase != RemotePhase::Started || !self.players.has_local_players() {
            return Ok(false);
        }
        if self.frames_since_start < self.start_talk {
            return Ok(false);
        }

        let stamp = self.buffer.current_frame().wrapping_add(1);
        let mut packet = LatchPacket::new(stamp);
        for player in self.players.local_players() {
            if let Some(sample) = self.staged.sample(player.character, stamp) {
                packet.push(player.character, sample.latch);
            }
        }
        if packet.entries.is_empty() {
            return Ok(false);
        }
        send_message(
            &mut self.transport,
            &Message::HostLatch(packet),
            Target::Peer(HOST_PEER),
        )?;
        Ok(true)
    }

    /// Advances to the next frame and takes the latches the host sent for it.
    pub fn consume_frame(&mut self) -> Vec<(Handle, Latch)> {
        let frame = self.buffer.advance_frame();
        self.frames_since_start = self.frames_since_start.saturating_add(1);
        self.buffer.consume(frame)
    }

    pub fn reset_slot(&mut self, character: Handle) {
        self.buffer.reset_slot(character);
        self.staged.reset_slot(character);
    }

    /// Reports the offered module as loaded.
    pub fn module_loaded(&mut self) -> anyhow::Result<()> {
        if self.phase != RemotePhase::Loading {
            log::warn!("module_loaded called while {:?}", self.phase);
        }
        send_message(&mut self.transport, &Message::ImLoaded, Target::Peer(HOST_PEER))?;
        self.phase = RemotePhase::Waiting;
        Ok(())
    }

    pub fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        send_message(
            &mut self.transport,
            &Message::Text(text.to_string()),
            Target::Peer(HOST_PEER),
        )
    }

    pub fn poll(&mut self) -> anyhow::Result<Vec<RemoteEvent>> {
        let mut events = Vec::new();
        for event in self.transport.poll_events()? {
            match event {
                TransportEvent::Connected(_) => events.push(RemoteEvent::Connected),
                TransportEvent::Disconnected(_) => {
                    log::warn!("lost the host");
                    self.phase = RemotePhase::Disconnected;
                    events.push(RemoteEvent::Disconnected);
                }
                TransportEvent::Received { payload, .. } => {
                    let message = match Message::decode(&payload) {
                        Ok(message) => message,
                        Err(e) => {
                            log::debug!("dropping packet from host: {}", e);
                            continue;
                        }
                    };
                    match self.handle_message(message) {
                        Ok(Some(event)) => events.push(event),
                        Ok(None) => {}
                        Err(e) => log::warn!("failed to handle message from host: {:#}", e),
                    }
                }
            }
        }
        Ok(events)
    }

    /// Dispatches one decoded message from the host.
    pub fn handle_message(&mut self, message: Message) -> anyhow::Result<Option<RemoteEvent>> {
        if is_transfer_message(message.kind()) {
            return self.handle_transfer(&message);
        }

        let event = match message {
            Message::RemoteLatch(packet) => {
                let receipt = self.buffer.receive(packet.stamp, packet.entries);
                Some(RemoteEvent::Latches(receipt))
            }
            Message::RemoteModule {
                seed,
                module,
                characters,
            } => {
                let accepted = (self.module_check)(&module);
                let answer = if accepted {
                    Message::ModuleOk
                } else {
                    Message::ModuleBad
                };
                send_message(&mut self.transport, &answer, Target::Peer(HOST_PEER))?;

                if accepted {
                    log::info!("loading {} with seed {:#x}", module, seed);
                    self.seed = Some(seed);
                    for character in characters {
                        self.add_local_player(character, InputDevices::KEYBOARD);
                    }
                    self.phase = RemotePhase::Loading;
                } else {
                    log::warn!("host offered {} which is not available", module);
                }
                Some(RemoteEvent::ModuleOffered {
                    seed,
                    module,
                    accepted,
                })
            }
            Message::RemoteStart { frame } => {
                self.buffer.reset_all();
                self.buffer.set_current_frame(frame);
                self.staged.reset_all();
                self.frames_since_start = 0;
                self.phase = RemotePhase::Started;
                log::info!("module started at frame {}", frame);
                Some(RemoteEvent::Started { frame })
            }
            Message::Text(text) => Some(RemoteEvent::Text(text)),
            other => {
                log::debug!("host sent unexpected {:?}", other.kind());
                None
            }
        };
        Ok(event)
    }

    fn handle_transfer(&mut self, message: &Message) -> anyhow::Result<Option<RemoteEvent>> {
        let Some(receiver) = self.receiver.as_mut() else {
            log::warn!("ignoring {:?}, no download directory", message.kind());
            return Ok(None);
        };
        let reply = match receiver.handle(message) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("ignoring {:?} from host: {:#}", message.kind(), e);
                return Ok(None);
            }
        };
        if let Some(reply) = reply {
            send_message(&mut self.transport, &reply, Target::Peer(HOST_PEER))?;
        }
        if matches!(message, Message::DoneSendingFiles) {
            return Ok(Some(RemoteEvent::FilesReceived(receiver.files_received())));
        }
        Ok(None)
    }

    /// Polls until the host starts the module. Returns `false` if `cancel`
    /// fired or the host went away first.
    pub fn wait_for_start<F>(&mut self, mut cancel: F) -> anyhow::Result<bool>
    where
        F: FnMut() -> bool,
    {
        loop {
            self.poll()?;
            match self.phase {
                RemotePhase::Started => return Ok(true),
                RemotePhase::Disconnected => return Ok(false),
                _ => {}
            }
            if cancel() {
                log::info!("stopped waiting for the host");
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use ego_core::{
        latch::{Latch, LatchButtons},
        latch_buffer::StampOrder,
        net::{send_message, LatchPacket, LoopbackHub, Message, Target, Transport, TransportEvent},
        player::InputDevices,
        pool::Handle,
    };

    use super::{RemoteEvent, RemotePhase, RemoteSession};

    fn host_messages<T: Transport>(host: &mut T) -> Vec<Message> {
        host.poll_events()
            .unwrap()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Received { payload, .. } => Message::decode(&payload).ok(),
                _ => None,
            })
            .collect()
    }

    fn started(session: &mut RemoteSession<impl Transport>, frame: u32) {
        session
            .handle_message(Message::RemoteStart { frame })
            .unwrap();
    }

    #[test]
    fn module_offer_is_answered_and_binds_characters() {
        let hub = LoopbackHub::new();
        let mut host = hub.host();
        let mut remote =
            RemoteSession::new(hub.connect_remote(), 8).with_module_check(|m| m == "ok.mod");

        let event = remote
            .handle_message(Message::RemoteModule {
                seed: 3,
                module: "ok.mod".to_string(),
                characters: vec![Handle::new(5)],
            })
            .unwrap();
        assert!(matches!(event, Some(RemoteEvent::ModuleOffered { accepted: true, .. })));
        assert_eq!(remote.phase(), RemotePhase::Loading);
        assert_eq!(remote.seed(), Some(3));
        assert_eq!(remote.players().local_players().count(), 1);

        remote
            .handle_message(Message::RemoteModule {
                seed: 3,
                module: "missing.mod".to_string(),
                characters: vec![],
            })
            .unwrap();
        assert_eq!(
            host_messages(&mut host),
            vec![Message::ModuleOk, Message::ModuleBad]
        );
    }

    #[test]
    fn stays_quiet_during_start_talk() {
        let hub = LoopbackHub::new();
        let mut host = hub.host();
        let mut remote = RemoteSession::new(hub.connect_remote(), 8).with_start_talk(2);
        remote.add_local_player(Handle::new(1), InputDevices::KEYBOARD);
        started(&mut remote, 0);

        let latch = Latch::new(LatchButtons::JUMP, 0.0, 0.0);
        let mut sent = Vec::new();
        for _ in 0..4 {
            remote.capture_local(Handle::new(1), latch);
            sent.push(remote.talk_to_host().unwrap());
            remote.consume_frame();
        }
        assert_eq!(sent, vec![false, false, true, true]);

        let messages = host_messages(&mut host);
        let Some(Message::HostLatch(packet)) = messages.first() else {
            panic!("expected a latch packet, got {:?}", messages);
        };
        assert_eq!(packet.stamp, 3);
        assert_eq!(packet.entries, vec![(Handle::new(1), latch)]);
    }

    #[test]
    fn no_local_players_means_no_talk() {
        let hub = LoopbackHub::new();
        let mut remote = RemoteSession::new(hub.connect_remote(), 8).with_start_talk(0);
        started(&mut remote, 0);
        assert!(!remote.talk_to_host().unwrap());
        assert!(!remote.capture_local(Handle::new(0), Latch::default()));
    }

    #[test]
    fn received_latches_are_classified() {
        let hub = LoopbackHub::new();
        let mut remote = RemoteSession::new(hub.connect_remote(), 8);
        started(&mut remote, 0);

        let mut packet = LatchPacket::new(1);
        packet.push(Handle::new(2), Latch::new(LatchButtons::LEFT, 0.5, 0.5));
        let event = remote
            .handle_message(Message::RemoteLatch(packet))
            .unwrap();
        let Some(RemoteEvent::Latches(receipt)) = event else {
            panic!("expected a receipt, got {:?}", event);
        };
        assert!(receipt.is_clean());

        let event = remote
            .handle_message(Message::RemoteLatch(LatchPacket::new(5)))
            .unwrap();
        assert!(matches!(
            event,
            Some(RemoteEvent::Latches(receipt)) if receipt.order == StampOrder::Missed
        ));
        assert!(remote.is_out_of_sync());

        let frame = remote.consume_frame();
        assert_eq!(frame.len(), 1);
        assert_eq!(frame[0].1.buttons, LatchButtons::LEFT);
    }

    #[test]
    fn host_broadcast_wins_over_local_staging() {
        let hub = LoopbackHub::new();
        let mut host = hub.host();
        let mut remote = RemoteSession::new(hub.connect_remote(), 8).with_start_talk(0);
        let hero = Handle::new(1);
        remote.add_local_player(hero, InputDevices::KEYBOARD);
        started(&mut remote, 0);

        let authoritative = Latch::new(LatchButtons::LEFT, 0.5, 0.0);
        let mut packet = LatchPacket::new(1);
        packet.push(hero, authoritative);
        remote
            .handle_message(Message::RemoteLatch(packet))
            .unwrap();

        let local = Latch::new(LatchButtons::JUMP, 0.123, 0.0);
        assert!(remote.capture_local(hero, local));
        assert!(remote.talk_to_host().unwrap());
        assert_eq!(remote.consume_frame(), vec![(hero, authoritative)]);

        let messages = host_messages(&mut host);
        let Some(Message::HostLatch(sent)) = messages.last() else {
            panic!("expected a latch packet, got {:?}", messages);
        };
        assert_eq!(sent.stamp, 1);
        assert_eq!(sent.entries, vec![(hero, local.quantized())]);
    }

    #[test]
    fn bad_transfer_path_is_dropped_and_polling_goes_on() {
        let hub = LoopbackHub::new();
        let mut host = hub.host();
        let mut remote = RemoteSession::new(hub.connect_remote(), 8)
            .with_download_dir(std::env::temp_dir().join("ego_never_written"));

        assert_eq!(
            remote
                .handle_message(Message::CreateDirectory("../escape".to_string()))
                .unwrap(),
            None
        );

        host.poll_events().unwrap();
        for message in [
            Message::CreateDirectory("/etc/escape".to_string()),
            Message::Text("still here".to_string()),
        ] {
            send_message(&mut host, &message, Target::Broadcast).unwrap();
        }
        let events = remote.poll().unwrap();
        assert!(events.contains(&RemoteEvent::Text("still here".to_string())));
        assert_eq!(remote.phase(), RemotePhase::Connecting);
    }

    #[test]
    fn file_messages_without_download_dir_are_ignored() {
        let hub = LoopbackHub::new();
        let mut remote = RemoteSession::new(hub.connect_remote(), 8);
        assert_eq!(
            remote.handle_message(Message::NumFilesToSend(2)).unwrap(),
            None
        );
    }

    #[test]
    fn wait_for_start_stops_on_disconnect() {
        let hub = LoopbackHub::new();
        let _host = hub.host();
        let mut remote = RemoteSession::new(hub.connect_remote(), 8);

        hub.disconnect(ego_core::net::HOST_PEER);
        assert!(!remote.wait_for_start(|| false).unwrap());
    }
}
