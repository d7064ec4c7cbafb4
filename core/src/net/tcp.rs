//! Non-blocking TCP transport.
//!
//! Frames are `{u8 channel, u16 length, payload}`, big-endian. TCP delivers
//! both channels reliably; the channel tag is kept so the receiver can tell
//! them apart.

use std::{
    collections::BTreeMap,
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
};

use anyhow::{bail, Context};

use super::transport::{Channel, PeerId, Target, Transport, TransportEvent, HOST_PEER};

const FRAME_HEADER: usize = 3;
const READ_CHUNK: usize = 4096;

struct Connection {
    stream: TcpStream,
    inbuf: Vec<u8>,
    outbox: Vec<u8>,
}

impl Connection {
    fn new(stream: TcpStream) -> anyhow::Result<Self> {
        stream
            .set_nonblocking(true)
            .context("set_nonblocking(true)")?;
        stream.set_nodelay(true).context("set_nodelay(true)")?;
        Ok(Connection {
            stream,
            inbuf: Vec::new(),
            outbox: Vec::new(),
        })
    }

    /// Writes as much of the outbox as the socket takes. `false` on a dead socket.
    fn flush(&mut self) -> bool {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return false,
                Ok(written) => {
                    self.outbox.drain(..written);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("tcp write failed: {}", e);
                    return false;
                }
            }
        }
        true
    }

    /// Reads everything available. `false` once the peer hung up.
    fn fill(&mut self) -> bool {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return false,
                Ok(len) => self.inbuf.extend_from_slice(&buf[..len]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("tcp read failed: {}", e);
                    return false;
                }
            }
        }
    }

    /// Splits complete frames off the front of the input buffer.
    fn frames(&mut self) -> Vec<(Channel, Vec<u8>)> {
        let mut out = Vec::new();
        let mut used = 0;
        while self.inbuf.len() - used >= FRAME_HEADER {
            let header = &self.inbuf[used..used + FRAME_HEADER];
            let len = u16::from_be_bytes([header[1], header[2]]) as usize;
            if self.inbuf.len() - used < FRAME_HEADER + len {
                break;
            }
            let start = used + FRAME_HEADER;
            match Channel::from_u8(header[0]) {
                Some(channel) => out.push((channel, self.inbuf[start..start + len].to_vec())),
                None => log::debug!("dropping frame with unknown channel {}", header[0]),
            }
            used = start + len;
        }
        self.inbuf.drain(..used);
        out
    }
}

pub struct TcpTransport {
    listener: Option<TcpListener>,
    connections: BTreeMap<PeerId, Connection>,
    next_remote: u32,
    pending: Vec<TransportEvent>,
}

impl TcpTransport {
    /// Host side: accepts remotes on `addr`.
    pub fn listen<A: ToSocketAddrs>(addr: A) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).context("binding host socket")?;
        listener
            .set_nonblocking(true)
            .context("set_nonblocking(true)")?;
        log::info!("listening on {}", listener.local_addr()?);
        Ok(TcpTransport {
            listener: Some(listener),
            connections: BTreeMap::new(),
            next_remote: 0,
            pending: Vec::new(),
        })
    }

    /// Remote side: one blocking connect, non-blocking afterwards.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).context("connecting to host")?;
        log::info!("connected to host at {}", stream.peer_addr()?);
        let mut connections = BTreeMap::new();
        connections.insert(HOST_PEER, Connection::new(stream)?);
        Ok(TcpTransport {
            listener: None,
            connections,
            next_remote: 0,
            pending: vec![TransportEvent::Connected(HOST_PEER)],
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }
        match self.connections.get(&HOST_PEER) {
            Some(connection) => Ok(connection.stream.local_addr()?),
            None => bail!("transport has no socket"),
        }
    }

    fn accept_new(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let connection = match Connection::new(stream) {
                        Ok(connection) => connection,
                        Err(e) => {
                            log::warn!("dropping connection from {}: {:#}", addr, e);
                            continue;
                        }
                    };
                    self.next_remote += 1;
                    let id = PeerId(self.next_remote);
                    log::info!("{} connected from {}", id, addr);
                    self.connections.insert(id, connection);
                    self.pending.push(TransportEvent::Connected(id));
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn drop_peer(&mut self, peer: PeerId) {
        if self.connections.remove(&peer).is_some() {
            log::info!("{} disconnected", peer);
            self.pending.push(TransportEvent::Disconnected(peer));
        }
    }
}

impl Transport for TcpTransport {
    fn poll_events(&mut self) -> anyhow::Result<Vec<TransportEvent>> {
        self.accept_new();

        let mut dead = Vec::new();
        let mut received = Vec::new();
        for (&peer, connection) in self.connections.iter_mut() {
            if !connection.flush() || !connection.fill() {
                dead.push(peer);
            }
            for (channel, payload) in connection.frames() {
                received.push(TransportEvent::Received {
                    peer,
                    channel,
                    payload,
                });
            }
        }
        self.pending.extend(received);
        for peer in dead {
            self.drop_peer(peer);
        }

        Ok(std::mem::take(&mut self.pending))
    }

    fn send(&mut self, channel: Channel, payload: &[u8], target: Target) -> anyhow::Result<()> {
        let Ok(len) = u16::try_from(payload.len()) else {
            bail!("payload of {} bytes does not fit a frame", payload.len());
        };

        let mut dead = Vec::new();
        for (&peer, connection) in self.connections.iter_mut() {
            if !target.includes(peer) {
                continue;
            }
            connection.outbox.push(channel as u8);
            connection.outbox.extend_from_slice(&len.to_be_bytes());
            connection.outbox.extend_from_slice(payload);
            if !connection.flush() {
                dead.push(peer);
            }
        }
        for peer in dead {
            self.drop_peer(peer);
        }
        Ok(())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.connections.keys().copied().collect()
    }
}
