//! Typed message bodies on top of [`PacketBuilder`]/[`PacketReader`]

use super::{
    opcode::MessageType,
    packet::{PacketBuilder, PacketError, PacketReader},
};
use crate::{
    constants::LATCH_ENTRY_SIZE,
    latch::{dequantize, quantize, Latch, LatchButtons},
    pool::Handle,
};

/// Body of `TO_HOST_LATCH` / `TO_REMOTE_LATCH`.
///
/// `{u32 stamp}` followed by `{u16 handle, u8 button, i16 x, i16 y}` entries
/// until the end of the message. There is no count prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatchPacket {
    pub stamp: u32,
    pub entries: Vec<(Handle, Latch)>,
}

impl LatchPacket {
    pub fn new(stamp: u32) -> Self {
        LatchPacket {
            stamp,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, handle: Handle, latch: Latch) {
        self.entries.push((handle, latch));
    }

    fn write(&self, builder: &mut PacketBuilder) {
        builder.add_u32(self.stamp);
        for (handle, latch) in &self.entries {
            let Some(wire) = handle.to_wire() else {
                log::warn!("latch for {} does not fit the wire format, skipped", handle);
                continue;
            };
            builder
                .add_u16(wire)
                .add_u8(latch.buttons.bits())
                .add_i16(quantize(latch.x))
                .add_i16(quantize(latch.y));
        }
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, PacketError> {
        let stamp = reader.read_u32()?;
        let mut entries = Vec::with_capacity(reader.remaining() / LATCH_ENTRY_SIZE);
        while !reader.is_exhausted() {
            let handle = Handle::from_wire(reader.read_u16()?);
            let buttons = LatchButtons::from_bits_retain(reader.read_u8()?);
            let x = dequantize(reader.read_i16()?);
            let y = dequantize(reader.read_i16()?);
            entries.push((handle, Latch { buttons, x, y }));
        }
        Ok(LatchPacket { stamp, entries })
    }
}

/// One piece of a replicated file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    /// Path relative to the receiver's root, `/` separated.
    pub path: String,
    pub total_size: u32,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl FileChunk {
    pub fn is_last(&self) -> bool {
        self.offset as usize + self.data.len() >= self.total_size as usize
    }
}

/// Every message this protocol exchanges.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),

    ModuleOk,
    ModuleBad,
    HostLatch(LatchPacket),
    ImLoaded,

    /// Sent to each remote on its own, listing the characters it will drive.
    RemoteModule {
        seed: u32,
        module: String,
        characters: Vec<Handle>,
    },
    RemoteLatch(LatchPacket),
    RemoteStart { frame: u32 },

    TransferFile(FileChunk),
    TransferOk(String),
    CreateDirectory(String),
    DoneSendingFiles,
    NumFilesToSend(u32),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Text(_) => MessageType::ToAnyText,
            Message::ModuleOk => MessageType::ToHostModuleOk,
            Message::ModuleBad => MessageType::ToHostModuleBad,
            Message::HostLatch(_) => MessageType::ToHostLatch,
            Message::ImLoaded => MessageType::ToHostImLoaded,
            Message::RemoteModule { .. } => MessageType::ToRemoteModule,
            Message::RemoteLatch(_) => MessageType::ToRemoteLatch,
            Message::RemoteStart { .. } => MessageType::ToRemoteStart,
            Message::TransferFile(_) => MessageType::NetTransferFile,
            Message::TransferOk(_) => MessageType::NetTransferOk,
            Message::CreateDirectory(_) => MessageType::NetCreateDirectory,
            Message::DoneSendingFiles => MessageType::NetDoneSendingFiles,
            Message::NumFilesToSend(_) => MessageType::NetNumFilesToSend,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut builder = PacketBuilder::new(self.kind());
        match self {
            Message::Text(text) | Message::TransferOk(text) | Message::CreateDirectory(text) => {
                builder.add_string(text)?;
            }
            Message::HostLatch(packet) | Message::RemoteLatch(packet) => packet.write(&mut builder),
            Message::RemoteModule {
                seed,
                module,
                characters,
            } => {
                builder.add_u32(*seed).add_string(module)?;
                for handle in characters {
                    match handle.to_wire() {
                        Some(wire) => {
                            builder.add_u16(wire);
                        }
                        None => log::warn!("{} does not fit the wire format, skipped", handle),
                    }
                }
            }
            Message::RemoteStart { frame } => {
                builder.add_u32(*frame);
            }
            Message::TransferFile(chunk) => {
                builder
                    .add_string(&chunk.path)?
                    .add_u32(chunk.total_size)
                    .add_u32(chunk.offset)
                    .add_bytes(&chunk.data);
            }
            Message::NumFilesToSend(count) => {
                builder.add_u32(*count);
            }
            Message::ModuleOk | Message::ModuleBad | Message::ImLoaded | Message::DoneSendingFiles => {}
        }
        builder.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PacketError> {
        let (kind, mut reader) = PacketReader::open(payload)?;
        let message = match kind {
            MessageType::ToAnyText => Message::Text(reader.read_string()?),
            MessageType::ToHostModuleOk => Message::ModuleOk,
            MessageType::ToHostModuleBad => Message::ModuleBad,
            MessageType::ToHostLatch => Message::HostLatch(LatchPacket::read(&mut reader)?),
            MessageType::ToHostImLoaded => Message::ImLoaded,
            MessageType::ToRemoteModule => {
                let seed = reader.read_u32()?;
                let module = reader.read_string()?;
                let mut characters = Vec::with_capacity(reader.remaining() / 2);
                while !reader.is_exhausted() {
                    characters.push(Handle::from_wire(reader.read_u16()?));
                }
                Message::RemoteModule {
                    seed,
                    module,
                    characters,
                }
            }
            MessageType::ToRemoteLatch => Message::RemoteLatch(LatchPacket::read(&mut reader)?),
            MessageType::ToRemoteStart => Message::RemoteStart {
                frame: reader.read_u32()?,
            },
            MessageType::NetTransferFile => {
                let path = reader.read_string()?;
                let total_size = reader.read_u32()?;
                let offset = reader.read_u32()?;
                let data = reader.read_rest().to_vec();
                Message::TransferFile(FileChunk {
                    path,
                    total_size,
                    offset,
                    data,
                })
            }
            MessageType::NetTransferOk => Message::TransferOk(reader.read_string()?),
            MessageType::NetCreateDirectory => Message::CreateDirectory(reader.read_string()?),
            MessageType::NetDoneSendingFiles => Message::DoneSendingFiles,
            MessageType::NetNumFilesToSend => Message::NumFilesToSend(reader.read_u32()?),
        };
        Ok(message)
    }
}
