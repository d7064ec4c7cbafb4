//! Latch sync wire protocol and the transports that carry it

pub mod file_transfer;
pub mod loopback;
pub mod messages;
pub mod opcode;
pub mod packet;
pub mod tcp;
pub mod transport;

pub use file_transfer::{FileReceiver, FileSender};
pub use loopback::{LoopbackEndpoint, LoopbackHub};
pub use messages::{FileChunk, LatchPacket, Message};
pub use opcode::MessageType;
pub use packet::{PacketBuilder, PacketError, PacketReader};
pub use tcp::TcpTransport;
pub use transport::{Channel, PeerId, Target, Transport, TransportEvent, HOST_PEER};

/// Encodes `message` and sends it on the channel its type calls for.
pub fn send_message<T: Transport + ?Sized>(
    transport: &mut T,
    message: &Message,
    target: Target,
) -> anyhow::Result<()> {
    let payload = message.encode()?;
    transport.send(message.kind().channel(), &payload, target)
}
