use super::transport::Channel;

/// Two-byte header identifying a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    ToAnyText = 25935,

    ToHostModuleOk = 14951,
    ToHostModuleBad = 14952,
    ToHostLatch = 33911,
    ToHostImLoaded = 40192,

    ToRemoteModule = 56025,
    ToRemoteLatch = 12715,
    ToRemoteStart = 51390,

    NetTransferFile = 10001,
    NetTransferOk = 10002,
    NetCreateDirectory = 10003,
    NetDoneSendingFiles = 10009,
    NetNumFilesToSend = 10010,
}

impl MessageType {
    /// Converts a raw header into a [`MessageType`].
    ///
    /// # Returns
    /// * `Some(MessageType)` for a known header, `None` otherwise.
    pub fn from_u16(value: u16) -> Option<Self> {
        let kind = match value {
            25935 => MessageType::ToAnyText,
            14951 => MessageType::ToHostModuleOk,
            14952 => MessageType::ToHostModuleBad,
            33911 => MessageType::ToHostLatch,
            40192 => MessageType::ToHostImLoaded,
            56025 => MessageType::ToRemoteModule,
            12715 => MessageType::ToRemoteLatch,
            51390 => MessageType::ToRemoteStart,
            10001 => MessageType::NetTransferFile,
            10002 => MessageType::NetTransferOk,
            10003 => MessageType::NetCreateDirectory,
            10009 => MessageType::NetDoneSendingFiles,
            10010 => MessageType::NetNumFilesToSend,
            _ => return None,
        };
        Some(kind)
    }

    /// Latches ride the unreliable channel; stale motion is replaced next frame anyway.
    pub fn channel(self) -> Channel {
        match self {
            MessageType::ToHostLatch | MessageType::ToRemoteLatch => Channel::Unreliable,
            _ => Channel::Guaranteed,
        }
    }
}
