//! Packet builder/reader. Integers are big-endian (network order); strings
//! are null-terminated.

use thiserror::Error;

use super::opcode::MessageType;
use crate::constants::{MAX_PACKET_SIZE, MAX_PACKET_STRING};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated: needed {needed} bytes at offset {offset}, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("unknown message type {0}")]
    UnknownOpcode(u16),
    #[error("string of {0} bytes exceeds the 255 byte limit")]
    StringTooLong(usize),
    #[error("string is unterminated or not utf-8")]
    InvalidString,
    #[error("packet of {0} bytes exceeds the 4096 byte limit")]
    TooLarge(usize),
}

/// Appends fields to an outgoing message, header first.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    bytes: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(kind: MessageType) -> Self {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&(kind as u16).to_be_bytes());
        PacketBuilder { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn add_u8(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn add_i16(&mut self, value: i16) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn add_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(value);
        self
    }

    pub fn add_string(&mut self, value: &str) -> Result<&mut Self, PacketError> {
        if value.len() > MAX_PACKET_STRING {
            return Err(PacketError::StringTooLong(value.len()));
        }
        if value.as_bytes().contains(&0) {
            return Err(PacketError::InvalidString);
        }
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        Ok(self)
    }

    pub fn finish(self) -> Result<Vec<u8>, PacketError> {
        if self.bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(self.bytes.len()));
        }
        Ok(self.bytes)
    }
}

/// Bounds-checked cursor over a received message.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        PacketReader { bytes, offset: 0 }
    }

    /// Reads the header, failing on truncated input or an unknown opcode.
    pub fn open(bytes: &'a [u8]) -> Result<(MessageType, Self), PacketError> {
        let mut reader = PacketReader::new(bytes);
        let raw = reader.read_u16()?;
        let kind = MessageType::from_u16(raw).ok_or(PacketError::UnknownOpcode(raw))?;
        Ok((kind, reader))
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < needed {
            return Err(PacketError::Truncated {
                offset: self.offset,
                needed,
                available: self.remaining(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, PacketError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> Result<i16, PacketError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], PacketError> {
        self.take(len)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.offset..];
        self.offset = self.bytes.len();
        rest
    }

    pub fn read_string(&mut self) -> Result<String, PacketError> {
        let rest = &self.bytes[self.offset..];
        let len = rest
            .iter()
            .position(|&c| c == 0)
            .ok_or(PacketError::InvalidString)?;
        if len > MAX_PACKET_STRING {
            return Err(PacketError::StringTooLong(len));
        }
        let value = std::str::from_utf8(&rest[..len])
            .map_err(|_| PacketError::InvalidString)?
            .to_string();
        self.offset += len + 1;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{PacketBuilder, PacketError, PacketReader};
    use crate::net::opcode::MessageType;

    #[test]
    fn header_and_integers_are_big_endian() {
        let mut builder = PacketBuilder::new(MessageType::ToRemoteLatch);
        builder.add_u32(0x0102_0304).add_i16(-2);
        let bytes = builder.finish().unwrap();
        assert_eq!(&bytes[..2], &12715u16.to_be_bytes());
        assert_eq!(&bytes[2..6], &[1, 2, 3, 4]);
        assert_eq!(&bytes[6..], &[0xFF, 0xFE]);
    }

    #[test]
    fn reader_reports_truncation() {
        let bytes = [0x31, 0xAB, 0x00];
        let (kind, mut reader) = PacketReader::open(&bytes).unwrap();
        assert_eq!(kind, MessageType::ToRemoteLatch);
        assert_eq!(
            reader.read_u32(),
            Err(PacketError::Truncated {
                offset: 2,
                needed: 4,
                available: 1
            })
        );
    }

    #[test]
    fn unknown_header_is_rejected() {
        assert_eq!(
            PacketReader::open(&[0, 1]).map(|(kind, _)| kind),
            Err(PacketError::UnknownOpcode(1))
        );
    }

    #[test]
    fn strings_are_null_terminated() {
        let mut builder = PacketBuilder::new(MessageType::ToAnyText);
        builder.add_string("hello").unwrap();
        builder.add_u8(9);
        let bytes = builder.finish().unwrap();
        assert_eq!(&bytes[2..8], b"hello\0");

        let (_, mut reader) = PacketReader::open(&bytes).unwrap();
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_u8().unwrap(), 9);
        assert!(reader.is_exhausted());
    }

    #[test]
    fn overlong_and_unterminated_strings_fail() {
        let mut builder = PacketBuilder::new(MessageType::ToAnyText);
        let long = "x".repeat(256);
        assert_eq!(builder.add_string(&long).err(), Some(PacketError::StringTooLong(256)));

        let mut reader = PacketReader::new(b"abc");
        assert_eq!(reader.read_string(), Err(PacketError::InvalidString));
    }
}
