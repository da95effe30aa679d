//! Datagram framing: the unit actually written to the UDP socket.

use crate::binary::{BufExt, BufMutExt};
use crate::error::WireError;
use crate::frame::Frame;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

/// Flag byte plus the sequence number triad
pub const DATAGRAM_HEADER_SIZE: usize = 4;

/// Per-datagram allowance reserved out of the MTU when packing frames
pub const DATAGRAM_OVERHEAD: usize = 38;

/// Largest sequence number representable in a triad
pub const MAX_SEQUENCE: u32 = 0x00FF_FFFF;

bitflags! {
    /// Leading flag byte of every online datagram
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DatagramFlags: u8 {
        /// Always set on framed online packets
        const VALID = 0x80;
        /// Acknowledgement packet
        const ACK = 0x40;
        /// Negative acknowledgement packet
        const NAK = 0x20;
        /// Packet pair hint
        const PACKET_PAIR = 0x10;
        /// Continuous send hint
        const CONTINUOUS_SEND = 0x08;
        /// Needs B and AS hint
        const NEEDS_B_AND_AS = 0x04;
    }
}

/// Coarse classification of an inbound buffer by its first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    /// Not framed: handshake or raw packet
    Offline,
    /// Acknowledgement record set
    Ack,
    /// Negative acknowledgement record set
    Nak,
    /// Datagram carrying encapsulated frames
    Data,
}

impl DatagramKind {
    /// Classify a buffer by its leading byte
    pub fn classify(first: u8) -> Self {
        let flags = DatagramFlags::from_bits_retain(first);
        if !flags.contains(DatagramFlags::VALID) {
            DatagramKind::Offline
        } else if flags.contains(DatagramFlags::ACK) {
            DatagramKind::Ack
        } else if flags.contains(DatagramFlags::NAK) {
            DatagramKind::Nak
        } else {
            DatagramKind::Data
        }
    }
}

/// One framed datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Flag byte
    pub flags: DatagramFlags,
    /// Per-direction sequence number (24-bit)
    pub sequence: u32,
    /// Encapsulated frames in send order
    pub frames: Vec<Frame>,
}

impl Datagram {
    /// Create an empty data datagram
    pub fn new(sequence: u32) -> Self {
        Self {
            flags: DatagramFlags::VALID,
            sequence,
            frames: Vec::new(),
        }
    }

    /// Encoded length of the header and every frame
    pub fn encoded_size(&self) -> usize {
        DATAGRAM_HEADER_SIZE + self.frames.iter().map(Frame::encoded_size).sum::<usize>()
    }

    /// Encode into `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.reserve(self.encoded_size());
        buf.put_u8((self.flags | DatagramFlags::VALID).bits());
        buf.put_triad_le(self.sequence);
        for frame in &self.frames {
            frame.encode(buf)?;
        }
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a datagram; frames are read until the buffer is exhausted
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let flags = DatagramFlags::from_bits_retain(buf.read_u8()?);
        if !flags.contains(DatagramFlags::VALID) {
            return Err(WireError::Malformed("datagram without valid flag"));
        }
        let sequence = buf.read_triad_le()?;

        let mut frames = Vec::new();
        while !buf.is_empty() {
            frames.push(Frame::decode(buf)?);
        }

        Ok(Self {
            flags,
            sequence,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::Reliability;

    #[test]
    fn test_classify() {
        assert_eq!(DatagramKind::classify(0x01), DatagramKind::Offline);
        assert_eq!(DatagramKind::classify(0x1c), DatagramKind::Offline);
        assert_eq!(DatagramKind::classify(0xC0), DatagramKind::Ack);
        assert_eq!(DatagramKind::classify(0xA0), DatagramKind::Nak);
        assert_eq!(DatagramKind::classify(0x84), DatagramKind::Data);
        assert_eq!(DatagramKind::classify(0x80), DatagramKind::Data);
    }

    #[test]
    fn test_datagram_with_frames() {
        let mut datagram = Datagram::new(0x010203);
        datagram.flags |= DatagramFlags::NEEDS_B_AND_AS;
        datagram
            .frames
            .push(Frame::new(Reliability::Unreliable, Bytes::from_static(b"one")));
        let mut reliable = Frame::new(Reliability::Reliable, Bytes::from_static(b"two"));
        reliable.message_index = Some(7);
        datagram.frames.push(reliable);

        let bytes = datagram.to_bytes().unwrap();
        assert_eq!(bytes.len(), datagram.encoded_size());
        assert_eq!(&bytes[..4], &[0x84, 0x03, 0x02, 0x01]);

        let decoded = Datagram::decode(&mut bytes.clone()).unwrap();
        assert_eq!(decoded, datagram);
    }

    #[test]
    fn test_truncated_trailing_frame_is_error() {
        let mut datagram = Datagram::new(1);
        datagram
            .frames
            .push(Frame::new(Reliability::Unreliable, Bytes::from_static(b"payload")));
        let bytes = datagram.to_bytes().unwrap();

        let mut truncated = bytes.slice(..bytes.len() - 2);
        assert!(matches!(
            Datagram::decode(&mut truncated),
            Err(WireError::Eof { .. })
        ));
    }

    #[test]
    fn test_offline_byte_rejected() {
        let mut bytes = Bytes::from_static(&[0x05, 0, 0, 0]);
        assert!(Datagram::decode(&mut bytes).is_err());
    }
}
