//! Encapsulated message framing.
//!
//! One encapsulated message (a "frame") carries one application payload, or
//! one fragment of it, together with the reliability metadata the receiver
//! needs to deduplicate, sequence and order it.
//!
//! ```text
//! +--------------------+----------------------------------------------+
//! | u8 header          | reliability (bits 5-7) | split flag (bit 4)  |
//! | u16 length_bits    | payload length in bits                       |
//! | [u24le msg_index]  | reliable kinds                               |
//! | [u24le seq_index]  | sequenced kinds                              |
//! | [u24le order_idx]  | sequenced or ordered kinds                   |
//! | [u8 order_channel] |                                              |
//! | [u32 split_count]  | split flag set                               |
//! | [i16 split_id]     |                                              |
//! | [u32 split_index]  |                                              |
//! | payload            |                                              |
//! +--------------------+----------------------------------------------+
//! ```

use crate::binary::{BufExt, BufMutExt};
use crate::error::WireError;
use crate::reliability::Reliability;
use bytes::{BufMut, Bytes, BytesMut};

/// Largest payload whose bit length fits the 16-bit length field
pub const MAX_FRAME_PAYLOAD: usize = 8191;

/// Fixed part of every frame header (header byte + length field)
pub const FRAME_BASE_HEADER_SIZE: usize = 3;

/// Size of the split header when present
pub const SPLIT_HEADER_SIZE: usize = 10;

/// Header flag marking a fragment
const SPLIT_FLAG: u8 = 0x10;

/// Order index and channel of a sequenced or ordered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrderInfo {
    /// Position within the channel
    pub index: u32,
    /// Ordering channel (0..32)
    pub channel: u8,
}

/// Fragment metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    /// Total number of fragments
    pub count: u32,
    /// Identifier shared by all fragments of one message
    pub id: i16,
    /// 0-based fragment index
    pub index: u32,
}

/// One encapsulated message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Delivery guarantees
    pub reliability: Reliability,
    /// Present for reliable kinds
    pub message_index: Option<u32>,
    /// Present for sequenced kinds
    pub sequence_index: Option<u32>,
    /// Present for sequenced or ordered kinds
    pub order: Option<OrderInfo>,
    /// Present for fragments
    pub split: Option<SplitInfo>,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create an unsplit frame with no indices assigned yet
    pub fn new(reliability: Reliability, payload: Bytes) -> Self {
        Self {
            reliability,
            message_index: None,
            sequence_index: None,
            order: None,
            split: None,
            payload,
        }
    }

    /// Header size for a frame of the given kind, excluding payload
    pub fn header_size(reliability: Reliability, split: bool) -> usize {
        let mut size = FRAME_BASE_HEADER_SIZE + reliability.index_fields_size();
        if split {
            size += SPLIT_HEADER_SIZE;
        }
        size
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        Self::header_size(self.reliability, self.split.is_some()) + self.payload.len()
    }

    /// Encode the frame; index fields required by the kind but unset encode as zero
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        let len = self.payload.len();
        if len == 0 {
            return Err(WireError::EmptyPayload);
        }
        if len > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(len));
        }

        buf.reserve(self.encoded_size());

        let mut header = (self.reliability as u8) << 5;
        if self.split.is_some() {
            header |= SPLIT_FLAG;
        }
        buf.put_u8(header);
        buf.put_u16((len << 3) as u16);

        if self.reliability.is_reliable() {
            buf.put_triad_le(self.message_index.unwrap_or(0));
        }
        if self.reliability.is_sequenced() {
            buf.put_triad_le(self.sequence_index.unwrap_or(0));
        }
        if self.reliability.is_sequenced_or_ordered() {
            let order = self.order.unwrap_or_default();
            buf.put_triad_le(order.index);
            buf.put_u8(order.channel);
        }
        if let Some(split) = self.split {
            buf.put_u32(split.count);
            buf.put_i16(split.id);
            buf.put_u32(split.index);
        }

        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Decode one frame from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let header = buf.read_u8()?;
        let reliability = Reliability::from(header >> 5);
        let has_split = header & SPLIT_FLAG != 0;

        let bits = buf.read_u16()? as usize;
        let len = (bits + 7) / 8;
        if len == 0 {
            return Err(WireError::EmptyPayload);
        }

        let message_index = if reliability.is_reliable() {
            Some(buf.read_triad_le()?)
        } else {
            None
        };

        let sequence_index = if reliability.is_sequenced() {
            Some(buf.read_triad_le()?)
        } else {
            None
        };

        let order = if reliability.is_sequenced_or_ordered() {
            Some(OrderInfo {
                index: buf.read_triad_le()?,
                channel: buf.read_u8()?,
            })
        } else {
            None
        };

        let split = if has_split {
            Some(SplitInfo {
                count: buf.read_u32()?,
                id: buf.read_i16()?,
                index: buf.read_u32()?,
            })
        } else {
            None
        };

        let payload = buf.read_bytes(len)?;

        Ok(Self {
            reliability,
            message_index,
            sequence_index,
            order,
            split,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_frame(reliability: Reliability, payload: Bytes) -> Frame {
        Frame {
            reliability,
            message_index: reliability.is_reliable().then_some(0x0A0B0C),
            sequence_index: reliability.is_sequenced().then_some(17),
            order: reliability
                .is_sequenced_or_ordered()
                .then_some(OrderInfo { index: 99, channel: 3 }),
            split: None,
            payload,
        }
    }

    #[test]
    fn test_every_kind_decodes_to_itself() {
        for kind in Reliability::ALL {
            for len in [1usize, 2, 255, 1400, MAX_FRAME_PAYLOAD] {
                let frame = full_frame(kind, Bytes::from(vec![0x5A; len]));
                let mut buf = BytesMut::new();
                frame.encode(&mut buf).unwrap();
                assert_eq!(buf.len(), frame.encoded_size());

                let mut bytes = buf.freeze();
                let decoded = Frame::decode(&mut bytes).unwrap();
                assert_eq!(decoded, frame);
                assert!(bytes.is_empty());
            }
        }
    }

    #[test]
    fn test_split_header() {
        let mut frame = full_frame(Reliability::ReliableOrdered, Bytes::from_static(b"part"));
        frame.split = Some(SplitInfo {
            count: 3,
            id: -2,
            index: 1,
        });

        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(buf[0], (3 << 5) | SPLIT_FLAG);
        assert_eq!(buf.len(), 3 + 3 + 4 + 10 + 4);

        let decoded = Frame::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(Reliability::Unreliable, Bytes::from_static(b"abc"));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x00, 24, b'a', b'b', b'c']);
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut bytes = Bytes::from_static(&[0x00, 0x00, 0x00]);
        assert_eq!(Frame::decode(&mut bytes), Err(WireError::EmptyPayload));

        let frame = Frame::new(Reliability::Reliable, Bytes::new());
        assert_eq!(
            frame.encode(&mut BytesMut::new()),
            Err(WireError::EmptyPayload)
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::new(
            Reliability::Unreliable,
            Bytes::from(vec![0u8; MAX_FRAME_PAYLOAD + 1]),
        );
        assert_eq!(
            frame.encode(&mut BytesMut::new()),
            Err(WireError::PayloadTooLarge(MAX_FRAME_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_truncated_payload_is_error() {
        // Declares 4 bytes, carries 2
        let mut bytes = Bytes::from_static(&[0x00, 0x00, 32, 1, 2]);
        assert!(matches!(
            Frame::decode(&mut bytes),
            Err(WireError::Eof { needed: 4, .. })
        ));
    }
}
