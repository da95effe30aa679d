//! ACK/NAK record sets with run-length interval compression.

use crate::binary::{BufExt, BufMutExt};
use crate::datagram::DatagramFlags;
use crate::error::WireError;
use bytes::{BufMut, Bytes, BytesMut};

/// Cap on entries expanded from a single range record
pub const MAX_RANGE_ENTRIES: u32 = 512;

/// Cap on entries expanded from a whole packet
pub const MAX_ACK_ENTRIES: usize = 4096;

/// Packet id of an ACK
pub const ACK_ID: u8 = 0xC0;

/// Packet id of a NAK
pub const NAK_ID: u8 = 0xA0;

/// Largest encoded record (range flag plus two triads)
pub const MAX_RECORD_SIZE: usize = 7;

/// Packet id byte plus record count
pub const ACK_HEADER_SIZE: usize = 3;

/// Acknowledgement polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Sequence numbers received
    Ack,
    /// Sequence numbers missing
    Nak,
}

impl AckKind {
    /// Wire id of the packet
    pub fn id(self) -> u8 {
        match self {
            AckKind::Ack => ACK_ID,
            AckKind::Nak => NAK_ID,
        }
    }
}

/// One compressed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRecord {
    /// A lone sequence number
    Single(u32),
    /// Inclusive run of consecutive sequence numbers
    Range(u32, u32),
}

/// Compress a set of sequence numbers into maximal runs.
///
/// Runs are additionally cut at [`MAX_RANGE_ENTRIES`] so the decoder's range
/// clamp never loses entries.
pub fn compress(sequences: &[u32]) -> Vec<AckRecord> {
    let mut sorted = sequences.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut records = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut first) = iter.next() else {
        return records;
    };
    let mut last = first;

    for seq in iter {
        if seq == last + 1 && seq - first < MAX_RANGE_ENTRIES {
            last = seq;
            continue;
        }
        records.push(run(first, last));
        first = seq;
        last = seq;
    }
    records.push(run(first, last));
    records
}

fn run(first: u32, last: u32) -> AckRecord {
    if first == last {
        AckRecord::Single(first)
    } else {
        AckRecord::Range(first, last)
    }
}

/// Expand records back into sequence numbers, applying the range and packet caps
pub fn expand(records: &[AckRecord]) -> Vec<u32> {
    let mut out = Vec::new();
    for record in records {
        let (first, last) = match *record {
            AckRecord::Single(seq) => (seq, seq),
            AckRecord::Range(first, last) => (first, last),
        };
        if last < first {
            continue;
        }
        let span = (last - first + 1).min(MAX_RANGE_ENTRIES);
        for seq in first..first + span {
            if out.len() >= MAX_ACK_ENTRIES {
                return out;
            }
            out.push(seq);
        }
    }
    out
}

/// An ACK or NAK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    /// Polarity
    pub kind: AckKind,
    /// Sequence numbers, ascending
    pub sequences: Vec<u32>,
}

impl AckPacket {
    /// Create a packet; the sequence set is sorted and deduplicated
    pub fn new(kind: AckKind, mut sequences: Vec<u32>) -> Self {
        sequences.sort_unstable();
        sequences.dedup();
        Self { kind, sequences }
    }

    /// Encode id, record count and records
    pub fn encode(&self, buf: &mut BytesMut) {
        let records = compress(&self.sequences);
        buf.reserve(ACK_HEADER_SIZE + records.len() * MAX_RECORD_SIZE);
        buf.put_u8(self.kind.id());
        buf.put_i16(records.len().min(i16::MAX as usize) as i16);
        for record in records.into_iter().take(i16::MAX as usize) {
            match record {
                AckRecord::Single(seq) => {
                    buf.put_u8(1);
                    buf.put_triad_le(seq);
                }
                AckRecord::Range(first, last) => {
                    buf.put_u8(0);
                    buf.put_triad_le(first);
                    buf.put_triad_le(last);
                }
            }
        }
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode an ACK or NAK; polarity comes from the flag bits of the id byte
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let flags = DatagramFlags::from_bits_retain(buf.read_u8()?);
        let kind = if flags.contains(DatagramFlags::VALID | DatagramFlags::ACK) {
            AckKind::Ack
        } else if flags.contains(DatagramFlags::VALID | DatagramFlags::NAK) {
            AckKind::Nak
        } else {
            return Err(WireError::Malformed("not an acknowledgement"));
        };

        let count = buf.read_i16()?;
        if count < 0 {
            return Err(WireError::Malformed("negative ack record count"));
        }

        let mut records = Vec::with_capacity((count as usize).min(MAX_ACK_ENTRIES));
        for _ in 0..count {
            let single = buf.read_bool()?;
            let record = if single {
                AckRecord::Single(buf.read_triad_le()?)
            } else {
                AckRecord::Range(buf.read_triad_le()?, buf.read_triad_le()?)
            };
            records.push(record);
        }

        Ok(Self {
            kind,
            sequences: expand(&records),
        })
    }

    /// Split a large set into packets that stay within `budget` encoded bytes
    pub fn batches(kind: AckKind, sequences: Vec<u32>, budget: usize) -> Vec<AckPacket> {
        let per_packet = (budget.saturating_sub(ACK_HEADER_SIZE) / MAX_RECORD_SIZE)
            .clamp(1, MAX_ACK_ENTRIES);
        let packet = AckPacket::new(kind, sequences);
        packet
            .sequences
            .chunks(per_packet)
            .map(|chunk| AckPacket {
                kind,
                sequences: chunk.to_vec(),
            })
            .collect()
    }
}
