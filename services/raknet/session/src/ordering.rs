//! Message-level delivery rules: reliable deduplication, sequenced discard
//! and per-channel ordering.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Number of ordering channels
pub const ORDER_CHANNELS: usize = 32;

/// Deduplicates reliable messages by message index
#[derive(Debug)]
pub struct MessageDedup {
    /// Every index below this has been seen
    base: u32,
    /// Indices at or beyond `base + limit` are refused
    limit: u32,
    seen: BTreeSet<u32>,
}

impl MessageDedup {
    /// Dedup accepting at most `limit` indices ahead of the contiguous base
    pub fn new(limit: u32) -> Self {
        Self {
            base: 0,
            limit: limit.max(1),
            seen: BTreeSet::new(),
        }
    }

    /// Record an index; false when it was already seen or is too far ahead
    pub fn insert(&mut self, index: u32) -> bool {
        if index < self.base || index - self.base >= self.limit {
            return false;
        }
        if !self.seen.insert(index) {
            return false;
        }
        while self.seen.remove(&self.base) {
            self.base += 1;
        }
        true
    }

    /// Indices seen beyond the contiguous base
    pub fn held(&self) -> usize {
        self.seen.len()
    }
}

#[derive(Debug, Default)]
struct Channel {
    next_order: u32,
    pending: BTreeMap<u32, Bytes>,
    highest_sequence: Option<u32>,
}

/// Receive-side state for all ordering channels
#[derive(Debug)]
pub struct OrderingChannels {
    channels: Vec<Channel>,
    /// Messages at or beyond `next_order + limit` on a channel are dropped
    limit: u32,
}

impl OrderingChannels {
    /// Fresh channels holding back at most `limit` order indices each
    pub fn new(limit: u32) -> Self {
        Self {
            channels: (0..ORDER_CHANNELS).map(|_| Channel::default()).collect(),
            limit: limit.max(1),
        }
    }

    /// Accept an ordered message and return everything now deliverable in order
    pub fn order(&mut self, channel: u8, index: u32, payload: Bytes) -> Vec<Bytes> {
        let Some(ch) = self.channels.get_mut(channel as usize) else {
            return Vec::new();
        };
        if index < ch.next_order {
            return Vec::new();
        }
        if index - ch.next_order >= self.limit {
            debug!(
                "Dropping ordered message beyond window: channel={}, index={}, expected={}",
                channel, index, ch.next_order
            );
            return Vec::new();
        }
        ch.pending.insert(index, payload);

        let mut ready = Vec::new();
        while let Some(payload) = ch.pending.remove(&ch.next_order) {
            ready.push(payload);
            ch.next_order += 1;
        }
        ready
    }

    /// Whether a sequenced message is newer than anything delivered on its channel
    pub fn accept_sequenced(&mut self, channel: u8, order_index: u32, sequence: u32) -> bool {
        let Some(ch) = self.channels.get_mut(channel as usize) else {
            return false;
        };
        if order_index < ch.next_order {
            return false;
        }
        if matches!(ch.highest_sequence, Some(highest) if sequence <= highest) {
            return false;
        }
        ch.highest_sequence = Some(sequence);
        true
    }

    /// Messages held back by a gap across all channels
    pub fn pending(&self) -> usize {
        self.channels.iter().map(|c| c.pending.len()).sum()
    }
}

/// Send-side index counters
#[derive(Debug)]
pub struct OutboundIndices {
    message_index: u32,
    order_index: [u32; ORDER_CHANNELS],
    sequence_index: [u32; ORDER_CHANNELS],
    split_id: i16,
}

impl Default for OutboundIndices {
    fn default() -> Self {
        Self {
            message_index: 0,
            order_index: [0; ORDER_CHANNELS],
            sequence_index: [0; ORDER_CHANNELS],
            split_id: 0,
        }
    }
}

impl OutboundIndices {
    /// Next message index
    pub fn next_message(&mut self) -> u32 {
        let index = self.message_index;
        self.message_index = (self.message_index + 1) & 0x00FF_FFFF;
        index
    }

    /// Next order index on `channel`
    pub fn next_order(&mut self, channel: u8) -> u32 {
        let slot = &mut self.order_index[channel as usize % ORDER_CHANNELS];
        let index = *slot;
        *slot = (*slot + 1) & 0x00FF_FFFF;
        index
    }

    /// Current order index on `channel`, shared by sequenced messages
    pub fn current_order(&self, channel: u8) -> u32 {
        self.order_index[channel as usize % ORDER_CHANNELS]
    }

    /// Next sequence index on `channel`
    pub fn next_sequence(&mut self, channel: u8) -> u32 {
        let slot = &mut self.sequence_index[channel as usize % ORDER_CHANNELS];
        let index = *slot;
        *slot = (*slot + 1) & 0x00FF_FFFF;
        index
    }

    /// Next split id, wrapping within the signed 16-bit range
    pub fn next_split_id(&mut self) -> i16 {
        let id = self.split_id;
        self.split_id = self.split_id.wrapping_add(1);
        id
    }
}
