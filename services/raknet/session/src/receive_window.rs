//! Receive window: reorders inbound datagrams by sequence number.
//!
//! Datagrams are buffered on [`ReceiveWindow::submit`] and released as a
//! contiguous prefix on [`ReceiveWindow::release`], so the frame layer sees
//! them in sequence order regardless of arrival order.

use std::collections::BTreeMap;

/// Outcome of submitting one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// Buffered for release; acknowledge it
    Accepted,
    /// Already released or already buffered; acknowledge it again, do not process
    Duplicate,
    /// Too far beyond the release point; dropped without acknowledgement
    OutOfWindow,
}

/// Per-session reordering buffer
#[derive(Debug)]
pub struct ReceiveWindow<T> {
    expected: u32,
    highest: Option<u32>,
    buffered: BTreeMap<u32, T>,
    limit: u32,
}

impl<T> ReceiveWindow<T> {
    /// Window starting at sequence number 0
    pub fn new(limit: u32) -> Self {
        Self::starting_at(0, limit)
    }

    /// Window whose first expected sequence number is `expected`
    pub fn starting_at(expected: u32, limit: u32) -> Self {
        Self {
            expected,
            highest: None,
            buffered: BTreeMap::new(),
            limit: limit.max(1),
        }
    }

    /// Buffer a datagram under its sequence number
    pub fn submit(&mut self, sequence: u32, item: T) -> Submit {
        if sequence < self.expected || self.buffered.contains_key(&sequence) {
            return Submit::Duplicate;
        }
        if sequence - self.expected >= self.limit {
            return Submit::OutOfWindow;
        }
        self.buffered.insert(sequence, item);
        self.highest = Some(self.highest.map_or(sequence, |h| h.max(sequence)));
        Submit::Accepted
    }

    /// Release every datagram contiguous with the release point, in order
    pub fn release(&mut self) -> Vec<T> {
        let mut released = Vec::new();
        while let Some(item) = self.buffered.remove(&self.expected) {
            released.push(item);
            self.expected += 1;
        }
        released
    }

    /// Sequence numbers between the release point and the highest seen that have not arrived
    pub fn missing(&self) -> Vec<u32> {
        match self.highest {
            Some(highest) if highest >= self.expected => (self.expected..highest)
                .filter(|seq| !self.buffered.contains_key(seq))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Next sequence number to release
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Largest sequence number accepted so far
    pub fn highest(&self) -> Option<u32> {
        self.highest
    }

    /// Number of datagrams waiting on a gap
    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }
}
