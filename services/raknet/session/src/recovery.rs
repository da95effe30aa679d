//! Recovery buffer: sent datagrams kept until the peer acknowledges them.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct RecoveryEntry {
    bytes: Bytes,
    sent_at: Instant,
}

/// Per-session map from outbound sequence number to the exact bytes sent
#[derive(Debug, Default)]
pub struct RecoveryBuffer {
    entries: BTreeMap<u32, RecoveryEntry>,
}

impl RecoveryBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a datagram right after it was written to the socket
    pub fn add(&mut self, sequence: u32, bytes: Bytes, now: Instant) {
        self.entries.insert(sequence, RecoveryEntry { bytes, sent_at: now });
    }

    /// Retire acknowledged datagrams, returning how many were present
    pub fn on_ack(&mut self, sequences: &[u32]) -> usize {
        sequences
            .iter()
            .filter(|seq| self.entries.remove(seq).is_some())
            .count()
    }

    /// Original bytes of every NAKed datagram still held; retired numbers are ignored
    pub fn on_nak(&mut self, sequences: &[u32], now: Instant) -> Vec<Bytes> {
        let mut resend = Vec::new();
        for seq in sequences {
            if let Some(entry) = self.entries.get_mut(seq) {
                entry.sent_at = now;
                resend.push(entry.bytes.clone());
            }
        }
        resend
    }

    /// Datagrams unacknowledged for longer than `timeout`, oldest sequence first
    pub fn take_stale(&mut self, now: Instant, timeout: Duration) -> Vec<Bytes> {
        let mut resend = Vec::new();
        for entry in self.entries.values_mut() {
            if now.saturating_duration_since(entry.sent_at) >= timeout {
                entry.sent_at = now;
                resend.push(entry.bytes.clone());
            }
        }
        resend
    }

    /// Number of unacknowledged datagrams
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every sent datagram has been acknowledged
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all state
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nak_resends_original_bytes() {
        let now = Instant::now();
        let mut recovery = RecoveryBuffer::new();
        let sent = Bytes::from_static(&[0x84, 5, 0, 0, 0x40, 0x00, 0x08, 0xAA]);
        recovery.add(5, sent.clone(), now);

        let resend = recovery.on_nak(&[5], now);
        assert_eq!(resend, vec![sent]);
        assert_eq!(recovery.len(), 1);
    }

    #[test]
    fn test_ack_then_nak_resends_nothing() {
        let now = Instant::now();
        let mut recovery = RecoveryBuffer::new();
        recovery.add(5, Bytes::from_static(b"five"), now);
        recovery.add(6, Bytes::from_static(b"six"), now);

        assert_eq!(recovery.on_ack(&[5, 99]), 1);
        assert!(recovery.on_nak(&[5], now).is_empty());
        assert_eq!(recovery.on_nak(&[5, 6], now), vec![Bytes::from_static(b"six")]);
    }

    #[test]
    fn test_stale_entries() {
        let start = Instant::now();
        let mut recovery = RecoveryBuffer::new();
        recovery.add(1, Bytes::from_static(b"a"), start);
        recovery.add(2, Bytes::from_static(b"b"), start + Duration::from_millis(500));

        let later = start + Duration::from_millis(1000);
        let stale = recovery.take_stale(later, Duration::from_millis(800));
        assert_eq!(stale, vec![Bytes::from_static(b"a")]);

        // Resent entries wait a full timeout again
        assert!(recovery
            .take_stale(later + Duration::from_millis(100), Duration::from_millis(800))
            .is_empty());
    }
}
