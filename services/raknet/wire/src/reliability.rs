//! Reliability kinds carried in the encapsulated message header.

/// Delivery guarantees for one encapsulated message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reliability {
    /// Fire and forget
    #[default]
    Unreliable = 0,
    /// Stale arrivals are discarded
    UnreliableSequenced = 1,
    /// Delivered at least once
    Reliable = 2,
    /// Delivered at least once, in order within its channel
    ReliableOrdered = 3,
    /// Delivered at least once, stale arrivals discarded
    ReliableSequenced = 4,
    /// Unreliable with a delivery receipt
    UnreliableWithAck = 5,
    /// Reliable with a delivery receipt
    ReliableWithAck = 6,
    /// Reliable ordered with a delivery receipt
    ReliableOrderedWithAck = 7,
}

impl Reliability {
    /// Whether the message carries a message index
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Reliability::Reliable
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableWithAck
                | Reliability::ReliableOrderedWithAck
        )
    }

    /// Whether the message carries a sequence index
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced | Reliability::ReliableSequenced
        )
    }

    /// Whether the message carries an order index and channel
    pub fn is_sequenced_or_ordered(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableOrderedWithAck
        )
    }

    /// Number of header bytes the optional index fields occupy
    pub fn index_fields_size(self) -> usize {
        let mut size = 0;
        if self.is_reliable() {
            size += 3;
        }
        if self.is_sequenced() {
            size += 3;
        }
        if self.is_sequenced_or_ordered() {
            size += 4;
        }
        size
    }

    /// All kinds in wire order
    pub const ALL: [Reliability; 8] = [
        Reliability::Unreliable,
        Reliability::UnreliableSequenced,
        Reliability::Reliable,
        Reliability::ReliableOrdered,
        Reliability::ReliableSequenced,
        Reliability::UnreliableWithAck,
        Reliability::ReliableWithAck,
        Reliability::ReliableOrderedWithAck,
    ];
}

impl From<u8> for Reliability {
    /// Only the low three bits are significant
    fn from(value: u8) -> Self {
        Self::ALL[(value & 0x07) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_table() {
        use Reliability::*;
        let expected = [
            (Unreliable, false, false, false),
            (UnreliableSequenced, false, true, true),
            (Reliable, true, false, false),
            (ReliableOrdered, true, false, true),
            (ReliableSequenced, true, true, true),
            (UnreliableWithAck, false, false, false),
            (ReliableWithAck, true, false, false),
            (ReliableOrderedWithAck, true, false, true),
        ];
        for (kind, reliable, sequenced, ordered) in expected {
            assert_eq!(kind.is_reliable(), reliable, "{:?}", kind);
            assert_eq!(kind.is_sequenced(), sequenced, "{:?}", kind);
            assert_eq!(kind.is_sequenced_or_ordered(), ordered, "{:?}", kind);
        }
    }

    #[test]
    fn test_from_bits() {
        for kind in Reliability::ALL {
            assert_eq!(Reliability::from(kind as u8), kind);
        }
        assert_eq!(Reliability::from(0xFC), Reliability::ReliableSequenced);
        assert_eq!(Reliability::ReliableSequenced.index_fields_size(), 10);
    }
}
