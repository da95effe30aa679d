//! Priority send queues and datagram packing.

use raknet_wire::{Frame, DATAGRAM_HEADER_SIZE};
use std::collections::VecDeque;

/// Send priority of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Sent synchronously in its own datagram
    Immediate,
    /// Flushed every tick
    High,
    /// Flushed every 2nd tick
    Medium,
    /// Flushed every 4th tick
    Low,
}

impl Priority {
    /// Tick period of a queued priority; `None` for Immediate
    pub fn period(self) -> Option<u64> {
        match self {
            Priority::Immediate => None,
            Priority::High => Some(1),
            Priority::Medium => Some(2),
            Priority::Low => Some(4),
        }
    }
}

/// The three scheduled FIFO queues of one session
#[derive(Debug, Default)]
pub struct SendQueues {
    high: VecDeque<Frame>,
    medium: VecDeque<Frame>,
    low: VecDeque<Frame>,
}

impl SendQueues {
    /// Create empty queues
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_mut(&mut self, priority: Priority) -> Option<&mut VecDeque<Frame>> {
        match priority {
            Priority::Immediate => None,
            Priority::High => Some(&mut self.high),
            Priority::Medium => Some(&mut self.medium),
            Priority::Low => Some(&mut self.low),
        }
    }

    /// Append frames to a scheduled queue; returns them back for Immediate
    pub fn push(&mut self, priority: Priority, frames: Vec<Frame>) -> Option<Vec<Frame>> {
        match self.queue_mut(priority) {
            Some(queue) => {
                queue.extend(frames);
                None
            }
            None => Some(frames),
        }
    }

    /// Pop every frame of the queues due on `tick`, highest priority first
    pub fn drain_due(&mut self, tick: u64) -> Vec<Frame> {
        let mut out = Vec::new();
        for priority in [Priority::High, Priority::Medium, Priority::Low] {
            let due = priority.period().is_some_and(|period| tick % period == 0);
            if let (true, Some(queue)) = (due, self.queue_mut(priority)) {
                out.extend(queue.drain(..));
            }
        }
        out
    }

    /// Pop everything regardless of schedule
    pub fn drain_all(&mut self) -> Vec<Frame> {
        let mut out: Vec<Frame> = self.high.drain(..).collect();
        out.extend(self.medium.drain(..));
        out.extend(self.low.drain(..));
        out
    }

    /// Frames waiting across all queues
    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    /// Whether all queues are empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Group frames into datagram-sized batches in order.
///
/// A batch is sealed when the next frame would push the encoded datagram past
/// `budget` bytes; a frame larger than the budget on its own gets its own batch.
pub fn pack(frames: Vec<Frame>, budget: usize) -> Vec<Vec<Frame>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = DATAGRAM_HEADER_SIZE;

    for frame in frames {
        let frame_size = frame.encoded_size();
        if !current.is_empty() && size + frame_size > budget {
            batches.push(std::mem::take(&mut current));
            size = DATAGRAM_HEADER_SIZE;
        }
        size += frame_size;
        current.push(frame);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use raknet_wire::Reliability;

    fn frame(len: usize) -> Frame {
        Frame::new(Reliability::Unreliable, Bytes::from(vec![1u8; len]))
    }

    #[test]
    fn test_schedule() {
        let mut queues = SendQueues::new();
        let mut drained = Vec::new();
        for tick in 1..=4u64 {
            queues.push(Priority::High, vec![frame(1)]);
            queues.push(Priority::Medium, vec![frame(2)]);
            queues.push(Priority::Low, vec![frame(3)]);
            drained.push(queues.drain_due(tick).len());
        }
        // tick 1: high; tick 2: high + 2 medium; tick 3: high; tick 4: high + 2 medium + 4 low
        assert_eq!(drained, vec![1, 3, 1, 7]);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_immediate_is_not_queued() {
        let mut queues = SendQueues::new();
        let back = queues.push(Priority::Immediate, vec![frame(4)]);
        assert_eq!(back.map(|f| f.len()), Some(1));
        assert!(queues.is_empty());
    }

    #[test]
    fn test_pack_respects_budget() {
        // Each frame encodes to 3 + 97 = 100 bytes
        let frames: Vec<Frame> = (0..10).map(|_| frame(97)).collect();
        let batches = pack(frames, 4 + 300);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_pack_oversized_frame_alone() {
        let batches = pack(vec![frame(10), frame(500), frame(10)], 200);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
    }
}
