//! Fragmentation of over-MTU messages and reassembly of inbound fragments.

use crate::error::FragmentError;
use bytes::{Bytes, BytesMut};
use raknet_wire::SplitInfo;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Bytes reserved out of the MTU for datagram and frame headers before splitting
pub const SPLIT_OVERHEAD: usize = 60;

/// Slice `payload` into chunks of at most `chunk_size` bytes
pub fn split_payload(payload: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk_size).min(payload.len());
        chunks.push(payload.slice(offset..end));
        offset = end;
    }
    chunks
}

#[derive(Debug)]
struct SplitSet {
    parts: Vec<Option<Bytes>>,
    received: u32,
    created: Instant,
}

impl SplitSet {
    fn new(count: u32, now: Instant) -> Self {
        Self {
            parts: vec![None; count as usize],
            received: 0,
            created: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received as usize == self.parts.len()
    }

    fn concat(self) -> Bytes {
        let len = self.parts.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for part in self.parts.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        out.freeze()
    }
}

/// Collects fragments per split id until every index has arrived
#[derive(Debug)]
pub struct FragmentAssembler {
    sets: HashMap<i16, SplitSet>,
    max_sets: usize,
    max_parts: u32,
    stale_after: Duration,
}

impl FragmentAssembler {
    /// Create an assembler with the given bounds
    pub fn new(max_sets: usize, max_parts: u32, stale_after: Duration) -> Self {
        Self {
            sets: HashMap::new(),
            max_sets: max_sets.max(1),
            max_parts,
            stale_after,
        }
    }

    /// Add one fragment; returns the whole payload once the last one arrives.
    ///
    /// Arrival order is irrelevant. A repeated index is ignored.
    pub fn insert(
        &mut self,
        split: SplitInfo,
        payload: Bytes,
        now: Instant,
    ) -> Result<Option<Bytes>, FragmentError> {
        if split.count == 0 {
            return Err(FragmentError::InvalidCount(split.count));
        }
        if split.count > self.max_parts {
            return Err(FragmentError::TooManyParts(split.count));
        }
        if split.index >= split.count {
            return Err(FragmentError::IndexOutOfRange {
                index: split.index,
                count: split.count,
            });
        }

        if !self.sets.contains_key(&split.id) && self.sets.len() >= self.max_sets {
            self.evict_oldest();
        }

        let set = self
            .sets
            .entry(split.id)
            .or_insert_with(|| SplitSet::new(split.count, now));
        if set.parts.len() != split.count as usize {
            return Err(FragmentError::CountMismatch {
                expected: set.parts.len() as u32,
                got: split.count,
            });
        }

        let slot = &mut set.parts[split.index as usize];
        if slot.is_none() {
            *slot = Some(payload);
            set.received += 1;
        }

        if !set.is_complete() {
            return Ok(None);
        }
        Ok(self.sets.remove(&split.id).map(SplitSet::concat))
    }

    /// Drop incomplete sets older than the stale timeout, returning how many
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let before = self.sets.len();
        let stale_after = self.stale_after;
        self.sets
            .retain(|_, set| now.saturating_duration_since(set.created) < stale_after);
        let evicted = before - self.sets.len();
        if evicted > 0 {
            debug!("Evicted {} stale split sets", evicted);
        }
        evicted
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .sets
            .iter()
            .min_by_key(|(_, set)| set.created)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            debug!("Split table full, evicting split id {}", id);
            self.sets.remove(&id);
        }
    }

    /// Number of incomplete split sets
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether no split set is in progress
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn assembler() -> FragmentAssembler {
        FragmentAssembler::new(4, 128, Duration::from_secs(10))
    }

    fn info(id: i16, index: u32, count: u32) -> SplitInfo {
        SplitInfo { count, id, index }
    }

    #[test]
    fn test_split_sizes() {
        let payload = Bytes::from(vec![7u8; 2500]);
        let chunks = split_payload(&payload, 1000);
        let sizes: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert!(split_payload(&Bytes::new(), 1000).is_empty());
    }

    #[test]
    fn test_reassembly_in_any_order() {
        let payload: Bytes = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        let chunks = split_payload(&payload, 1340);
        let count = chunks.len() as u32;

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let mut order: Vec<u32> = (0..count).collect();
            order.shuffle(&mut rng);

            let mut assembler = assembler();
            let now = Instant::now();
            let mut result = None;
            for (n, &index) in order.iter().enumerate() {
                let out = assembler
                    .insert(info(3, index, count), chunks[index as usize].clone(), now)
                    .unwrap();
                if n + 1 < order.len() {
                    assert!(out.is_none());
                } else {
                    result = out;
                }
            }
            assert_eq!(result, Some(payload.clone()));
            assert!(assembler.is_empty());
        }
    }

    #[test]
    fn test_invalid_fragments() {
        let mut assembler = assembler();
        let now = Instant::now();
        let part = Bytes::from_static(b"x");
        assert_eq!(
            assembler.insert(info(1, 0, 0), part.clone(), now),
            Err(FragmentError::InvalidCount(0))
        );
        assert_eq!(
            assembler.insert(info(1, 3, 3), part.clone(), now),
            Err(FragmentError::IndexOutOfRange { index: 3, count: 3 })
        );
        assert_eq!(
            assembler.insert(info(1, 0, 129), part.clone(), now),
            Err(FragmentError::TooManyParts(129))
        );
        assembler.insert(info(1, 0, 3), part.clone(), now).unwrap();
        assert_eq!(
            assembler.insert(info(1, 1, 4), part, now),
            Err(FragmentError::CountMismatch {
                expected: 3,
                got: 4
            })
        );
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let mut assembler = assembler();
        let now = Instant::now();
        assert!(assembler
            .insert(info(9, 0, 2), Bytes::from_static(b"ab"), now)
            .unwrap()
            .is_none());
        assert!(assembler
            .insert(info(9, 0, 2), Bytes::from_static(b"zz"), now)
            .unwrap()
            .is_none());
        let whole = assembler
            .insert(info(9, 1, 2), Bytes::from_static(b"cd"), now)
            .unwrap();
        assert_eq!(whole, Some(Bytes::from_static(b"abcd")));
    }

    #[test]
    fn test_eviction() {
        let start = Instant::now();
        let mut assembler = assembler();
        for id in 0..4i16 {
            let at = start + Duration::from_secs(id as u64);
            assembler.insert(info(id, 0, 2), Bytes::from_static(b"p"), at).unwrap();
        }
        // Full table evicts the oldest set
        assembler
            .insert(info(10, 0, 2), Bytes::from_static(b"p"), start + Duration::from_secs(5))
            .unwrap();
        assert_eq!(assembler.len(), 4);
        assert!(!assembler.sets.contains_key(&0));

        // Sets created at 1s and 2s are older than 10s at 12.5s
        let evicted = assembler.evict_stale(start + Duration::from_millis(12_500));
        assert_eq!(evicted, 2);
        assert_eq!(assembler.len(), 2);
    }
}
