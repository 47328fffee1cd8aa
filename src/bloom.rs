//! Bloom filter over destination vertex ids, resident in the tail
//! bytes of large edge blocks.
//!
//! Word-addressed double-hashing with a forced-odd second hash. The
//! bits live directly in the mapped block, so probes go through atomics:
//! one writer (the vertex-lock holder) races only with readers.

use std::sync::atomic::Ordering;

use crate::storage::arena::Arena;
use crate::types::VertexId;

const NUM_HASHES: u64 = 4;

fn mix(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

fn probe_positions(id: VertexId, num_bits: u64) -> impl Iterator<Item = u64> {
    let h1 = mix(id);
    let h2 = mix(id ^ 0x9e3779b97f4a7c15) | 1; // ensure odd
    (0..NUM_HASHES).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
}

/// A filter view over `len` bytes at `offset`; the invalid filter
/// (small blocks carry none) ignores inserts and reports every lookup
/// as a potential hit.
#[derive(Clone, Copy)]
pub struct BloomFilter<'a> {
    region: Option<(&'a Arena, u64, u64)>,
}

impl<'a> BloomFilter<'a> {
    pub fn new(arena: &'a Arena, offset: u64, len: usize) -> Self {
        debug_assert_eq!(offset % 8, 0);
        debug_assert_eq!(len % 8, 0);
        Self {
            region: Some((arena, offset, len as u64 * 8)),
        }
    }

    pub fn empty() -> Self {
        Self { region: None }
    }

    pub fn valid(&self) -> bool {
        self.region.is_some()
    }

    pub fn clear(&self) {
        if let Some((arena, offset, num_bits)) = self.region {
            for word in 0..num_bits / 64 {
                arena.atomic_u64(offset + word * 8).store(0, Ordering::Relaxed);
            }
        }
    }

    pub fn insert(&self, id: VertexId) {
        if let Some((arena, offset, num_bits)) = self.region {
            for pos in probe_positions(id, num_bits) {
                arena
                    .atomic_u64(offset + (pos / 64) * 8)
                    .fetch_or(1 << (pos % 64), Ordering::Relaxed);
            }
        }
    }

    /// `false` means definitely absent; `true` means possibly present.
    pub fn contains(&self, id: VertexId) -> bool {
        match self.region {
            None => true,
            Some((arena, offset, num_bits)) => probe_positions(id, num_bits).all(|pos| {
                arena.atomic_u64(offset + (pos / 64) * 8).load(Ordering::Relaxed)
                    & (1 << (pos % 64))
                    != 0
            }),
        }
    }
}
