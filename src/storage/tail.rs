//! Striped sequence locks for the edge-block size pair.
//!
//! The `(num_entries, data_length)` tail of an edge block must be read
//! and written as one 16-byte unit. Instead of a 128-bit atomic, each
//! block hashes to a stripe whose version word goes odd around the two
//! 64-bit stores; readers retry until they observe a stable even
//! version. Writers to one block are already serialized by the owning
//! vertex lock, so the odd window is never contended on the write side.

use std::sync::atomic::{fence, AtomicU64, Ordering};

const STRIPES: usize = 1024;

pub struct TailLocks {
    stripes: Vec<AtomicU64>,
}

impl TailLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn stripe(&self, block_offset: u64) -> &AtomicU64 {
        // Blocks are at least 64-byte aligned.
        &self.stripes[((block_offset >> 6) as usize) & (STRIPES - 1)]
    }

    /// Reads a consistent snapshot of the pair produced by `load`.
    pub fn read<F>(&self, block_offset: u64, load: F) -> (u64, u64)
    where
        F: Fn() -> (u64, u64),
    {
        let stripe = self.stripe(block_offset);
        loop {
            let before = stripe.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let value = load();
            fence(Ordering::Acquire);
            if stripe.load(Ordering::Relaxed) == before {
                return value;
            }
        }
    }

    /// Runs `store` (the two halves of the pair) inside an odd window.
    pub fn write<F>(&self, block_offset: u64, store: F)
    where
        F: FnOnce(),
    {
        let stripe = self.stripe(block_offset);
        let before = stripe.load(Ordering::Relaxed);
        stripe.store(before.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        store();
        stripe.store(before.wrapping_add(2), Ordering::Release);
    }
}

impl Default for TailLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn read_sees_pair_from_single_writer() {
        let locks = Arc::new(TailLocks::new());
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));

        let writer = {
            let (locks, a, b) = (locks.clone(), a.clone(), b.clone());
            std::thread::spawn(move || {
                for i in 1..=10_000u64 {
                    locks.write(0, || {
                        a.store(i, Ordering::Relaxed);
                        b.store(i * 2, Ordering::Relaxed);
                    });
                }
            })
        };

        for _ in 0..10_000 {
            let (x, y) = locks.read(0, || {
                (a.load(Ordering::Relaxed), b.load(Ordering::Relaxed))
            });
            assert_eq!(y, x * 2, "torn pair observed: ({x}, {y})");
        }
        writer.join().unwrap();
    }
}
