//! Sparse mmap-backed vertex table.
//!
//! One 40-byte slot per vertex id over an anonymous mapping sized for
//! the configured maximum; the OS populates pages lazily, so untouched
//! id ranges cost nothing. A slot holds the heads of the two per-vertex
//! version chains, cached creation/deletion epochs for cheap visibility
//! rejects, and the lightweight per-vertex writer lock.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::error::Result;
use crate::types::VertexId;

const SLOT_LEN: usize = 40;

#[repr(C)]
pub struct VertexSlot {
    /// Head of the vertex-data version chain (arena offset, 0 = none).
    pub data_head: AtomicU64,
    /// Head of the edge-label directory chain.
    pub label_head: AtomicU64,
    /// First commit epoch that created the vertex; 0 = unknown.
    pub creation_hint: AtomicI64,
    /// Commit epoch of the newest tombstone; 0 = live or unknown.
    pub deletion_hint: AtomicI64,
    lock: AtomicU32,
    _pad: u32,
}

pub struct VertexTable {
    map: MmapRaw,
    slots: u64,
}

impl VertexTable {
    pub fn new(max_vertex_id: u64) -> Result<Self> {
        let len = (max_vertex_id as usize)
            .checked_mul(SLOT_LEN)
            .ok_or(crate::error::SableError::Invalid("vertex table too large"))?;
        let map: MmapMut = MmapOptions::new().len(len).map_anon()?;
        Ok(Self {
            map: MmapRaw::from(map),
            slots: max_vertex_id,
        })
    }

    pub fn slots(&self) -> u64 {
        self.slots
    }

    pub fn slot(&self, vertex: VertexId) -> &VertexSlot {
        debug_assert!(vertex < self.slots);
        unsafe {
            &*(self
                .map
                .as_mut_ptr()
                .add(vertex as usize * SLOT_LEN) as *const VertexSlot)
        }
    }

    /// Acquires the per-vertex writer lock.
    pub fn guard(&self, vertex: VertexId) -> VertexGuard<'_> {
        let slot = self.slot(vertex);
        let mut spins = 0u32;
        while slot
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        VertexGuard { slot }
    }
}

pub struct VertexGuard<'a> {
    slot: &'a VertexSlot,
}

impl Drop for VertexGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;
    use std::sync::Arc;

    #[test]
    fn slot_layout_is_packed() {
        assert_eq!(size_of::<VertexSlot>(), SLOT_LEN);
    }

    #[test]
    fn fresh_slots_are_zeroed() {
        let table = VertexTable::new(1 << 16).unwrap();
        let slot = table.slot(12345);
        assert_eq!(slot.data_head.load(Ordering::Relaxed), 0);
        assert_eq!(slot.label_head.load(Ordering::Relaxed), 0);
        assert_eq!(slot.creation_hint.load(Ordering::Relaxed), 0);
        assert_eq!(slot.deletion_hint.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn slots_are_independent() {
        let table = VertexTable::new(64).unwrap();
        table.slot(3).data_head.store(111, Ordering::Relaxed);
        table.slot(4).data_head.store(222, Ordering::Relaxed);
        assert_eq!(table.slot(3).data_head.load(Ordering::Relaxed), 111);
        assert_eq!(table.slot(4).data_head.load(Ordering::Relaxed), 222);
    }

    #[test]
    fn guard_serializes_writers() {
        let table = Arc::new(VertexTable::new(8).unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = table.guard(0);
                    let slot = table.slot(0);
                    let v = slot.data_head.load(Ordering::Relaxed);
                    slot.data_head.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.slot(0).data_head.load(Ordering::Relaxed), 4000);
    }
}
