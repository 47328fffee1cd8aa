//! Block manager: a size-classed allocator over one memory-mapped
//! address region.
//!
//! Blocks are `2^order`-byte regions identified by their byte offset
//! into the mapping. Offsets, not addresses, travel through persisted
//! structures, so a remap after reopen leaves every stored pointer
//! valid. Offset 0 is reserved as the null pointer by allocating a
//! throwaway block at startup.

use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use memmap2::{Advice, MmapMut, MmapOptions, MmapRaw};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::types::Order;

/// The reserved null offset.
pub const NULL_POINTER: u64 = 0;

/// Orders at or above this size class share one locked free list;
/// smaller classes go through per-thread shards.
pub const LARGE_BLOCK_THRESHOLD: Order = 20;

const MAX_ORDER: usize = 64;
const FILE_TRUNC_SIZE: u64 = 1 << 30;
const NULL_HOLDER_ORDER: Order = 12;
const FREE_LIST_SHARDS: usize = 16;

type FreeLists = Vec<Vec<u64>>;

fn empty_free_lists() -> FreeLists {
    vec![Vec::new(); MAX_ORDER]
}

pub struct Arena {
    map: MmapRaw,
    capacity: u64,
    file: Option<File>,
    used: AtomicU64,
    file_size: AtomicU64,
    grow_lock: Mutex<()>,
    small_free: Vec<Mutex<FreeLists>>,
    large_free: Mutex<FreeLists>,
}

impl Arena {
    /// Maps `capacity` bytes of address space, file-backed when a path
    /// is given (truncating any existing content) and anonymous
    /// otherwise, then reserves offset 0.
    pub fn open(path: Option<&Path>, capacity: u64) -> Result<Self> {
        let (map, file, file_size) = match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                let initial = FILE_TRUNC_SIZE.min(capacity);
                file.set_len(initial)?;
                let map = MmapOptions::new().len(capacity as usize).map_raw(&file)?;
                (map, Some(file), initial)
            }
            None => {
                let map: MmapMut = MmapOptions::new().len(capacity as usize).map_anon()?;
                (MmapRaw::from(map), None, capacity)
            }
        };
        map.advise(Advice::Random)?;

        let arena = Self {
            map,
            capacity,
            file,
            used: AtomicU64::new(0),
            file_size: AtomicU64::new(file_size),
            grow_lock: Mutex::new(()),
            small_free: (0..FREE_LIST_SHARDS)
                .map(|_| Mutex::new(empty_free_lists()))
                .collect(),
            large_free: Mutex::new(empty_free_lists()),
        };

        // Claim offset 0 so no live block can alias the null pointer.
        let holder = arena.alloc(NULL_HOLDER_ORDER);
        debug_assert_eq!(holder, NULL_POINTER);
        Ok(arena)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns an aligned `2^order`-byte block offset.
    ///
    /// Address-space exhaustion and backing-file growth failures are
    /// unrecoverable and panic, per the engine's failure contract.
    pub fn alloc(&self, order: Order) -> u64 {
        assert!((order as usize) < MAX_ORDER, "block order out of range");
        let reused = if order < LARGE_BLOCK_THRESHOLD {
            self.shard().lock()[order as usize].pop()
        } else {
            self.large_free.lock()[order as usize].pop()
        };
        if let Some(offset) = reused {
            return offset;
        }

        let block_size = 1u64 << order;
        let offset = self.used.fetch_add(block_size, Ordering::Relaxed);
        let end = offset
            .checked_add(block_size)
            .expect("sable: block offset overflow");
        assert!(
            end <= self.capacity,
            "sable: block arena exhausted ({} bytes)",
            self.capacity
        );
        if end > self.file_size.load(Ordering::Acquire) {
            self.grow(end);
        }
        offset
    }

    /// Returns a block to its size-class free list. No coalescing.
    pub fn free(&self, offset: u64, order: Order) {
        if order < LARGE_BLOCK_THRESHOLD {
            self.shard().lock()[order as usize].push(offset);
        } else {
            self.large_free.lock()[order as usize].push(offset);
        }
    }

    fn grow(&self, needed: u64) {
        let _guard = self.grow_lock.lock();
        let current = self.file_size.load(Ordering::Acquire);
        if needed <= current {
            return;
        }
        let new_size = needed
            .div_ceil(FILE_TRUNC_SIZE)
            .saturating_mul(FILE_TRUNC_SIZE)
            .min(self.capacity);
        if let Some(file) = &self.file {
            file.set_len(new_size)
                .expect("sable: failed to grow block file");
        }
        debug!(new_size, "grew block arena");
        self.file_size.store(new_size, Ordering::Release);
    }

    fn shard(&self) -> &Mutex<FreeLists> {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        &self.small_free[hasher.finish() as usize % FREE_LIST_SHARDS]
    }

    // Raw access. Offsets handed to these must come from `alloc` (plus
    // in-block arithmetic); every caller sits behind the typed block
    // views in `storage::blocks`.

    #[inline]
    pub(crate) fn ptr(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset < self.capacity);
        unsafe { self.map.as_mut_ptr().add(offset as usize) }
    }

    #[inline]
    pub(crate) fn atomic_i64(&self, offset: u64) -> &AtomicI64 {
        debug_assert_eq!(offset % 8, 0);
        unsafe { &*(self.ptr(offset) as *const AtomicI64) }
    }

    #[inline]
    pub(crate) fn atomic_u64(&self, offset: u64) -> &AtomicU64 {
        debug_assert_eq!(offset % 8, 0);
        unsafe { &*(self.ptr(offset) as *const AtomicU64) }
    }

    #[inline]
    pub(crate) fn read_u8(&self, offset: u64) -> u8 {
        unsafe { *self.ptr(offset) }
    }

    #[inline]
    pub(crate) fn write_u8(&self, offset: u64, value: u8) {
        unsafe { *self.ptr(offset) = value }
    }

    #[inline]
    pub(crate) fn read_u16(&self, offset: u64) -> u16 {
        debug_assert_eq!(offset % 2, 0);
        unsafe { *(self.ptr(offset) as *const u16) }
    }

    #[inline]
    pub(crate) fn write_u16(&self, offset: u64, value: u16) {
        debug_assert_eq!(offset % 2, 0);
        unsafe { *(self.ptr(offset) as *mut u16) = value }
    }

    #[inline]
    pub(crate) fn read_u32(&self, offset: u64) -> u32 {
        debug_assert_eq!(offset % 4, 0);
        unsafe { *(self.ptr(offset) as *const u32) }
    }

    #[inline]
    pub(crate) fn write_u32(&self, offset: u64, value: u32) {
        debug_assert_eq!(offset % 4, 0);
        unsafe { *(self.ptr(offset) as *mut u32) = value }
    }

    #[inline]
    pub(crate) fn read_u64(&self, offset: u64) -> u64 {
        debug_assert_eq!(offset % 8, 0);
        unsafe { *(self.ptr(offset) as *const u64) }
    }

    #[inline]
    pub(crate) fn write_u64(&self, offset: u64, value: u64) {
        debug_assert_eq!(offset % 8, 0);
        unsafe { *(self.ptr(offset) as *mut u64) = value }
    }

    #[inline]
    pub(crate) fn slice(&self, offset: u64, len: usize) -> &[u8] {
        debug_assert!(offset + len as u64 <= self.capacity);
        unsafe { std::slice::from_raw_parts(self.ptr(offset), len) }
    }

    #[inline]
    pub(crate) fn write_bytes(&self, offset: u64, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() as u64 <= self.capacity);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr(offset), bytes.len());
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.file.is_some() {
            let _ = self.map.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        Arena::open(None, 1 << 24).unwrap()
    }

    #[test]
    fn null_offset_is_reserved() {
        let a = arena();
        assert_ne!(a.alloc(6), NULL_POINTER);
    }

    #[test]
    fn blocks_are_aligned_and_disjoint() {
        let a = arena();
        let x = a.alloc(8);
        let y = a.alloc(8);
        assert_eq!(x % 256, 0);
        assert_eq!(y % 256, 0);
        assert_ne!(x, y);
    }

    #[test]
    fn free_list_reuses_last_freed() {
        let a = arena();
        let x = a.alloc(12);
        a.free(x, 12);
        assert_eq!(a.alloc(12), x);
    }

    #[test]
    fn distinct_orders_do_not_share_lists() {
        let a = arena();
        let x = a.alloc(7);
        a.free(x, 7);
        let y = a.alloc(8);
        assert_ne!(x, y);
        assert_eq!(a.alloc(7), x);
    }

    #[test]
    fn scalar_roundtrips() {
        let a = arena();
        let b = a.alloc(6);
        a.write_u16(b, 0xBEEF);
        a.write_u64(b + 8, u64::MAX - 5);
        assert_eq!(a.read_u16(b), 0xBEEF);
        assert_eq!(a.read_u64(b + 8), u64::MAX - 5);
        a.write_bytes(b + 16, b"abc");
        assert_eq!(a.slice(b + 16, 3), b"abc");
    }

    #[test]
    fn file_backed_arena_persists_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        let a = Arena::open(Some(&path), 1 << 24).unwrap();
        let b = a.alloc(6);
        a.write_bytes(b, b"persist me");
        drop(a);
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() >= 1 << 20);
    }
}
