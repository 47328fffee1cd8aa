//! Snapshot-consistent iteration over one edge block.

use crate::storage::arena::Arena;
use crate::storage::blocks::{BlockView, EdgeBlock, EdgeEntry, EDGE_ENTRY_LEN, EDGE_HEADER_LEN};
use crate::types::{visible, Timestamp, VertexId, VERTEX_TOMBSTONE};

/// Iterator over the live edges of a `(src, label)` block under a fixed
/// snapshot. Forward iteration yields insertion order (oldest first),
/// reverse yields newest first. A parallel byte cursor tracks the
/// current entry's payload so `edge_data` is O(1).
pub struct EdgeIterator<'a> {
    arena: Option<&'a Arena>,
    entries_end: u64,
    data_base: u64,
    num_entries: u64,
    read_epoch_id: Timestamp,
    local_txn_id: Timestamp,
    reverse: bool,
    /// Insertion index of the current entry; -1 = exhausted (reverse).
    index: i64,
    /// Payload offset of the current entry within the data region.
    data_cursor: u64,
}

impl<'a> EdgeIterator<'a> {
    pub(crate) fn new(
        arena: &'a Arena,
        block: EdgeBlock<'a>,
        num_entries: u64,
        data_length: u64,
        read_epoch_id: Timestamp,
        local_txn_id: Timestamp,
        reverse: bool,
    ) -> Self {
        let mut iter = Self {
            arena: Some(arena),
            entries_end: block.entries_end(),
            data_base: block.offset() + EDGE_HEADER_LEN,
            num_entries,
            read_epoch_id,
            local_txn_id,
            reverse,
            index: 0,
            data_cursor: 0,
        };
        if reverse {
            iter.index = num_entries as i64 - 1;
            if iter.index >= 0 {
                iter.data_cursor = data_length - iter.entry_at(iter.index).length() as u64;
            }
        }
        iter.settle();
        iter
    }

    pub(crate) fn exhausted() -> Self {
        Self {
            arena: None,
            entries_end: 0,
            data_base: 0,
            num_entries: 0,
            read_epoch_id: 0,
            local_txn_id: 0,
            reverse: false,
            index: 0,
            data_cursor: 0,
        }
    }

    fn entry_at(&self, index: i64) -> EdgeEntry<'a> {
        let arena = self.arena.expect("entry access on exhausted iterator");
        EdgeEntry::at(arena, self.entries_end - (index as u64 + 1) * EDGE_ENTRY_LEN)
    }

    fn in_range(&self) -> bool {
        self.arena.is_some() && self.index >= 0 && (self.index as u64) < self.num_entries
    }

    fn current_visible(&self) -> bool {
        let entry = self.entry_at(self.index);
        visible(
            entry.creation_time(),
            entry.deletion_time(),
            self.read_epoch_id,
            self.local_txn_id,
        )
    }

    fn advance_raw(&mut self) {
        if !self.reverse {
            self.data_cursor += self.entry_at(self.index).length() as u64;
            self.index += 1;
        } else {
            self.index -= 1;
            if self.index >= 0 {
                self.data_cursor -= self.entry_at(self.index).length() as u64;
            }
        }
    }

    fn settle(&mut self) {
        while self.in_range() && !self.current_visible() {
            self.advance_raw();
        }
    }

    pub fn valid(&self) -> bool {
        self.in_range()
    }

    /// Advances to the next visible entry in iteration order.
    pub fn next(&mut self) {
        if self.in_range() {
            self.advance_raw();
            self.settle();
        }
    }

    /// Destination of the current edge, or the tombstone sentinel once
    /// exhausted.
    pub fn dst_id(&self) -> VertexId {
        if self.in_range() {
            self.entry_at(self.index).dst()
        } else {
            VERTEX_TOMBSTONE
        }
    }

    /// Payload of the current edge; empty once exhausted.
    pub fn edge_data(&self) -> &'a [u8] {
        if self.in_range() {
            let length = self.entry_at(self.index).length() as usize;
            self.arena
                .expect("in-range iterator has an arena")
                .slice(self.data_base + self.data_cursor, length)
        } else {
            &[]
        }
    }
}
