//! Compaction: collapses version chains and rewrites edge blocks to
//! drop entries no live snapshot can still observe.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::graph::Graph;
use crate::storage::arena::NULL_POINTER;
use crate::storage::blocks::{header_order, BlockView, EdgeBlock, EdgeLabelBlock, VertexBlock};
use crate::types::{Timestamp, TIMESTAMP_MAX};

impl Graph {
    /// Reclaims versions obsolete at `read_epoch_id`. Passing a
    /// negative epoch selects the minimal live reader epoch (or the
    /// current visible epoch when no readers are registered). Returns
    /// the epoch actually used.
    ///
    /// A version chain collapses to its newest version committed at or
    /// before the safe epoch: every reader's snapshot is at least the
    /// safe epoch, so nothing below that version can be resolved again.
    /// Reclaimed blocks pass through the deferred garbage queue and
    /// return to the allocator once in-flight readers drain.
    pub fn compact(&self, read_epoch_id: Timestamp) -> Timestamp {
        let visible = self.visible_epoch();
        let safe = if read_epoch_id < 0 {
            self.readers.min_epoch().unwrap_or(visible)
        } else {
            read_epoch_id.min(visible)
        };

        let mut freed_blocks = 0u64;
        let mut rewritten_blocks = 0u64;
        for vertex in 0..self.next_vertex_id.load(Ordering::Acquire) {
            let _guard = self.table.guard(vertex);
            let slot = self.table.slot(vertex);

            freed_blocks +=
                self.collapse_chain(slot.data_head.load(Ordering::Acquire), safe);
            freed_blocks +=
                self.collapse_chain(slot.label_head.load(Ordering::Acquire), safe);

            let dir_head = slot.label_head.load(Ordering::Acquire);
            if dir_head == NULL_POINTER {
                continue;
            }
            let dir = EdgeLabelBlock::at(&self.arena, dir_head);
            // Entry rewriting must go through the unique authoritative
            // directory: with the head pending or newer than the safe
            // epoch, older directory versions still serve readers and
            // would keep stale pointers to a replaced block.
            let dir_is_sole = (0..=safe).contains(&dir.creation_time());
            for index in 0..dir.num_entries() {
                let pointer = dir.pointer_at(index);
                if pointer == NULL_POINTER {
                    continue;
                }
                freed_blocks += self.collapse_chain(pointer, safe);
                if dir_is_sole && self.rewrite_edge_block(&dir, index, pointer, safe) {
                    rewritten_blocks += 1;
                    freed_blocks += 1;
                }
            }
        }
        self.collect_garbage();
        debug!(safe, freed_blocks, rewritten_blocks, "compaction pass finished");
        safe
    }

    /// Frees everything below the newest chain version committed at or
    /// before `safe`. Returns the number of blocks reclaimed.
    fn collapse_chain(&self, head: u64, safe: Timestamp) -> u64 {
        let mut offset = head;
        // Find the retained version: the first (newest) block whose
        // creation epoch is committed and within the safe bound.
        loop {
            if offset == NULL_POINTER {
                return 0;
            }
            let block = VertexBlock::at(&self.arena, offset);
            let creation = block.creation_time();
            if (0..=safe).contains(&creation) {
                break;
            }
            offset = block.prev_pointer();
        }
        // Only the N2O fields are touched, so one view works for every
        // versioned block kind.
        let kept = VertexBlock::at(&self.arena, offset);
        let mut victim = kept.prev_pointer();
        if victim == NULL_POINTER {
            return 0;
        }
        kept.set_prev_pointer(NULL_POINTER);
        let mut freed = 0;
        while victim != NULL_POINTER {
            let next = VertexBlock::at(&self.arena, victim).prev_pointer();
            self.defer_free(victim, header_order(&self.arena, victim));
            freed += 1;
            victim = next;
        }
        freed
    }

    /// Rewrites the directory-pointed edge block when entries dead at
    /// `safe` can be dropped, installing a right-sized replacement.
    fn rewrite_edge_block(
        &self,
        dir: &EdgeLabelBlock<'_>,
        index: u64,
        pointer: u64,
        safe: Timestamp,
    ) -> bool {
        let old = EdgeBlock::at(&self.arena, pointer);
        let creation = old.creation_time();
        if !(0..=safe).contains(&creation) {
            // Pending or newer than the horizon; a later pass gets it.
            return false;
        }
        if old.committed_time() < 0 {
            // An in-flight transaction holds the block write lock; its
            // pending entries must stay where commit will rewrite them.
            return false;
        }
        let (num_entries, _) = old.tail_unsync();
        let mut live = Vec::new();
        let mut live_data = 0u64;
        let mut cursor = 0u64;
        for entry_index in 0..num_entries {
            let entry = old.entry(entry_index);
            let length = entry.length() as u64;
            let deletion = entry.deletion_time();
            // A pending creation stamp in an unlocked block belongs to
            // an aborted transaction and is dropped with the dead
            // entries.
            let needed = deletion == TIMESTAMP_MAX || deletion < 0 || deletion > safe;
            if needed && entry.creation_time() >= 0 {
                live.push((entry_index, cursor, length));
                live_data += length;
            }
            cursor += length;
        }
        if live.len() as u64 == num_entries {
            return false;
        }

        let order = EdgeBlock::order_for(live.len() as u64, live_data, 6);
        let offset = self.arena.alloc(order);
        let block = EdgeBlock::at(&self.arena, offset);
        block.fill(
            order,
            old.vertex_id(),
            creation,
            old.prev_pointer(),
            old.committed_time(),
        );
        let mut data_cursor = 0u64;
        for (new_index, &(old_index, old_pos, length)) in live.iter().enumerate() {
            let entry = old.entry(old_index);
            let payload = self
                .arena
                .slice(old.data_offset() + old_pos, length as usize);
            block.write_entry(
                new_index as u64,
                entry.dst(),
                payload,
                data_cursor,
                entry.creation_time(),
                entry.deletion_time(),
            );
            data_cursor += length;
        }
        block.set_tail_unsync(live.len() as u64, live_data);
        dir.set_pointer(index, offset);
        self.defer_free(pointer, old.order());
        true
    }
}
