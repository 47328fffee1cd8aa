//! Graph facade: vertex table, epoch management, reader registry,
//! deferred block reclamation, and the transaction entry points.

mod compaction;
mod iter;
mod table;
mod txn;

pub use iter::EdgeIterator;
pub use txn::Transaction;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::config::{GraphOptions, SyncMode};
use crate::error::{Result, SableError};
use crate::storage::arena::{Arena, NULL_POINTER};
use crate::storage::blocks::{BlockView, EdgeBlock, EdgeLabelBlock, VertexBlock};
use crate::storage::tail::TailLocks;
use crate::types::{
    cmp_timestamp, Label, Order, Timestamp, VertexId, MAX_VERTEX_ID, NO_TRANSACTION,
};
use crate::wal::Wal;
use table::VertexTable;

const READER_SLOT_FREE: Timestamp = -1;

/// Lock-free registry of live read epochs; the minimum registered epoch
/// bounds safe reclamation and compaction.
pub(crate) struct ReaderRegistry {
    slots: Vec<AtomicI64>,
}

impl ReaderRegistry {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicI64::new(READER_SLOT_FREE)).collect(),
        }
    }

    pub(crate) fn register(&self, epoch: Timestamp) -> Result<usize> {
        debug_assert!(epoch >= 0);
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(READER_SLOT_FREE, epoch, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(index);
            }
        }
        Err(SableError::Exhausted("read epoch registry full"))
    }

    pub(crate) fn deregister(&self, index: usize) {
        self.slots[index].store(READER_SLOT_FREE, Ordering::Release);
    }

    pub(crate) fn min_epoch(&self) -> Option<Timestamp> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|&epoch| epoch != READER_SLOT_FREE)
            .min()
    }
}

struct GarbageBlock {
    offset: u64,
    order: Order,
    /// Visible epoch at supersession; the block is freed once no
    /// registered reader holds a snapshot at or below this.
    superseded_at: Timestamp,
}

#[derive(Default)]
struct CommitQueue {
    /// Epochs whose transactions finished but are not yet visible.
    completed: BTreeSet<Timestamp>,
}

pub struct Graph {
    pub(crate) arena: Arena,
    pub(crate) tails: TailLocks,
    pub(crate) table: VertexTable,
    pub(crate) wal: Option<Wal>,
    pub(crate) readers: ReaderRegistry,
    /// Next unallocated vertex id (allocation high-water mark).
    pub(crate) next_vertex_id: AtomicU64,
    /// Local transaction id source for pending-timestamp sentinels.
    pub(crate) next_txn_id: AtomicI64,
    /// Last issued commit epoch.
    write_epoch: AtomicI64,
    /// Upper bound of epochs visible to new snapshots.
    visible_epoch: AtomicI64,
    /// Ids freed by committed recycling deletes, ready for reuse.
    pub(crate) recycled: Mutex<Vec<VertexId>>,
    garbage: Mutex<Vec<GarbageBlock>>,
    commits: Mutex<CommitQueue>,
    commits_cv: Condvar,
}

impl Graph {
    pub fn open(options: GraphOptions) -> Result<Self> {
        if options.max_vertex_id == 0 || options.max_vertex_id > MAX_VERTEX_ID + 1 {
            return Err(SableError::Invalid("max_vertex_id out of range"));
        }
        if options.capacity < 1 << 21 {
            return Err(SableError::Invalid("capacity too small"));
        }
        let arena = Arena::open(options.block_path.as_deref(), options.capacity)?;
        let table = VertexTable::new(options.max_vertex_id)?;
        let (wal, records) = match &options.wal_path {
            Some(path) => {
                let (wal, records) = Wal::open(path, options.sync_mode == SyncMode::Full)?;
                (Some(wal), records)
            }
            None => (None, Vec::new()),
        };

        let graph = Self {
            arena,
            tails: TailLocks::new(),
            table,
            wal,
            readers: ReaderRegistry::new(options.reader_slots),
            next_vertex_id: AtomicU64::new(0),
            next_txn_id: AtomicI64::new(1),
            write_epoch: AtomicI64::new(0),
            visible_epoch: AtomicI64::new(0),
            recycled: Mutex::new(Vec::new()),
            garbage: Mutex::new(Vec::new()),
            commits: Mutex::new(CommitQueue::default()),
            commits_cv: Condvar::new(),
        };

        if !records.is_empty() {
            // Records of independent transactions may appear out of
            // epoch order; conflicting ones are ordered by the block
            // write locks they serialized on.
            let last_epoch = records.iter().map(|r| r.epoch).max().unwrap_or(0);
            for record in &records {
                graph.replay_record(record)?;
            }
            graph.write_epoch.store(last_epoch, Ordering::Release);
            graph.visible_epoch.store(last_epoch, Ordering::Release);
            info!(
                records = records.len(),
                epoch = last_epoch,
                "recovered graph state from wal"
            );
        }
        Ok(graph)
    }

    /// The vertex-id allocation high-water mark: every id below it has
    /// been handed out at some point.
    pub fn get_max_vertex_id(&self) -> VertexId {
        self.next_vertex_id.load(Ordering::Acquire)
    }

    pub fn begin_transaction(&self) -> Result<Transaction<'_>> {
        Transaction::new_write(self)
    }

    pub fn begin_read_only_transaction(&self) -> Result<Transaction<'_>> {
        Transaction::new_read_only(self)
    }

    /// A loader transaction for bulk ingestion: mutations are stamped
    /// as committed at the current epoch immediately, skip conflict
    /// detection and rollback tracking, and write no WAL records.
    /// Intended for exclusive initial load.
    pub fn begin_batch_loader(&self) -> Result<Transaction<'_>> {
        Transaction::new_batch(self)
    }

    pub(crate) fn visible_epoch(&self) -> Timestamp {
        self.visible_epoch.load(Ordering::Acquire)
    }

    /// Issues the next commit epoch.
    pub(crate) fn allocate_write_epoch(&self) -> Timestamp {
        self.write_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raises the id allocation high-water mark past `vertex`; used by
    /// WAL replay, which learns of allocations from the mutations that
    /// reference them.
    pub(crate) fn ensure_allocated(&self, vertex: VertexId) {
        self.next_vertex_id.fetch_max(vertex + 1, Ordering::AcqRel);
    }

    /// Marks `epoch` complete and advances the visible bound across any
    /// contiguous run of completed epochs. Commits therefore become
    /// visible in epoch order regardless of completion order.
    pub(crate) fn publish_commit(&self, epoch: Timestamp, wait_visible: bool) {
        let mut queue = self.commits.lock();
        queue.completed.insert(epoch);
        let mut visible = self.visible_epoch.load(Ordering::Relaxed);
        let mut advanced = false;
        while queue.completed.remove(&(visible + 1)) {
            visible += 1;
            advanced = true;
        }
        if advanced {
            self.visible_epoch.store(visible, Ordering::Release);
            self.commits_cv.notify_all();
        }
        if wait_visible {
            while self.visible_epoch.load(Ordering::Acquire) < epoch {
                self.commits_cv.wait(&mut queue);
            }
        }
    }

    /// Queues a block for reclamation once every reader that could
    /// still reach it has drained.
    pub(crate) fn defer_free(&self, offset: u64, order: Order) {
        let superseded_at = self.visible_epoch();
        self.garbage.lock().push(GarbageBlock {
            offset,
            order,
            superseded_at,
        });
        self.collect_garbage();
    }

    pub(crate) fn collect_garbage(&self) {
        let min_reader = self.readers.min_epoch();
        let mut queue = self.garbage.lock();
        queue.retain(|block| {
            let reclaimable = match min_reader {
                None => true,
                Some(min) => min > block.superseded_at,
            };
            if reclaimable {
                self.arena.free(block.offset, block.order);
            }
            !reclaimable
        });
    }

    // Snapshot-consistent chain resolution. Each walk returns the
    // newest version whose creation time is visible under
    // `(read_epoch_id, local_txn_id)`.

    pub(crate) fn resolve_vertex_block(
        &self,
        head: u64,
        read_epoch_id: Timestamp,
        local_txn_id: Timestamp,
    ) -> Option<VertexBlock<'_>> {
        let mut offset = head;
        while offset != NULL_POINTER {
            let block = VertexBlock::at(&self.arena, offset);
            if cmp_timestamp(block.creation_time(), read_epoch_id, local_txn_id).is_le() {
                return Some(block);
            }
            offset = block.prev_pointer();
        }
        None
    }

    pub(crate) fn resolve_label_block(
        &self,
        head: u64,
        read_epoch_id: Timestamp,
        local_txn_id: Timestamp,
    ) -> Option<EdgeLabelBlock<'_>> {
        let mut offset = head;
        while offset != NULL_POINTER {
            let block = EdgeLabelBlock::at(&self.arena, offset);
            if cmp_timestamp(block.creation_time(), read_epoch_id, local_txn_id).is_le() {
                return Some(block);
            }
            offset = block.prev_pointer();
        }
        None
    }

    pub(crate) fn resolve_edge_block(
        &self,
        head: u64,
        read_epoch_id: Timestamp,
        local_txn_id: Timestamp,
    ) -> Option<EdgeBlock<'_>> {
        let mut offset = head;
        while offset != NULL_POINTER {
            let block = EdgeBlock::at(&self.arena, offset);
            if cmp_timestamp(block.creation_time(), read_epoch_id, local_txn_id).is_le() {
                return Some(block);
            }
            offset = block.prev_pointer();
        }
        None
    }

    /// The edge block holding `(src, label)` under the given snapshot.
    pub(crate) fn locate_edge_block(
        &self,
        src: VertexId,
        label: Label,
        read_epoch_id: Timestamp,
        local_txn_id: Timestamp,
    ) -> Option<EdgeBlock<'_>> {
        if src >= self.table.slots() {
            return None;
        }
        let head = self.table.slot(src).label_head.load(Ordering::Acquire);
        let dir = self.resolve_label_block(head, read_epoch_id, local_txn_id)?;
        let (_, pointer) = dir.find(label)?;
        if pointer == NULL_POINTER {
            return None;
        }
        self.resolve_edge_block(pointer, read_epoch_id, local_txn_id)
    }

    pub(crate) fn read_vertex(
        &self,
        vertex: VertexId,
        read_epoch_id: Timestamp,
        local_txn_id: Timestamp,
    ) -> &[u8] {
        if vertex >= self.table.slots() {
            return &[];
        }
        let slot = self.table.slot(vertex);
        let head = slot.data_head.load(Ordering::Acquire);
        if head == NULL_POINTER {
            return &[];
        }
        if local_txn_id == NO_TRANSACTION {
            // Committed-epoch hints, maintained at commit before the
            // epoch publishes; stale values are impossible for any
            // reader whose snapshot already includes them.
            let created = slot.creation_hint.load(Ordering::Acquire);
            if created != 0 && read_epoch_id < created {
                return &[];
            }
            let deleted = slot.deletion_hint.load(Ordering::Acquire);
            if deleted != 0 && deleted <= read_epoch_id {
                return &[];
            }
        }
        match self.resolve_vertex_block(head, read_epoch_id, local_txn_id) {
            Some(block) if !block.is_tombstone() => block.data(),
            _ => &[],
        }
    }

    pub(crate) fn read_edge(
        &self,
        src: VertexId,
        label: Label,
        dst: VertexId,
        read_epoch_id: Timestamp,
        local_txn_id: Timestamp,
    ) -> &[u8] {
        let Some(block) = self.locate_edge_block(src, label, read_epoch_id, local_txn_id) else {
            return &[];
        };
        let filter = block.bloom();
        if !filter.contains(dst) {
            return &[];
        }
        let (num_entries, data_length) = block.tail(&self.tails);
        // Newest first: with force-inserted duplicates the newest live
        // entry wins.
        let mut cursor = data_length;
        for index in (0..num_entries).rev() {
            let entry = block.entry(index);
            cursor -= entry.length() as u64;
            if entry.dst() == dst
                && crate::types::visible(
                    entry.creation_time(),
                    entry.deletion_time(),
                    read_epoch_id,
                    local_txn_id,
                )
            {
                return self
                    .arena
                    .slice(block.data_offset() + cursor, entry.length() as usize);
            }
        }
        &[]
    }

    pub(crate) fn read_edges(
        &self,
        src: VertexId,
        label: Label,
        reverse: bool,
        read_epoch_id: Timestamp,
        local_txn_id: Timestamp,
    ) -> EdgeIterator<'_> {
        let Some(block) = self.locate_edge_block(src, label, read_epoch_id, local_txn_id) else {
            return EdgeIterator::exhausted();
        };
        let (num_entries, data_length) = block.tail(&self.tails);
        EdgeIterator::new(
            &self.arena,
            block,
            num_entries,
            data_length,
            read_epoch_id,
            local_txn_id,
            reverse,
        )
    }
}
