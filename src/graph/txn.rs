//! Transactions: snapshot reads, conflict-checked writes, commit and
//! rollback.
//!
//! Uncommitted writes stamp timestamp fields with the negated local
//! transaction id. Commit allocates the next epoch, appends one WAL
//! record, rewrites every pending stamp to the epoch, then publishes by
//! advancing the visible-epoch bound in epoch order. Abort restores the
//! recorded chain heads, re-surfaces entries it marked deleted and
//! returns its blocks and vertex ids.
//!
//! Writers to one vertex serialize on the per-vertex lock; writers to
//! one `(src, label)` edge block additionally hold its `committed_time`
//! field as a transactional write lock (a pending stamp there means the
//! block has in-flight entries, so a second writer must roll back
//! rather than migrate entries it cannot see).

use std::sync::atomic::Ordering;

use crate::error::{Result, SableError};
use crate::graph::iter::EdgeIterator;
use crate::graph::table::VertexSlot;
use crate::graph::Graph;
use crate::storage::arena::NULL_POINTER;
use crate::storage::blocks::{
    BlockView, EdgeBlock, EdgeLabelBlock, VertexBlock, EDGE_LABEL_ENTRY_LEN, EDGE_LABEL_HEADER_LEN,
};
use crate::types::{Label, Order, Timestamp, VertexId, MAX_VERTEX_ID, NO_TRANSACTION, TIMESTAMP_MAX};
use crate::wal::{WalOp, WalRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnMode {
    ReadOnly,
    Write,
    Batch,
}

enum HeadUndo {
    Data { vertex: VertexId, old_head: u64 },
    LabelDir { vertex: VertexId, old_head: u64 },
}

enum DirUndo {
    Replaced {
        dir: u64,
        index: u64,
        old_pointer: u64,
    },
    Appended {
        dir: u64,
        index: u64,
    },
}

enum Touch {
    Put,
    Delete,
}

/// Everything needed to undo an in-flight write transaction, plus the
/// pending-stamp locations its commit must rewrite.
#[derive(Default)]
struct UndoLog {
    heads: Vec<HeadUndo>,
    dirs: Vec<DirUndo>,
    /// deletion_time fields stamped pending; abort restores "live".
    deletion_marks: Vec<u64>,
    /// committed_time write locks; abort restores the previous value.
    committed_locks: Vec<(u64, Timestamp)>,
    /// Every i64 field holding this transaction's pending sentinel.
    stamps: Vec<u64>,
    allocations: Vec<(u64, Order)>,
    fresh_ids: Vec<VertexId>,
    taken_recycled: Vec<VertexId>,
    recycle_on_commit: Vec<VertexId>,
    touched: Vec<(VertexId, Touch)>,
}

/// Applies mutations for interactive writes, the batch loader and WAL
/// replay. Interactive transactions stamp fields with a negative
/// pending sentinel and collect undo state; the loader and replay stamp
/// committed epochs directly and carry no undo log.
pub(crate) struct Mutator<'g> {
    graph: &'g Graph,
    stamp: Timestamp,
    read_epoch_id: Timestamp,
    local_txn_id: Timestamp,
    undo: Option<UndoLog>,
}

impl<'g> Mutator<'g> {
    fn check_vertex_allocated(&self, vertex: VertexId) -> Result<()> {
        if vertex >= self.graph.table.slots() {
            return Err(SableError::Rollback("vertex id out of range"));
        }
        if vertex >= self.graph.next_vertex_id.load(Ordering::Acquire) {
            return Err(SableError::Rollback("vertex not allocated"));
        }
        Ok(())
    }

    /// Rejects a head version stamped pending by another transaction.
    fn check_conflict(&self, creation: Timestamp) -> Result<()> {
        if creation < 0 && -creation != self.local_txn_id {
            return Err(SableError::Rollback("conflicting uncommitted write"));
        }
        Ok(())
    }

    fn put_vertex(&mut self, vertex: VertexId, data: &[u8]) -> Result<()> {
        self.check_vertex_allocated(vertex)?;
        let graph = self.graph;
        let _guard = graph.table.guard(vertex);
        let slot = graph.table.slot(vertex);
        let head = slot.data_head.load(Ordering::Acquire);
        if head != NULL_POINTER {
            self.check_conflict(VertexBlock::at(&graph.arena, head).creation_time())?;
        }

        let order = VertexBlock::order_for(data.len());
        let offset = graph.arena.alloc(order);
        let block = VertexBlock::at(&graph.arena, offset);
        block.fill(order, vertex, self.stamp, head, Some(data));
        match &mut self.undo {
            Some(undo) => {
                undo.stamps.push(block.creation_time_offset());
                undo.allocations.push((offset, order));
                undo.heads.push(HeadUndo::Data {
                    vertex,
                    old_head: head,
                });
                undo.touched.push((vertex, Touch::Put));
            }
            None => {
                let _ = slot.creation_hint.compare_exchange(
                    0,
                    self.stamp,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                slot.deletion_hint.store(0, Ordering::Release);
            }
        }
        slot.data_head.store(offset, Ordering::Release);
        Ok(())
    }

    fn del_vertex(&mut self, vertex: VertexId, recycle: bool) -> Result<bool> {
        self.check_vertex_allocated(vertex)?;
        let graph = self.graph;
        let _guard = graph.table.guard(vertex);
        let slot = graph.table.slot(vertex);
        let head = slot.data_head.load(Ordering::Acquire);
        if head != NULL_POINTER {
            self.check_conflict(VertexBlock::at(&graph.arena, head).creation_time())?;
        }
        let was_alive = graph
            .resolve_vertex_block(head, self.read_epoch_id, self.local_txn_id)
            .map(|block| !block.is_tombstone())
            .unwrap_or(false);

        let order = VertexBlock::order_for(0);
        let offset = graph.arena.alloc(order);
        let block = VertexBlock::at(&graph.arena, offset);
        block.fill(order, vertex, self.stamp, head, None);
        match &mut self.undo {
            Some(undo) => {
                undo.stamps.push(block.creation_time_offset());
                undo.allocations.push((offset, order));
                undo.heads.push(HeadUndo::Data {
                    vertex,
                    old_head: head,
                });
                undo.touched.push((vertex, Touch::Delete));
                if recycle {
                    undo.recycle_on_commit.push(vertex);
                }
            }
            None => {
                slot.deletion_hint.store(self.stamp, Ordering::Release);
                if recycle {
                    graph.recycled.lock().push(vertex);
                }
            }
        }
        slot.data_head.store(offset, Ordering::Release);
        Ok(was_alive)
    }

    fn put_edge(
        &mut self,
        src: VertexId,
        label: Label,
        dst: VertexId,
        data: &[u8],
        force_insert: bool,
    ) -> Result<()> {
        if data.len() > u16::MAX as usize {
            return Err(SableError::Invalid("edge payload too large"));
        }
        if dst > MAX_VERTEX_ID {
            return Err(SableError::Invalid("destination id out of range"));
        }
        self.check_vertex_allocated(src)?;
        let graph = self.graph;
        let _guard = graph.table.guard(src);
        let slot = graph.table.slot(src);

        let dir = self.writer_directory(src, slot)?;
        match dir.find(label) {
            None => {
                let block_offset = self.fresh_edge_block(src, dst, data)?;
                self.directory_insert(src, slot, dir, label, block_offset)?;
            }
            Some((index, pointer)) if pointer == NULL_POINTER => {
                // Entry left behind by an aborted insert; give it a block.
                let block_offset = self.fresh_edge_block(src, dst, data)?;
                if let Some(undo) = &mut self.undo {
                    undo.dirs.push(DirUndo::Replaced {
                        dir: dir.offset(),
                        index,
                        old_pointer: NULL_POINTER,
                    });
                }
                dir.set_pointer(index, block_offset);
            }
            Some((index, pointer)) => {
                let block = EdgeBlock::at(&graph.arena, pointer);
                self.check_conflict(block.creation_time())?;
                self.acquire_edge_block(block)?;
                if !force_insert {
                    self.mark_existing_deleted(block, dst);
                }
                let appended =
                    block.append(&graph.tails, dst, data, self.stamp, TIMESTAMP_MAX);
                match appended {
                    Some(entry) => {
                        if let Some(undo) = &mut self.undo {
                            undo.stamps.push(entry.creation_time_offset());
                        }
                    }
                    None => {
                        let new_offset = self.migrate_edge_block(src, block, dst, data)?;
                        if let Some(undo) = &mut self.undo {
                            undo.dirs.push(DirUndo::Replaced {
                                dir: dir.offset(),
                                index,
                                old_pointer: pointer,
                            });
                        }
                        dir.set_pointer(index, new_offset);
                    }
                }
            }
        }
        Ok(())
    }

    fn del_edge(&mut self, src: VertexId, label: Label, dst: VertexId) -> Result<bool> {
        self.check_vertex_allocated(src)?;
        let graph = self.graph;
        let _guard = graph.table.guard(src);
        let slot = graph.table.slot(src);
        let head = slot.label_head.load(Ordering::Acquire);
        if head == NULL_POINTER {
            return Ok(false);
        }
        let dir = EdgeLabelBlock::at(&graph.arena, head);
        self.check_conflict(dir.creation_time())?;
        let Some((_, pointer)) = dir.find(label) else {
            return Ok(false);
        };
        if pointer == NULL_POINTER {
            return Ok(false);
        }
        let block = EdgeBlock::at(&graph.arena, pointer);
        self.check_conflict(block.creation_time())?;
        self.acquire_edge_block(block)?;

        let (num_entries, _) = block.tail_unsync();
        for index in (0..num_entries).rev() {
            let entry = block.entry(index);
            if entry.dst() != dst || self.is_aborted_garbage(entry.creation_time()) {
                continue;
            }
            if entry.deletion_time() == TIMESTAMP_MAX {
                entry.set_deletion_time(self.stamp);
                if let Some(undo) = &mut self.undo {
                    undo.deletion_marks.push(entry.deletion_time_offset());
                    undo.stamps.push(entry.deletion_time_offset());
                }
                return Ok(true);
            }
            // Older entries with this destination are prior versions.
            break;
        }
        Ok(false)
    }

    /// The directory block writers operate on, created on first use.
    fn writer_directory(&mut self, src: VertexId, slot: &VertexSlot) -> Result<EdgeLabelBlock<'g>> {
        let graph = self.graph;
        let head = slot.label_head.load(Ordering::Acquire);
        if head != NULL_POINTER {
            let dir = EdgeLabelBlock::at(&graph.arena, head);
            self.check_conflict(dir.creation_time())?;
            return Ok(dir);
        }
        let order: Order = 6;
        let offset = graph.arena.alloc(order);
        let dir = EdgeLabelBlock::at(&graph.arena, offset);
        dir.fill(order, src, self.stamp, NULL_POINTER);
        if let Some(undo) = &mut self.undo {
            undo.stamps.push(dir.creation_time_offset());
            undo.allocations.push((offset, order));
            undo.heads.push(HeadUndo::LabelDir {
                vertex: src,
                old_head: NULL_POINTER,
            });
        }
        slot.label_head.store(offset, Ordering::Release);
        Ok(dir)
    }

    /// Takes the per-block transactional write lock carried in
    /// `committed_time`.
    fn acquire_edge_block(&mut self, block: EdgeBlock<'g>) -> Result<()> {
        let committed = block.committed_time();
        if self.local_txn_id > 0 {
            if committed < 0 {
                if -committed != self.local_txn_id {
                    return Err(SableError::Rollback("edge block held by concurrent writer"));
                }
                return Ok(());
            }
            block.set_committed_time(-self.local_txn_id);
            if let Some(undo) = &mut self.undo {
                undo.committed_locks
                    .push((block.committed_time_offset(), committed));
                undo.stamps.push(block.committed_time_offset());
            }
        } else {
            block.set_committed_time(self.stamp);
        }
        Ok(())
    }

    /// A foreign pending creation stamp inside a block whose write lock
    /// we hold can only belong to an aborted transaction: live pending
    /// entries imply a held lock, and commit rewrites stamps before the
    /// lock releases.
    fn is_aborted_garbage(&self, creation: Timestamp) -> bool {
        creation < 0 && -creation != self.local_txn_id
    }

    /// Marks the newest live entry for `dst` deleted, if any.
    fn mark_existing_deleted(&mut self, block: EdgeBlock<'g>, dst: VertexId) {
        let (num_entries, _) = block.tail_unsync();
        for index in (0..num_entries).rev() {
            let entry = block.entry(index);
            if entry.dst() != dst || self.is_aborted_garbage(entry.creation_time()) {
                continue;
            }
            if entry.deletion_time() == TIMESTAMP_MAX {
                entry.set_deletion_time(self.stamp);
                if let Some(undo) = &mut self.undo {
                    undo.deletion_marks.push(entry.deletion_time_offset());
                    undo.stamps.push(entry.deletion_time_offset());
                }
            }
            break;
        }
    }

    /// Allocates and fills an edge block holding one pending entry.
    fn fresh_edge_block(&mut self, src: VertexId, dst: VertexId, data: &[u8]) -> Result<u64> {
        let graph = self.graph;
        let order = EdgeBlock::order_for(1, data.len() as u64, 6);
        let offset = graph.arena.alloc(order);
        let block = EdgeBlock::at(&graph.arena, offset);
        block.fill(order, src, self.stamp, NULL_POINTER, self.stamp);
        let entry = block.write_entry(0, dst, data, 0, self.stamp, TIMESTAMP_MAX);
        block.set_tail_unsync(1, data.len() as u64);
        if let Some(undo) = &mut self.undo {
            undo.allocations.push((offset, order));
            undo.stamps.push(block.creation_time_offset());
            undo.stamps.push(block.committed_time_offset());
            undo.stamps.push(entry.creation_time_offset());
        }
        Ok(offset)
    }

    /// Installs `(label, block)` into the directory, growing it to the
    /// next size class when full.
    fn directory_insert(
        &mut self,
        src: VertexId,
        slot: &VertexSlot,
        dir: EdgeLabelBlock<'g>,
        label: Label,
        block_offset: u64,
    ) -> Result<()> {
        if dir.append(label, block_offset) {
            if let Some(undo) = &mut self.undo {
                undo.dirs.push(DirUndo::Appended {
                    dir: dir.offset(),
                    index: dir.num_entries() - 1,
                });
            }
            return Ok(());
        }

        // Overflow: copy entries that still point anywhere into a larger
        // directory version and chain back to the old one.
        let graph = self.graph;
        let num = dir.num_entries();
        let live: Vec<(Label, u64)> = (0..num)
            .map(|i| (dir.label_at(i), dir.pointer_at(i)))
            .filter(|&(_, pointer)| pointer != NULL_POINTER)
            .collect();
        let mut order = dir.order() + 1;
        while EDGE_LABEL_HEADER_LEN + (live.len() as u64 + 1) * EDGE_LABEL_ENTRY_LEN > 1u64 << order
        {
            order += 1;
        }
        let offset = graph.arena.alloc(order);
        let new_dir = EdgeLabelBlock::at(&graph.arena, offset);
        new_dir.fill(order, src, self.stamp, dir.offset());
        for (entry_label, pointer) in live {
            new_dir.append(entry_label, pointer);
        }
        new_dir.append(label, block_offset);
        if let Some(undo) = &mut self.undo {
            undo.stamps.push(new_dir.creation_time_offset());
            undo.allocations.push((offset, order));
            undo.heads.push(HeadUndo::LabelDir {
                vertex: src,
                old_head: dir.offset(),
            });
        }
        slot.label_head.store(offset, Ordering::Release);
        Ok(())
    }

    /// Grows a full edge block: copies entries still live for some
    /// active snapshot into a larger block, appends the new entry, and
    /// returns the new block for installation. The old block stays
    /// reachable through `prev_pointer` for readers on old snapshots.
    fn migrate_edge_block(
        &mut self,
        src: VertexId,
        old: EdgeBlock<'g>,
        dst: VertexId,
        data: &[u8],
    ) -> Result<u64> {
        let graph = self.graph;
        let horizon = graph
            .readers
            .min_epoch()
            .unwrap_or_else(|| graph.visible_epoch());
        let (num_entries, _) = old.tail_unsync();

        let mut live = Vec::new();
        let mut live_data = 0u64;
        let mut src_cursor = 0u64;
        for index in 0..num_entries {
            let entry = old.entry(index);
            let length = entry.length() as u64;
            let deletion = entry.deletion_time();
            let needed = deletion == TIMESTAMP_MAX || deletion < 0 || deletion > horizon;
            if needed && !self.is_aborted_garbage(entry.creation_time()) {
                live.push((index, src_cursor, length));
                live_data += length;
            }
            src_cursor += length;
        }

        let order = EdgeBlock::order_for(
            live.len() as u64 + 1,
            live_data + data.len() as u64,
            old.order(),
        );
        let offset = graph.arena.alloc(order);
        let block = EdgeBlock::at(&graph.arena, offset);
        block.fill(order, src, self.stamp, old.offset(), self.stamp);

        let mut data_cursor = 0u64;
        for (new_index, &(old_index, old_pos, length)) in live.iter().enumerate() {
            let entry = old.entry(old_index);
            let payload = graph
                .arena
                .slice(old.data_offset() + old_pos, length as usize);
            let copied = block.write_entry(
                new_index as u64,
                entry.dst(),
                payload,
                data_cursor,
                entry.creation_time(),
                entry.deletion_time(),
            );
            if let Some(undo) = &mut self.undo {
                // Pending stamps travel with the copy; commit must
                // rewrite both the original and the migrated fields.
                if copied.creation_time() < 0 {
                    undo.stamps.push(copied.creation_time_offset());
                }
                if copied.deletion_time() < 0 {
                    undo.stamps.push(copied.deletion_time_offset());
                }
            }
            data_cursor += length;
        }
        let entry = block.write_entry(
            live.len() as u64,
            dst,
            data,
            data_cursor,
            self.stamp,
            TIMESTAMP_MAX,
        );
        block.set_tail_unsync(live.len() as u64 + 1, data_cursor + data.len() as u64);
        if let Some(undo) = &mut self.undo {
            undo.allocations.push((offset, order));
            undo.stamps.push(block.creation_time_offset());
            undo.stamps.push(block.committed_time_offset());
            undo.stamps.push(entry.creation_time_offset());
        }
        Ok(offset)
    }
}

/// A transaction over a [`Graph`].
///
/// Obtained from [`Graph::begin_transaction`],
/// [`Graph::begin_read_only_transaction`] or
/// [`Graph::begin_batch_loader`]. Reads observe the snapshot captured
/// at begin plus the transaction's own writes. Byte slices returned by
/// the getters stay valid for the life of the transaction and must not
/// be retained past it.
pub struct Transaction<'g> {
    graph: &'g Graph,
    mode: TxnMode,
    read_epoch_id: Timestamp,
    /// Visibility horizon for reads; the batch loader reads everything.
    read_horizon: Timestamp,
    local_txn_id: Timestamp,
    reader_slot: Option<usize>,
    mutator: Option<Mutator<'g>>,
    wal_ops: Vec<WalOp>,
    finished: bool,
}

impl<'g> Transaction<'g> {
    pub(crate) fn new_write(graph: &'g Graph) -> Result<Self> {
        let read_epoch_id = graph.visible_epoch();
        let reader_slot = graph.readers.register(read_epoch_id)?;
        let local_txn_id = graph.next_txn_id.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            graph,
            mode: TxnMode::Write,
            read_epoch_id,
            read_horizon: read_epoch_id,
            local_txn_id,
            reader_slot: Some(reader_slot),
            mutator: Some(Mutator {
                graph,
                stamp: -local_txn_id,
                read_epoch_id,
                local_txn_id,
                undo: Some(UndoLog::default()),
            }),
            wal_ops: Vec::new(),
            finished: false,
        })
    }

    pub(crate) fn new_read_only(graph: &'g Graph) -> Result<Self> {
        let read_epoch_id = graph.visible_epoch();
        let reader_slot = graph.readers.register(read_epoch_id)?;
        Ok(Self {
            graph,
            mode: TxnMode::ReadOnly,
            read_epoch_id,
            read_horizon: read_epoch_id,
            local_txn_id: NO_TRANSACTION,
            reader_slot: Some(reader_slot),
            mutator: None,
            wal_ops: Vec::new(),
            finished: false,
        })
    }

    pub(crate) fn new_batch(graph: &'g Graph) -> Result<Self> {
        let bulk_epoch = graph.visible_epoch();
        let reader_slot = graph.readers.register(bulk_epoch)?;
        Ok(Self {
            graph,
            mode: TxnMode::Batch,
            read_epoch_id: bulk_epoch,
            read_horizon: TIMESTAMP_MAX - 1,
            local_txn_id: 0,
            reader_slot: Some(reader_slot),
            mutator: Some(Mutator {
                graph,
                stamp: bulk_epoch,
                read_epoch_id: TIMESTAMP_MAX - 1,
                local_txn_id: 0,
                undo: None,
            }),
            wal_ops: Vec::new(),
            finished: false,
        })
    }

    pub fn get_read_epoch_id(&self) -> Timestamp {
        self.read_epoch_id
    }

    fn mutator(&mut self) -> Result<&mut Mutator<'g>> {
        if self.finished {
            return Err(SableError::Invalid("transaction already finished"));
        }
        match self.mode {
            TxnMode::ReadOnly => Err(SableError::Invalid("write in read-only transaction")),
            _ => Ok(self
                .mutator
                .as_mut()
                .expect("writable transaction carries a mutator")),
        }
    }

    fn log_wal(&mut self, op: WalOp) {
        if self.mode == TxnMode::Write && self.graph.wal.is_some() {
            self.wal_ops.push(op);
        }
    }

    /// Allocates a vertex id, preferring the recycle pool when asked.
    /// The id becomes visible once `put_vertex` or an edge insertion
    /// installs a block for it.
    pub fn new_vertex(&mut self, use_recycled: bool) -> Result<VertexId> {
        let mutator = self.mutator()?;
        let graph = mutator.graph;
        if use_recycled {
            if let Some(vertex) = graph.recycled.lock().pop() {
                if let Some(undo) = &mut mutator.undo {
                    undo.taken_recycled.push(vertex);
                }
                return Ok(vertex);
            }
        }
        let vertex = graph.next_vertex_id.fetch_add(1, Ordering::AcqRel);
        if vertex >= graph.table.slots() {
            return Err(SableError::Exhausted("vertex table full"));
        }
        if let Some(undo) = &mut mutator.undo {
            undo.fresh_ids.push(vertex);
        }
        Ok(vertex)
    }

    pub fn put_vertex(&mut self, vertex: VertexId, data: &[u8]) -> Result<()> {
        self.mutator()?.put_vertex(vertex, data)?;
        self.log_wal(WalOp::PutVertex {
            vertex,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Writes a tombstone version; returns whether the vertex was alive
    /// in this transaction's view. With `recycle`, the id joins the
    /// reuse pool once the transaction commits.
    pub fn del_vertex(&mut self, vertex: VertexId, recycle: bool) -> Result<bool> {
        let was_alive = self.mutator()?.del_vertex(vertex, recycle)?;
        self.log_wal(WalOp::DelVertex { vertex, recycle });
        Ok(was_alive)
    }

    /// Inserts `(src, label, dst)`. Without `force_insert` an existing
    /// live edge with the same endpoints is replaced; with it, a second
    /// live entry is appended.
    pub fn put_edge(
        &mut self,
        src: VertexId,
        label: Label,
        dst: VertexId,
        data: &[u8],
        force_insert: bool,
    ) -> Result<()> {
        self.mutator()?.put_edge(src, label, dst, data, force_insert)?;
        self.log_wal(WalOp::PutEdge {
            src,
            label,
            dst,
            data: data.to_vec(),
            force_insert,
        });
        Ok(())
    }

    pub fn del_edge(&mut self, src: VertexId, label: Label, dst: VertexId) -> Result<bool> {
        let existed = self.mutator()?.del_edge(src, label, dst)?;
        self.log_wal(WalOp::DelEdge { src, label, dst });
        Ok(existed)
    }

    /// The vertex payload, or empty when absent, tombstoned or not
    /// visible under this snapshot.
    pub fn get_vertex(&self, vertex: VertexId) -> &[u8] {
        self.graph
            .read_vertex(vertex, self.read_horizon, self.local_txn_id)
    }

    pub fn get_edge(&self, src: VertexId, label: Label, dst: VertexId) -> &[u8] {
        self.graph
            .read_edge(src, label, dst, self.read_horizon, self.local_txn_id)
    }

    pub fn get_edges(&self, src: VertexId, label: Label, reverse: bool) -> EdgeIterator<'_> {
        self.graph
            .read_edges(src, label, reverse, self.read_horizon, self.local_txn_id)
    }

    /// Commits the transaction and returns its epoch. With
    /// `wait_visible` the call blocks until the commit is observable by
    /// new snapshots. A WAL failure aborts the transaction and
    /// surfaces the error.
    pub fn commit(&mut self, wait_visible: bool) -> Result<Timestamp> {
        if self.finished {
            return Err(SableError::Invalid("transaction already finished"));
        }
        match self.mode {
            TxnMode::ReadOnly | TxnMode::Batch => {
                self.finish();
                Ok(self.read_epoch_id)
            }
            TxnMode::Write => {
                let graph = self.graph;
                let epoch = graph.allocate_write_epoch();
                if let Some(wal) = &graph.wal {
                    if let Err(err) = wal.append(epoch, &self.wal_ops) {
                        self.rollback_writes();
                        // The epoch slot must still publish or later
                        // commits would never become visible.
                        graph.publish_commit(epoch, false);
                        self.finish();
                        return Err(err);
                    }
                }

                let undo = self
                    .mutator
                    .as_mut()
                    .and_then(|m| m.undo.take())
                    .expect("write transaction carries an undo log");
                for &offset in &undo.stamps {
                    graph.arena.atomic_i64(offset).store(epoch, Ordering::Release);
                }
                for (vertex, touch) in &undo.touched {
                    let slot = graph.table.slot(*vertex);
                    match touch {
                        Touch::Put => {
                            let _ = slot.creation_hint.compare_exchange(
                                0,
                                epoch,
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            );
                            slot.deletion_hint.store(0, Ordering::Release);
                        }
                        Touch::Delete => {
                            slot.deletion_hint.store(epoch, Ordering::Release);
                        }
                    }
                }
                if !undo.recycle_on_commit.is_empty() {
                    graph.recycled.lock().extend(undo.recycle_on_commit.iter());
                }
                graph.publish_commit(epoch, wait_visible);
                self.finish();
                Ok(epoch)
            }
        }
    }

    /// Discards the transaction, restoring every structure it touched
    /// and returning its blocks and vertex ids.
    pub fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.rollback_writes();
        self.finish();
    }

    fn rollback_writes(&mut self) {
        let Some(undo) = self.mutator.as_mut().and_then(|m| m.undo.take()) else {
            return;
        };
        let graph = self.graph;
        // Deregister before freeing so a reader-free engine reclaims
        // this transaction's blocks inline.
        if let Some(slot) = self.reader_slot.take() {
            graph.readers.deregister(slot);
        }
        for dir_undo in undo.dirs.iter().rev() {
            match dir_undo {
                DirUndo::Replaced {
                    dir,
                    index,
                    old_pointer,
                } => EdgeLabelBlock::at(&graph.arena, *dir).set_pointer(*index, *old_pointer),
                DirUndo::Appended { dir, index } => {
                    EdgeLabelBlock::at(&graph.arena, *dir).set_pointer(*index, NULL_POINTER)
                }
            }
        }
        for head_undo in undo.heads.iter().rev() {
            match head_undo {
                HeadUndo::Data { vertex, old_head } => graph
                    .table
                    .slot(*vertex)
                    .data_head
                    .store(*old_head, Ordering::Release),
                HeadUndo::LabelDir { vertex, old_head } => graph
                    .table
                    .slot(*vertex)
                    .label_head
                    .store(*old_head, Ordering::Release),
            }
        }
        for &offset in &undo.deletion_marks {
            graph
                .arena
                .atomic_i64(offset)
                .store(TIMESTAMP_MAX, Ordering::Release);
        }
        // The write locks release last, after every marked entry is
        // back in its pre-transaction state. Entries this transaction
        // appended in place keep their pending stamps forever: they are
        // invisible to every snapshot and migration drops them.
        for (offset, old) in undo.committed_locks.iter().rev() {
            graph.arena.atomic_i64(*offset).store(*old, Ordering::Release);
        }
        for (offset, order) in undo.allocations {
            graph.defer_free(offset, order);
        }
        let mut pool = graph.recycled.lock();
        pool.extend(undo.taken_recycled);
        pool.extend(undo.fresh_ids);
    }

    fn finish(&mut self) {
        if let Some(slot) = self.reader_slot.take() {
            self.graph.readers.deregister(slot);
        }
        self.graph.collect_garbage();
        self.finished = true;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
    }
}

impl Graph {
    /// Reapplies one WAL record during recovery, stamping mutations
    /// with their recorded commit epoch.
    pub(crate) fn replay_record(&self, record: &WalRecord) -> Result<()> {
        let mut mutator = Mutator {
            graph: self,
            stamp: record.epoch,
            read_epoch_id: TIMESTAMP_MAX - 1,
            local_txn_id: 0,
            undo: None,
        };
        for op in &record.ops {
            match op {
                WalOp::PutVertex { vertex, data } => {
                    self.ensure_allocated(*vertex);
                    // A pool pop is not logged; re-population implies it.
                    self.recycled.lock().retain(|&id| id != *vertex);
                    mutator.put_vertex(*vertex, data)?;
                }
                WalOp::DelVertex { vertex, recycle } => {
                    self.ensure_allocated(*vertex);
                    mutator.del_vertex(*vertex, *recycle)?;
                }
                WalOp::PutEdge {
                    src,
                    label,
                    dst,
                    data,
                    force_insert,
                } => {
                    // Endpoints count toward the allocation mark even
                    // when no vertex record precedes them.
                    self.ensure_allocated(*src);
                    self.ensure_allocated(*dst);
                    self.recycled.lock().retain(|&id| id != *src);
                    mutator.put_edge(*src, *label, *dst, data, *force_insert)?;
                }
                WalOp::DelEdge { src, label, dst } => {
                    self.ensure_allocated(*src);
                    self.ensure_allocated(*dst);
                    mutator.del_edge(*src, *label, *dst)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphOptions;
    use crate::storage::blocks::VertexBlock;

    fn graph() -> Graph {
        Graph::open(GraphOptions::in_memory()).unwrap()
    }

    #[test]
    fn abort_returns_blocks_to_the_free_list() {
        let g = graph();
        let payload = vec![7u8; 4000]; // order-12 vertex block

        let mut tx = g.begin_transaction().unwrap();
        let v = tx.new_vertex(false).unwrap();
        tx.put_vertex(v, &payload).unwrap();
        let installed = g.table.slot(v).data_head.load(Ordering::Acquire);
        assert_ne!(installed, NULL_POINTER);
        tx.abort();
        assert_eq!(
            g.table.slot(v).data_head.load(Ordering::Acquire),
            NULL_POINTER,
            "abort must restore the previous head"
        );

        // With no registered readers the block is reclaimed inline and
        // the next same-order allocation pops it back.
        assert_eq!(g.arena.alloc(12), installed);
    }

    #[test]
    fn version_chain_timestamps_strictly_decrease() {
        let g = graph();
        let mut tx = g.begin_transaction().unwrap();
        let v = tx.new_vertex(false).unwrap();
        tx.put_vertex(v, b"one").unwrap();
        tx.commit(true).unwrap();
        for payload in [b"two".as_slice(), b"three", b"four"] {
            let mut tx = g.begin_transaction().unwrap();
            tx.put_vertex(v, payload).unwrap();
            tx.commit(true).unwrap();
        }

        let mut offset = g.table.slot(v).data_head.load(Ordering::Acquire);
        let mut previous = Timestamp::MAX;
        let mut versions = 0;
        while offset != NULL_POINTER {
            let block = VertexBlock::at(&g.arena, offset);
            let creation = block.creation_time();
            assert!(creation >= 0, "committed chain holds no pending stamps");
            assert!(creation < previous, "chain must be ordered new to old");
            previous = creation;
            offset = block.prev_pointer();
            versions += 1;
        }
        assert_eq!(versions, 4);
    }

    #[test]
    fn commit_rewrites_every_pending_stamp() {
        let g = graph();
        let mut tx = g.begin_transaction().unwrap();
        let v = tx.new_vertex(false).unwrap();
        tx.put_vertex(v, b"data").unwrap();
        tx.put_edge(v, 0, 42, b"e", false).unwrap();
        let head = g.table.slot(v).data_head.load(Ordering::Acquire);
        assert!(VertexBlock::at(&g.arena, head).creation_time() < 0);
        let epoch = tx.commit(true).unwrap();
        assert_eq!(VertexBlock::at(&g.arena, head).creation_time(), epoch);

        let edge_block = g
            .locate_edge_block(v, 0, epoch, NO_TRANSACTION)
            .expect("edge block resolvable after commit");
        assert_eq!(edge_block.creation_time(), epoch);
        assert_eq!(edge_block.committed_time(), epoch);
        assert_eq!(edge_block.entry(0).creation_time(), epoch);
        assert_eq!(edge_block.entry(0).deletion_time(), TIMESTAMP_MAX);
    }

    #[test]
    fn aborted_directory_entries_are_neutralized_and_reused() {
        let g = graph();
        let mut tx = g.begin_transaction().unwrap();
        let v = tx.new_vertex(false).unwrap();
        // Seed an edge so the directory outlives the aborted insert.
        tx.put_edge(v, 1, 50, b"seed", false).unwrap();
        tx.commit(true).unwrap();

        let mut tx = g.begin_transaction().unwrap();
        tx.put_edge(v, 9, 77, b"doomed", false).unwrap();
        tx.abort();

        let head = g.table.slot(v).label_head.load(Ordering::Acquire);
        let dir = EdgeLabelBlock::at(&g.arena, head);
        let (index, pointer) = dir.find(9).expect("label entry survives abort");
        assert_eq!(pointer, NULL_POINTER, "aborted entry must point nowhere");

        let mut tx = g.begin_transaction().unwrap();
        tx.put_edge(v, 9, 78, b"replacement", false).unwrap();
        tx.commit(true).unwrap();
        let (reused_index, pointer) = dir.find(9).unwrap();
        assert_eq!(reused_index, index, "aborted entry slot is reused");
        assert_ne!(pointer, NULL_POINTER);

        let tx = g.begin_read_only_transaction().unwrap();
        assert_eq!(tx.get_edge(v, 9, 77), b"");
        assert_eq!(tx.get_edge(v, 9, 78), b"replacement");
    }

    #[test]
    fn wait_visible_orders_commit_publication() {
        let g = graph();
        let mut tx = g.begin_transaction().unwrap();
        let v = tx.new_vertex(false).unwrap();
        tx.put_vertex(v, b"x").unwrap();
        let epoch = tx.commit(true).unwrap();
        assert_eq!(g.visible_epoch(), epoch);
        let tx = g.begin_read_only_transaction().unwrap();
        assert_eq!(tx.get_read_epoch_id(), epoch);
    }
}
