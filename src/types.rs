//! Core identifier and timestamp types shared by every layer.

use std::cmp::Ordering;

/// Vertex identifier. Block headers pack these into 48 bits, so the
/// effective range is bounded by [`MAX_VERTEX_ID`].
pub type VertexId = u64;
/// Edge label.
pub type Label = u16;
/// Log2 of a block's byte size.
pub type Order = u8;
/// Commit epoch, or a negative pending-transaction sentinel.
pub type Timestamp = i64;

/// Largest vertex id representable by the packed 16/32-bit header split.
pub const MAX_VERTEX_ID: VertexId = ((u16::MAX as u64) << 32) | (u32::MAX as u64);

/// Sentinel returned by an exhausted edge iterator.
pub const VERTEX_TOMBSTONE: VertexId = u64::MAX;

/// "No transaction" marker for snapshot parameters.
pub const NO_TRANSACTION: Timestamp = -1;

/// Deletion time of a live entry.
pub const TIMESTAMP_MAX: Timestamp = i64::MAX;

/// Three-way comparison of a stored timestamp against a reader's snapshot.
///
/// Non-negative timestamps are commit epochs and compare numerically
/// against `read_epoch_id`. Negative timestamps are pending: the field
/// belongs to the in-flight transaction whose local id is the magnitude.
/// A pending stamp matches the reader only when that magnitude equals
/// `local_txn_id`; a matching stamp compares as negative infinity (the
/// reader owns the write), any other pending stamp as positive infinity
/// (invisible until committed).
pub fn cmp_timestamp(ts: Timestamp, read_epoch_id: Timestamp, local_txn_id: Timestamp) -> Ordering {
    if ts >= 0 {
        ts.cmp(&read_epoch_id)
    } else if -ts == local_txn_id {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// Visibility predicate for a `(creation_time, deletion_time)` pair.
pub fn visible(
    creation: Timestamp,
    deletion: Timestamp,
    read_epoch_id: Timestamp,
    local_txn_id: Timestamp,
) -> bool {
    cmp_timestamp(creation, read_epoch_id, local_txn_id) != Ordering::Greater
        && cmp_timestamp(deletion, read_epoch_id, local_txn_id) == Ordering::Greater
}
