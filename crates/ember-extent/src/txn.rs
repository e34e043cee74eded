//! Per-operation transaction over one file's durable state.
//!
//! [`FileTx`] bundles the three rollback mechanisms an interval operation
//! needs:
//!
//! - payload mutations go through the heap's own undo-logged transaction;
//! - extent-list mutations are applied eagerly (the in-transaction walk
//!   must see extents it just created) but record inverse [`ListUndo`]
//!   entries, replayed in reverse on abort;
//! - volatile-index mutations are only *staged* as an [`IndexDiff`] and
//!   applied after the underlying transaction reports success, so an abort
//!   can never leave the index and the list disagreeing;
//! - inode field updates (size, allocated space, times) are staged the same
//!   way and land on commit.
//!
//! Commit reports whether the extent list changed so the file layer can bump
//! its generation counter and invalidate stat caches.

use crate::index::{IndexDiff, OffsetIndex};
use crate::list::{ExtentId, ExtentTable, ListUndo};
use crate::Inode;
use ember_error::Result;
use ember_txn::{Heap, HeapTx, PayloadId};
use ember_types::{Granularity, Timespec};
use tracing::trace;

/// Staged inode updates; `None` fields are left untouched.
#[derive(Debug, Default, Clone, Copy)]
struct InodeDelta {
    size: Option<u64>,
    allocated_space: Option<u64>,
    mtime: Option<Timespec>,
    atime: Option<Timespec>,
}

/// Outcome of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    /// Extent membership or geometry changed; hints and stat caches are
    /// stale. Flag-only updates (first-write initialization) do not count —
    /// they move no extent, so cached pointers stay valid.
    pub list_changed: bool,
}

/// One atomic operation against a file's extents, payloads, and metadata.
#[derive(Debug)]
pub struct FileTx<'h> {
    heap: HeapTx<'h>,
    granularity: Granularity,
    list_undo: Vec<ListUndo>,
    diff: IndexDiff,
    delta: InodeDelta,
    structural: bool,
}

impl<'h> FileTx<'h> {
    /// Begin a transaction against `heap`.
    #[must_use]
    pub fn begin(heap: &'h Heap) -> Self {
        Self {
            heap: heap.begin(),
            granularity: heap.granularity(),
            list_undo: Vec::new(),
            diff: IndexDiff::new(),
            delta: InodeDelta::default(),
            structural: false,
        }
    }

    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    // ── Payload mutation (delegated to the heap transaction) ────────────

    pub fn alloc_payload(&mut self, len: u32) -> Result<PayloadId> {
        self.heap.alloc_payload(len)
    }

    pub fn free_payload(&mut self, id: PayloadId) {
        self.heap.free_payload(id);
    }

    #[must_use]
    pub fn payload_len(&self, id: PayloadId) -> usize {
        self.heap.payload_len(id)
    }

    pub fn write_payload(&mut self, id: PayloadId, offset: usize, data: &[u8]) {
        self.heap.write_payload(id, offset, data);
    }

    pub fn zero_payload_range(&mut self, id: PayloadId, offset: usize, len: usize) {
        self.heap.zero_payload_range(id, offset, len);
    }

    pub fn copy_within_payload(&mut self, id: PayloadId, src: usize, dst: usize, len: usize) {
        self.heap.copy_within_payload(id, src, dst, len);
    }

    pub fn copy_between_payloads(
        &mut self,
        src: PayloadId,
        src_offset: usize,
        dst: PayloadId,
        dst_offset: usize,
        len: usize,
    ) {
        self.heap
            .copy_between_payloads(src, src_offset, dst, dst_offset, len);
    }

    // ── Extent-list mutation (eager, undo-logged, diff-staged) ──────────

    /// Create and link an extent, staging its index registration.
    pub fn insert_extent(
        &mut self,
        table: &mut ExtentTable,
        after: Option<ExtentId>,
        offset: u64,
        length: u32,
        payload: PayloadId,
        flags: u16,
    ) -> ExtentId {
        let id = table.insert_after(after, offset, length, payload, flags, &mut self.list_undo);
        self.diff.stage_insert(offset, length, id);
        self.structural = true;
        trace!(%id, offset, length, "extent: insert");
        id
    }

    /// Unlink an extent, staging its index removal; returns its predecessor.
    ///
    /// The payload is not freed here — callers decide (a split reuses it).
    pub fn remove_extent(&mut self, table: &mut ExtentTable, id: ExtentId) -> Option<ExtentId> {
        let offset = table.get(id).offset;
        let prev = table.remove(id, &mut self.list_undo);
        self.diff.stage_remove(offset, id);
        self.structural = true;
        trace!(%id, offset, "extent: remove");
        prev
    }

    /// Move an extent's start offset, staging the index rekey.
    pub fn set_extent_offset(&mut self, table: &mut ExtentTable, id: ExtentId, offset: u64) {
        let old = table.get(id).offset;
        table.set_offset(id, offset, &mut self.list_undo);
        self.diff.stage_rekey(old, offset, id);
        self.structural = true;
    }

    /// Change an extent's length, staging the index's recorded length.
    pub fn set_extent_length(&mut self, table: &mut ExtentTable, id: ExtentId, length: u32) {
        let offset = table.get(id).offset;
        table.set_length(id, length, &mut self.list_undo);
        self.diff.stage_set_length(offset, length, id);
        self.structural = true;
    }

    pub fn set_extent_flags(&mut self, table: &mut ExtentTable, id: ExtentId, flags: u16) {
        table.set_flags(id, flags, &mut self.list_undo);
    }

    // ── Inode metadata staging ──────────────────────────────────────────

    pub fn stage_size(&mut self, size: u64) {
        self.delta.size = Some(size);
    }

    pub fn stage_allocated_space(&mut self, bytes: u64) {
        self.delta.allocated_space = Some(bytes);
    }

    pub fn stage_mtime(&mut self, t: Timespec) {
        self.delta.mtime = Some(t);
    }

    pub fn stage_atime(&mut self, t: Timespec) {
        self.delta.atime = Some(t);
    }

    #[must_use]
    pub fn staged_size(&self) -> Option<u64> {
        self.delta.size
    }

    // ── Commit / abort ──────────────────────────────────────────────────

    /// Commit: apply the staged index diff and inode delta, release the
    /// undo logs.
    pub fn commit(self, index: &mut OffsetIndex, inode: &mut Inode) -> TxOutcome {
        let list_changed = self.structural;
        self.diff.apply(index);
        if let Some(size) = self.delta.size {
            inode.size = size;
        }
        if let Some(bytes) = self.delta.allocated_space {
            inode.allocated_space = bytes;
        }
        if let Some(t) = self.delta.mtime {
            inode.mtime = t;
        }
        if let Some(t) = self.delta.atime {
            inode.atime = t;
        }
        self.heap.commit();
        TxOutcome { list_changed }
    }

    /// Roll back: revert the list in reverse order, discard the staged diff
    /// and delta, then roll the heap back. The index was never touched.
    pub fn abort(mut self, table: &mut ExtentTable) {
        while let Some(op) = self.list_undo.pop() {
            table.apply_undo(op);
        }
        self.heap.abort();
    }
}
