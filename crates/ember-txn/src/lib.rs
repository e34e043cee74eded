#![forbid(unsafe_code)]
//! Durable-heap boundary for emberfs.
//!
//! The extent core treats the persistent-memory transaction machinery as an
//! external collaborator: it begins a transaction, mutates payload storage
//! through it, and either commits or rolls back. This crate supplies that
//! boundary as [`Heap`] / [`HeapTx`]:
//!
//! - payload buffers are owned by the heap and referenced by [`PayloadId`];
//! - every in-transaction mutation is undo-logged ([`HeapTx::write_payload`]
//!   snapshots the overwritten range first, frees are deferred to commit);
//! - [`HeapTx::abort`] replays the undo log in reverse, restoring the exact
//!   pre-transaction heap state;
//! - a [`FaultPlan`] turns the Nth allocation into `ENOSPC`, giving tests a
//!   deterministic abort point.
//!
//! A dropped transaction that was neither committed nor aborted rolls back,
//! so a panicking caller cannot leak half-applied heap state.

use ember_error::{EmberError, Result};
use ember_types::Granularity;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use tracing::{debug, trace};

/// Identifier of one payload buffer owned by the heap.
///
/// Payloads are owned exclusively by the extent that references them; the id
/// is only valid between the allocation and the commit of the free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PayloadId(u32);

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options controlling heap geometry and allocation policy.
///
/// These are format parameters supplied by the storage layer; the extent
/// core consumes them through [`Heap`] accessors.
#[derive(Debug, Clone, Default)]
pub struct HeapOptions {
    /// Total payload bytes the pool may hand out. `None` = unbounded.
    pub capacity: Option<u64>,
    /// Granularity override (power of two in `0x1000..=0x4000000`).
    /// `None` selects [`ember_types::MIN_EXTENT_SIZE`].
    pub block_size: Option<u32>,
    /// Grow append writes beyond the requested size to amortize future
    /// appends (the overallocation ladder lives in the allocator).
    pub overallocate_on_append: bool,
    /// Soft cap on how many extents the volatile offset index may hold.
    /// Exceeding it fails the index build retryably (`ENOMEM`-class).
    pub index_extent_cap: Option<usize>,
}

/// Deterministic fault injection for transaction abort paths.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    remaining_allocs: Option<u32>,
}

impl FaultPlan {
    /// No injected faults.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Fail the `n`th payload allocation from now (1-based) with `ENOSPC`.
    #[must_use]
    pub fn fail_nth_alloc(n: u32) -> Self {
        assert!(n > 0, "fault ordinal is 1-based");
        Self {
            remaining_allocs: Some(n - 1),
        }
    }

    /// Returns true when the current allocation should fail.
    fn take_alloc_fault(&mut self) -> bool {
        match self.remaining_allocs {
            Some(0) => {
                self.remaining_allocs = None;
                true
            }
            Some(n) => {
                self.remaining_allocs = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct PayloadTable {
    slots: Vec<Option<Box<[u8]>>>,
    free: Vec<u32>,
    used_bytes: u64,
}

impl PayloadTable {
    fn slot(&self, id: PayloadId) -> &[u8] {
        self.slots[id.0 as usize]
            .as_deref()
            .expect("payload id refers to a live slot")
    }

    fn slot_mut(&mut self, id: PayloadId) -> &mut [u8] {
        self.slots[id.0 as usize]
            .as_deref_mut()
            .expect("payload id refers to a live slot")
    }

    fn insert(&mut self, buf: Box<[u8]>) -> PayloadId {
        let len = buf.len() as u64;
        self.used_bytes += len;
        match self.free.pop() {
            Some(slot) => {
                debug_assert!(self.slots[slot as usize].is_none());
                self.slots[slot as usize] = Some(buf);
                PayloadId(slot)
            }
            None => {
                let slot = u32::try_from(self.slots.len()).expect("payload table overflow");
                self.slots.push(Some(buf));
                PayloadId(slot)
            }
        }
    }

    fn remove(&mut self, id: PayloadId) {
        let buf = self.slots[id.0 as usize]
            .take()
            .expect("freeing a live payload");
        self.used_bytes -= buf.len() as u64;
        self.free.push(id.0);
    }
}

/// Pool-wide payload storage with transactional mutation.
///
/// Shared by all files of one pool; per-file serialization is the caller's
/// job (the file layer holds its per-file write lock across a transaction),
/// the internal lock only protects cross-file access to the slot table.
#[derive(Debug)]
pub struct Heap {
    payloads: RwLock<PayloadTable>,
    faults: Mutex<FaultPlan>,
    granularity: Granularity,
    capacity: Option<u64>,
    overallocate_on_append: bool,
    index_extent_cap: Option<usize>,
}

impl Heap {
    /// Create a heap, validating the geometry options.
    pub fn new(opts: HeapOptions) -> Result<Self> {
        let granularity = match opts.block_size {
            Some(size) => Granularity::new(size)
                .map_err(|e| EmberError::InvalidArgument(e.to_string()))?,
            None => Granularity::default(),
        };
        debug!(
            granularity = granularity.get(),
            capacity = opts.capacity,
            overallocate = opts.overallocate_on_append,
            "heap: initializing"
        );
        Ok(Self {
            payloads: RwLock::new(PayloadTable::default()),
            faults: Mutex::new(FaultPlan::none()),
            granularity,
            capacity: opts.capacity,
            overallocate_on_append: opts.overallocate_on_append,
            index_extent_cap: opts.index_extent_cap,
        })
    }

    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    #[must_use]
    pub fn overallocate_on_append(&self) -> bool {
        self.overallocate_on_append
    }

    #[must_use]
    pub fn index_extent_cap(&self) -> Option<usize> {
        self.index_extent_cap
    }

    /// Payload bytes currently allocated.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.payloads.read().used_bytes
    }

    /// Replace the active fault plan (tests only, but harmless elsewhere).
    pub fn inject_faults(&self, plan: FaultPlan) {
        *self.faults.lock() = plan;
    }

    /// Capacity of one payload buffer in bytes.
    #[must_use]
    pub fn payload_len(&self, id: PayloadId) -> usize {
        self.payloads.read().slot(id).len()
    }

    /// Copy `buf.len()` bytes out of a payload starting at `offset`.
    ///
    /// # Panics
    /// When the range exceeds the payload (caller invariant).
    pub fn read_payload(&self, id: PayloadId, offset: usize, buf: &mut [u8]) {
        let table = self.payloads.read();
        let data = table.slot(id);
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Begin a transaction against this heap.
    #[must_use]
    pub fn begin(&self) -> HeapTx<'_> {
        HeapTx {
            heap: self,
            undo: Vec::new(),
            deferred_free: Vec::new(),
            finished: false,
        }
    }
}

enum UndoOp {
    /// Payload allocated in this transaction; freed on abort.
    FreshPayload(PayloadId),
    /// Bytes overwritten in this transaction; restored on abort.
    Range {
        id: PayloadId,
        offset: usize,
        saved: Box<[u8]>,
    },
}

impl fmt::Debug for UndoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FreshPayload(id) => write!(f, "FreshPayload({id})"),
            Self::Range { id, offset, saved } => {
                write!(f, "Range({id}, {offset}, {} bytes)", saved.len())
            }
        }
    }
}

/// One transaction against a [`Heap`].
///
/// All heap mutation during an operation flows through this object so the
/// abort path can restore the exact pre-transaction state. Frees are staged
/// and applied at commit: an aborted transaction keeps every payload it
/// "freed", a committed one releases them.
#[derive(Debug)]
pub struct HeapTx<'h> {
    heap: &'h Heap,
    undo: Vec<UndoOp>,
    deferred_free: Vec<PayloadId>,
    finished: bool,
}

impl HeapTx<'_> {
    /// Allocate a zero-initialized payload of `len` bytes.
    ///
    /// `len` must be a whole number of granules. Fails with `ENOSPC` when
    /// the pool capacity is exhausted or the fault plan says so.
    pub fn alloc_payload(&mut self, len: u32) -> Result<PayloadId> {
        debug_assert!(len > 0);
        debug_assert_eq!(u64::from(len) % u64::from(self.heap.granularity.get()), 0);

        if self.heap.faults.lock().take_alloc_fault() {
            trace!(len, "heap: injected alloc fault");
            return Err(EmberError::NoSpace);
        }

        let mut table = self.heap.payloads.write();
        if let Some(capacity) = self.heap.capacity {
            if table.used_bytes + u64::from(len) > capacity {
                return Err(EmberError::NoSpace);
            }
        }
        let id = table.insert(vec![0u8; len as usize].into_boxed_slice());
        drop(table);

        trace!(%id, len, "heap: alloc payload");
        self.undo.push(UndoOp::FreshPayload(id));
        Ok(id)
    }

    /// Release a payload. Takes effect at commit; a rollback keeps it.
    pub fn free_payload(&mut self, id: PayloadId) {
        trace!(%id, "heap: free payload (deferred)");
        self.deferred_free.push(id);
    }

    /// Capacity of one payload buffer in bytes.
    #[must_use]
    pub fn payload_len(&self, id: PayloadId) -> usize {
        self.heap.payload_len(id)
    }

    /// Overwrite `data.len()` bytes at `offset`, snapshotting the old bytes.
    pub fn write_payload(&mut self, id: PayloadId, offset: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut table = self.heap.payloads.write();
        let slot = table.slot_mut(id);
        let saved: Box<[u8]> = slot[offset..offset + data.len()].into();
        slot[offset..offset + data.len()].copy_from_slice(data);
        drop(table);
        self.undo.push(UndoOp::Range { id, offset, saved });
    }

    /// Zero `len` bytes at `offset`, snapshotting the old bytes.
    pub fn zero_payload_range(&mut self, id: PayloadId, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let mut table = self.heap.payloads.write();
        let slot = table.slot_mut(id);
        let saved: Box<[u8]> = slot[offset..offset + len].into();
        slot[offset..offset + len].fill(0);
        drop(table);
        self.undo.push(UndoOp::Range { id, offset, saved });
    }

    /// Copy `len` bytes within one payload (memmove semantics).
    pub fn copy_within_payload(&mut self, id: PayloadId, src: usize, dst: usize, len: usize) {
        if len == 0 || src == dst {
            return;
        }
        let mut table = self.heap.payloads.write();
        let slot = table.slot_mut(id);
        let saved: Box<[u8]> = slot[dst..dst + len].into();
        slot.copy_within(src..src + len, dst);
        drop(table);
        self.undo.push(UndoOp::Range { id, offset: dst, saved });
    }

    /// Copy `len` bytes from one payload into another.
    pub fn copy_between_payloads(
        &mut self,
        src: PayloadId,
        src_offset: usize,
        dst: PayloadId,
        dst_offset: usize,
        len: usize,
    ) {
        if len == 0 {
            return;
        }
        let mut table = self.heap.payloads.write();
        let from: Box<[u8]> = table.slot(src)[src_offset..src_offset + len].into();
        let slot = table.slot_mut(dst);
        let saved: Box<[u8]> = slot[dst_offset..dst_offset + len].into();
        slot[dst_offset..dst_offset + len].copy_from_slice(&from);
        drop(table);
        self.undo.push(UndoOp::Range {
            id: dst,
            offset: dst_offset,
            saved,
        });
    }

    /// Commit: apply deferred frees and discard the undo log.
    pub fn commit(mut self) {
        let mut table = self.heap.payloads.write();
        for id in self.deferred_free.drain(..) {
            table.remove(id);
        }
        drop(table);
        self.undo.clear();
        self.finished = true;
    }

    /// Roll back: replay the undo log in reverse, discard deferred frees.
    pub fn abort(mut self) {
        self.rollback();
        self.finished = true;
    }

    fn rollback(&mut self) {
        let mut table = self.heap.payloads.write();
        while let Some(op) = self.undo.pop() {
            match op {
                UndoOp::FreshPayload(id) => table.remove(id),
                UndoOp::Range { id, offset, saved } => {
                    table.slot_mut(id)[offset..offset + saved.len()].copy_from_slice(&saved);
                }
            }
        }
        self.deferred_free.clear();
    }
}

impl Drop for HeapTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Unwind path: a transaction abandoned without commit rolls back.
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(HeapOptions::default()).expect("default options are valid")
    }

    fn granule(h: &Heap) -> u32 {
        h.granularity().get()
    }

    #[test]
    fn alloc_commit_keeps_payload() {
        let h = heap();
        let g = granule(&h);
        let mut tx = h.begin();
        let id = tx.alloc_payload(g).unwrap();
        tx.commit();

        assert_eq!(h.payload_len(id), g as usize);
        assert_eq!(h.used_bytes(), u64::from(g));
    }

    #[test]
    fn alloc_abort_releases_payload() {
        let h = heap();
        let g = granule(&h);
        let mut tx = h.begin();
        tx.alloc_payload(g).unwrap();
        tx.abort();

        assert_eq!(h.used_bytes(), 0);
    }

    #[test]
    fn payloads_are_zero_initialized() {
        let h = heap();
        let g = granule(&h);
        let mut tx = h.begin();
        let id = tx.alloc_payload(g).unwrap();
        tx.commit();

        let mut buf = vec![0xAA_u8; 64];
        h.read_payload(id, 0, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_abort_restores_bytes() {
        let h = heap();
        let g = granule(&h);
        let id = {
            let mut tx = h.begin();
            let id = tx.alloc_payload(g).unwrap();
            tx.write_payload(id, 0, b"persisted");
            tx.commit();
            id
        };

        let mut tx = h.begin();
        tx.write_payload(id, 0, b"scribbled");
        tx.zero_payload_range(id, 4, 5);
        tx.abort();

        let mut buf = [0u8; 9];
        h.read_payload(id, 0, &mut buf);
        assert_eq!(&buf, b"persisted");
    }

    #[test]
    fn free_is_deferred_until_commit() {
        let h = heap();
        let g = granule(&h);
        let id = {
            let mut tx = h.begin();
            let id = tx.alloc_payload(g).unwrap();
            tx.commit();
            id
        };

        // Abort keeps the payload.
        let mut tx = h.begin();
        tx.free_payload(id);
        tx.abort();
        assert_eq!(h.used_bytes(), u64::from(g));

        // Commit releases it.
        let mut tx = h.begin();
        tx.free_payload(id);
        tx.commit();
        assert_eq!(h.used_bytes(), 0);
    }

    #[test]
    fn capacity_limit_reports_nospace() {
        let h = Heap::new(HeapOptions {
            capacity: Some(u64::from(ember_types::MIN_EXTENT_SIZE) * 2),
            ..HeapOptions::default()
        })
        .unwrap();
        let g = granule(&h);

        let mut tx = h.begin();
        tx.alloc_payload(g).unwrap();
        tx.alloc_payload(g).unwrap();
        assert_eq!(tx.alloc_payload(g), Err(EmberError::NoSpace));
        tx.abort();
        assert_eq!(h.used_bytes(), 0);
    }

    #[test]
    fn fault_plan_fails_exactly_nth_alloc() {
        let h = heap();
        let g = granule(&h);
        h.inject_faults(FaultPlan::fail_nth_alloc(2));

        let mut tx = h.begin();
        assert!(tx.alloc_payload(g).is_ok());
        assert_eq!(tx.alloc_payload(g), Err(EmberError::NoSpace));
        // The plan is one-shot.
        assert!(tx.alloc_payload(g).is_ok());
        tx.abort();
    }

    #[test]
    fn copy_between_payloads_snapshots_destination() {
        let h = heap();
        let g = granule(&h);
        let (a, b) = {
            let mut tx = h.begin();
            let a = tx.alloc_payload(g).unwrap();
            let b = tx.alloc_payload(g).unwrap();
            tx.write_payload(a, 0, b"source!!");
            tx.write_payload(b, 0, b"original");
            tx.commit();
            (a, b)
        };

        let mut tx = h.begin();
        tx.copy_between_payloads(a, 0, b, 0, 8);
        tx.abort();

        let mut buf = [0u8; 8];
        h.read_payload(b, 0, &mut buf);
        assert_eq!(&buf, b"original");
    }

    #[test]
    fn copy_within_payload_moves_bytes() {
        let h = heap();
        let g = granule(&h);
        let id = {
            let mut tx = h.begin();
            let id = tx.alloc_payload(g).unwrap();
            tx.write_payload(id, 16, b"shifted");
            tx.commit();
            id
        };

        let mut tx = h.begin();
        tx.copy_within_payload(id, 16, 0, 7);
        tx.commit();

        let mut buf = [0u8; 7];
        h.read_payload(id, 0, &mut buf);
        assert_eq!(&buf, b"shifted");
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let h = heap();
        let g = granule(&h);
        {
            let mut tx = h.begin();
            tx.alloc_payload(g).unwrap();
            // Dropped without commit or abort.
        }
        assert_eq!(h.used_bytes(), 0);
    }

    #[test]
    fn block_size_override_validated() {
        assert!(Heap::new(HeapOptions {
            block_size: Some(0x1000),
            ..HeapOptions::default()
        })
        .is_ok());
        assert!(matches!(
            Heap::new(HeapOptions {
                block_size: Some(0x1234),
                ..HeapOptions::default()
            }),
            Err(EmberError::InvalidArgument(_))
        ));
    }
}
