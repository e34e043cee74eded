//! In-memory file wrapper: one lock, one index, one generation counter.
//!
//! [`FileNode`] owns everything volatile about a file (offset index,
//! generation, stat cache) next to its durable state (extent table, inode
//! metadata). A single `parking_lot::RwLock` guards it all: lookups, scans
//! and stat take it shared; allocate/remove, index rebuild and time updates
//! take it exclusively. The per-handle block hint needs no cross-handle
//! locking — staleness is a generation compare.

use crate::data::{read_range, write_range};
use ember_error::{EmberError, Result};
use ember_extent::{
    allocate_interval, allocated_bytes, remove_interval, scan, BlockHint, ExtentTable, FileTx,
    Inode, OffsetIndex,
};
use ember_txn::Heap;
use ember_types::{stat_blocks, Timespec};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::Arc;
use tracing::debug;

/// Largest representable file size (`off_t` is signed).
const MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// Window for relatime-style access-time updates.
const ATIME_WINDOW_SECS: i64 = 86_400;

/// Everything the node knows about one file, volatile and durable.
#[derive(Debug)]
pub(crate) struct FileState {
    pub(crate) inode: Inode,
    pub(crate) table: ExtentTable,
    /// Absent after pool reopen or a discarded build; rebuilt lazily under
    /// the write lock. An *empty* index is a valid present state.
    pub(crate) index: Option<OffsetIndex>,
    /// Bumps on every rebuild and every committed structural change.
    pub(crate) generation: u64,
    /// Cached sum of extent lengths, invalidated by any structural change.
    pub(crate) allocated_cache: Option<u64>,
}

/// Snapshot of a file's metadata, as `stat` reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// Allocated bytes backing the file (extent lengths summed).
    pub allocated_bytes: u64,
    /// `st_blocks`: allocated bytes in 512-byte units, rounded up.
    pub blocks: u64,
    pub mtime: Timespec,
    pub atime: Timespec,
}

/// One regular file resident in the pool.
#[derive(Debug)]
pub struct FileNode {
    heap: Arc<Heap>,
    state: RwLock<FileState>,
}

impl FileNode {
    pub(crate) fn new(heap: Arc<Heap>) -> Self {
        Self {
            heap,
            state: RwLock::new(FileState {
                inode: Inode::new(),
                table: ExtentTable::new(),
                index: Some(OffsetIndex::new()),
                generation: 1,
                allocated_cache: Some(0),
            }),
        }
    }

    pub(crate) fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Drop the volatile index, as a pool suspend/resume would.
    ///
    /// The next operation that needs it rebuilds it from the extent list.
    pub fn invalidate_index(&self) {
        let mut state = self.state.write();
        state.index = None;
        state.allocated_cache = None;
    }

    /// Rebuild the index if it is absent. Caller holds the write lock.
    fn ensure_index(&self, state: &mut FileState) -> Result<()> {
        if state.index.is_none() {
            let index = OffsetIndex::build(&state.table, self.heap.index_extent_cap())?;
            debug!(extents = index.len(), "offset index rebuilt");
            state.index = Some(index);
            state.generation = state.generation.wrapping_add(1);
        }
        Ok(())
    }

    /// Run `f` under the read lock with the index guaranteed present.
    ///
    /// When the index is absent the read lock is dropped, the write lock is
    /// taken for the rebuild (another thread may have won the race and built
    /// it already), and the guard is downgraded back to shared mode.
    fn with_index_read<T>(&self, f: impl FnOnce(&FileState) -> T) -> Result<T> {
        {
            let state = self.state.read();
            if state.index.is_some() {
                return Ok(f(&state));
            }
        }
        let mut state = self.state.write();
        self.ensure_index(&mut state)?;
        let state = RwLockWriteGuard::downgrade(state);
        Ok(f(&state))
    }

    /// Apply a committed transaction's bookkeeping to the volatile state.
    fn finish_commit(state: &mut FileState, tx: FileTx<'_>) {
        let index = state.index.as_mut().expect("index present during commit");
        let outcome = tx.commit(index, &mut state.inode);
        if outcome.list_changed {
            state.generation = state.generation.wrapping_add(1);
            state.allocated_cache = None;
        }
    }

    // ── Reading ─────────────────────────────────────────────────────────

    /// Read into `buf` starting at `offset`; returns bytes read (short at
    /// end of file, zero when at or past it).
    pub(crate) fn read_at(
        &self,
        offset: u64,
        buf: &mut [u8],
        hint: &mut BlockHint,
        update_atime: bool,
    ) -> Result<usize> {
        let (count, atime_due) = self.with_index_read(|state| {
            let size = state.inode.size;
            if offset >= size || buf.is_empty() {
                return (0, false);
            }
            let count = u64::min(size - offset, buf.len() as u64) as usize;
            read_range(
                &self.heap,
                &state.table,
                state.index.as_ref().expect("index present"),
                hint,
                state.generation,
                offset,
                &mut buf[..count],
            );

            // relatime: only refresh atime when it is older than a day or
            // behind the last modification.
            let due = update_atime && {
                let inode = &state.inode;
                inode.atime < Timespec::now().minus_secs(ATIME_WINDOW_SECS)
                    || inode.atime < inode.mtime
            };
            (count, due)
        })?;

        if atime_due {
            let mut state = self.state.write();
            self.ensure_index(&mut state)?;
            let mut tx = FileTx::begin(&self.heap);
            tx.stage_atime(Timespec::now());
            Self::finish_commit(&mut state, tx);
        }

        Ok(count)
    }

    // ── Writing ─────────────────────────────────────────────────────────

    /// Write `data` at `offset` (or at end of file when `append` is set).
    ///
    /// Returns the offset actually written at and the byte count, which is
    /// clamped so the resulting size stays representable; a write that can
    /// not make any progress fails with `EFBIG`.
    pub(crate) fn write_at(
        &self,
        offset: u64,
        data: &[u8],
        hint: &mut BlockHint,
        append: bool,
    ) -> Result<(u64, usize)> {
        if data.is_empty() {
            return Ok((offset, 0));
        }

        let mut state = self.state.write();
        let state = &mut *state;
        self.ensure_index(state)?;

        let offset = if append { state.inode.size } else { offset };
        if offset >= MAX_FILE_SIZE {
            return Err(EmberError::FileTooBig);
        }
        let count = u64::min(data.len() as u64, MAX_FILE_SIZE - offset) as usize;
        let data = &data[..count];

        // Step one: make the whole range allocated, one atomic step with the
        // allocated-space counter.
        let mut tx = FileTx::begin(&self.heap);
        match allocate_interval(
            &mut tx,
            &mut state.table,
            state.index.as_ref().expect("index present"),
            state.inode.size,
            offset,
            count as u64,
            self.heap.overallocate_on_append(),
        ) {
            Ok(delta) => {
                if delta > 0 {
                    tx.stage_allocated_space(state.inode.allocated_space + delta);
                }
                Self::finish_commit(state, tx);
            }
            Err(err) => {
                tx.abort(&mut state.table);
                return Err(err);
            }
        }

        // Step two: copy the payload bytes and publish size and mtime.
        // The range is fully backed now, so this transaction cannot fail.
        let mut tx = FileTx::begin(&self.heap);
        write_range(
            &mut tx,
            &mut state.table,
            state.index.as_ref().expect("index present"),
            hint,
            state.generation,
            offset,
            data,
        );
        let end = offset + count as u64;
        if end > state.inode.size {
            tx.stage_size(end);
        }
        tx.stage_mtime(Timespec::now());
        Self::finish_commit(state, tx);

        Ok((offset, count))
    }

    // ── Resizing ────────────────────────────────────────────────────────

    /// Set the file size, freeing the tail or allocating the extension.
    pub fn truncate(&self, size: u64) -> Result<()> {
        if size > MAX_FILE_SIZE {
            return Err(EmberError::FileTooBig);
        }

        let mut state = self.state.write();
        let state = &mut *state;
        self.ensure_index(state)?;
        debug!(from = state.inode.size, to = size, "truncate");

        let mut tx = FileTx::begin(&self.heap);
        let result = (|| -> Result<u64> {
            let index = state.index.as_ref().expect("index present");
            let freed = remove_interval(
                &mut tx,
                &mut state.table,
                index,
                size,
                u64::MAX - size,
            )?;
            let mut space = state.inode.allocated_space - freed;
            if state.inode.size < size {
                // The index has not seen the removal's staged diff yet, but
                // every key that diff removes lies at or beyond
                // round_up(size) — above anything this allocation (which
                // ends at round_up(size)) can look up.
                space += allocate_interval(
                    &mut tx,
                    &mut state.table,
                    index,
                    state.inode.size,
                    state.inode.size,
                    size - state.inode.size,
                    false,
                )?;
            }
            Ok(space)
        })();

        match result {
            Ok(space) => {
                tx.stage_allocated_space(space);
                if state.inode.size != size {
                    tx.stage_size(size);
                    tx.stage_mtime(Timespec::now());
                }
                Self::finish_commit(state, tx);
                Ok(())
            }
            Err(err) => {
                tx.abort(&mut state.table);
                Err(err)
            }
        }
    }

    /// Back or punch `[offset, offset + length)`. Arguments are already
    /// validated by the handle layer.
    pub(crate) fn fallocate_validated(
        &self,
        punch_hole: bool,
        keep_size: bool,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        let mut state = self.state.write();
        let state = &mut *state;
        self.ensure_index(state)?;
        debug!(punch_hole, keep_size, offset, length, "fallocate");

        let mut tx = FileTx::begin(&self.heap);
        let index = state.index.as_ref().expect("index present");
        let result = if punch_hole {
            remove_interval(&mut tx, &mut state.table, index, offset, length)
                .map(|freed| state.inode.allocated_space - freed)
        } else {
            allocate_interval(
                &mut tx,
                &mut state.table,
                index,
                state.inode.size,
                offset,
                length,
                false,
            )
            .map(|delta| state.inode.allocated_space + delta)
        };

        match result {
            Ok(space) => {
                tx.stage_allocated_space(space);
                if !punch_hole && !keep_size {
                    let end = offset + length;
                    if state.inode.size < end {
                        tx.stage_size(end);
                        tx.stage_mtime(Timespec::now());
                    }
                }
                Self::finish_commit(state, tx);
                Ok(())
            }
            Err(err) => {
                tx.abort(&mut state.table);
                Err(err)
            }
        }
    }

    // ── Scanning and metadata ───────────────────────────────────────────

    /// `lseek(SEEK_DATA)` against the current extent map.
    pub fn seek_data(&self, offset: u64) -> Result<u64> {
        self.with_index_read(|state| {
            scan::seek_data(
                &state.table,
                state.index.as_ref().expect("index present"),
                offset,
                state.inode.size,
            )
        })?
    }

    /// `lseek(SEEK_HOLE)` against the current extent map.
    pub fn seek_hole(&self, offset: u64) -> Result<u64> {
        self.with_index_read(|state| {
            scan::seek_hole(
                &state.table,
                state.index.as_ref().expect("index present"),
                offset,
                state.inode.size,
            )
        })?
    }

    /// Current file size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.read().inode.size
    }

    /// File metadata snapshot. Recomputes the allocated-space sum only when
    /// a structural change invalidated the cache.
    pub fn stat(&self) -> FileStat {
        {
            let state = self.state.read();
            if let Some(allocated) = state.allocated_cache {
                return Self::stat_from(&state.inode, allocated);
            }
        }
        let mut state = self.state.write();
        let state = &mut *state;
        let allocated = match state.allocated_cache {
            Some(allocated) => allocated,
            None => {
                let allocated = allocated_bytes(&state.table);
                state.allocated_cache = Some(allocated);
                allocated
            }
        };
        Self::stat_from(&state.inode, allocated)
    }

    fn stat_from(inode: &Inode, allocated: u64) -> FileStat {
        FileStat {
            size: inode.size,
            allocated_bytes: allocated,
            blocks: stat_blocks(allocated),
            mtime: inode.mtime,
            atime: inode.atime,
        }
    }

    /// Number of extents currently backing the file (diagnostics/tests).
    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.state.read().table.len()
    }
}
