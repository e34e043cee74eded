//! Byte copying between user buffers and extent payloads.
//!
//! `read_range` and `write_range` walk a file range extent by extent. The
//! first and last extents of a range are special in that only part of their
//! content is touched; everything in between is copied whole. Reads may
//! cross holes (they produce zeros); writes expect the range to be fully
//! allocated already — the caller runs the interval allocator first.

use ember_extent::{BlockHint, ExtentTable, FileTx, OffsetIndex, EXTENT_INITIALIZED};
use ember_txn::Heap;

/// Copy out of the file into `buf`, starting at `offset`.
///
/// The caller has already clamped `buf` so the range ends at or before the
/// file size. Holes and never-written (fallocated) extents read as zeros.
/// The hint is updated to the last extent visited.
pub(crate) fn read_range(
    heap: &Heap,
    table: &ExtentTable,
    index: &OffsetIndex,
    hint: &mut BlockHint,
    generation: u64,
    mut offset: u64,
    buf: &mut [u8],
) {
    let mut cursor = hint.lookup_or_refresh(table, index, offset, generation);
    let mut remaining = buf.len();
    let mut pos = 0_usize;

    while remaining > 0 {
        match cursor {
            Some(id) if table.get(id).contains(offset) => {
                let rec = table.get(id);
                let in_block_start = (offset - rec.offset) as usize;
                let in_block_len = (u64::from(rec.length) - in_block_start as u64)
                    .min(remaining as u64) as usize;

                let out = &mut buf[pos..pos + in_block_len];
                if rec.is_initialized() {
                    heap.read_payload(rec.payload, in_block_start, out);
                } else {
                    // Allocated but never written: reads as zeros.
                    out.fill(0);
                }

                offset += in_block_len as u64;
                pos += in_block_len;
                remaining -= in_block_len;
                hint.record(id, generation);
                cursor = table.next(id);
            }
            _ => {
                // In a hole: zero-fill until the next extent (or the end of
                // the requested range when no extent follows). The cursor is
                // either behind the offset (the initial at-or-before lookup)
                // or already past it (an advanced cursor after a consumed
                // extent) — in the latter case the cursor itself bounds the
                // hole.
                let following = match cursor {
                    Some(id) if table.get(id).offset > offset => Some(id),
                    Some(id) => table.next(id),
                    None => table.head(),
                };
                let mut hole_len = remaining as u64;
                if let Some(next) = following {
                    let next_offset = table.get(next).offset;
                    if next_offset > offset {
                        hole_len = hole_len.min(next_offset - offset);
                    } else {
                        // The "hole" closed: the next extent starts at or
                        // before the offset (we arrived via a non-covering
                        // closest extent). Step onto it.
                        cursor = following;
                        continue;
                    }
                }
                let hole_len = hole_len as usize;
                buf[pos..pos + hole_len].fill(0);

                offset += hole_len as u64;
                pos += hole_len;
                remaining -= hole_len;
                cursor = following;
            }
        }
    }
}

/// Copy `data` into the file at `offset`.
///
/// Every byte of the range must already be covered by an extent. The first
/// write into an extent zero-fills the parts of it the write does not cover
/// and marks it initialized, all inside the caller's transaction.
pub(crate) fn write_range(
    tx: &mut FileTx<'_>,
    table: &mut ExtentTable,
    index: &OffsetIndex,
    hint: &mut BlockHint,
    generation: u64,
    mut offset: u64,
    data: &[u8],
) {
    let mut cursor = hint.lookup_or_refresh(table, index, offset, generation);
    let mut pos = 0_usize;

    while pos < data.len() {
        let id = cursor.expect("write range is fully allocated");
        if !table.get(id).contains(offset) {
            cursor = table.next(id);
            continue;
        }

        let rec = table.get(id);
        let payload = rec.payload;
        let length = u64::from(rec.length);
        let in_block_start = (offset - rec.offset) as usize;
        let in_block_len =
            (length - in_block_start as u64).min((data.len() - pos) as u64) as usize;

        if !rec.is_initialized() {
            // First write into this extent: zero everything the write does
            // not cover, then mark it initialized so later writes skip this.
            let flags = rec.flags;
            tx.zero_payload_range(payload, 0, in_block_start);
            let tail_start = in_block_start + in_block_len;
            tx.zero_payload_range(payload, tail_start, length as usize - tail_start);
            tx.set_extent_flags(table, id, flags | EXTENT_INITIALIZED);
        }

        tx.write_payload(payload, in_block_start, &data[pos..pos + in_block_len]);

        offset += in_block_len as u64;
        pos += in_block_len;
        hint.record(id, generation);
        cursor = table.next(id);
    }
}
