//! Interval allocator / deallocator.
//!
//! `allocate_interval` makes `[offset, offset + len)` backed by storage,
//! `remove_interval` makes it a hole again. Each runs inside one [`FileTx`]
//! together with whatever metadata the caller stages; on abort every
//! mutation made so far is rolled back before the error surfaces.
//!
//! The allocation walk processes the low edge of the remaining interval each
//! iteration, with the cursor at the extent closest at-or-before the edge:
//!
//! 1. edge inside the cursor extent — skip the intersection;
//! 2. edge in a hole — allocate a gap-filling extent (bounded by the next
//!    extent's start, or by the whole remaining interval at the tail);
//! 3. no extents at all — allocate the first, covering as much as one
//!    extent may;
//! 4. edge before the first extent — allocate up to that extent's start.
//!
//! Removal walks right-to-left from the extent at-or-before the interval's
//! last byte: wholly covered extents are deleted, a strictly interior punch
//! splits the extent in two, and edge overlaps shrink it (shifting payload
//! bytes when the left edge moves). Partial-granule edges of the request are
//! zeroed but stay allocated, matching punch-hole semantics.

use crate::index::OffsetIndex;
use crate::list::ExtentTable;
use crate::txn::FileTx;
use ember_error::{EmberError, Result};
use tracing::trace;

/// Request growth applied to appending writes, to amortize the next append.
#[must_use]
pub fn overallocate_size(size: u64) -> u64 {
    if size <= 4096 {
        16 * 1024
    } else if size <= 64 * 1024 {
        256 * 1024
    } else if size <= 1024 * 1024 {
        4 * 1024 * 1024
    } else if size <= 64 * 1024 * 1024 {
        64 * 1024 * 1024
    } else {
        size
    }
}

/// Is a write of `[offset, offset + size)` going to append past both the
/// file size and the last allocated extent?
fn is_append(
    table: &ExtentTable,
    index: &OffsetIndex,
    file_size: u64,
    offset: u64,
    size: u64,
) -> bool {
    let Some(end) = offset.checked_add(size) else {
        return false;
    };
    if file_size >= end {
        return false;
    }
    match index.find_closest(u64::MAX) {
        None => true,
        Some(last) => table.get(last).end() < end,
    }
}

/// Back `[offset, offset + size)` with storage, returning the number of
/// newly allocated bytes.
///
/// The interval is expanded outward to whole granules first; ranges already
/// covered allocate nothing, so repeating a call is free. With
/// `overallocate` set, appending requests are grown by the ladder in
/// [`overallocate_size`] before expansion.
pub fn allocate_interval(
    tx: &mut FileTx<'_>,
    table: &mut ExtentTable,
    index: &OffsetIndex,
    file_size: u64,
    offset: u64,
    size: u64,
    overallocate: bool,
) -> Result<u64> {
    debug_assert!(size > 0);

    let size = if overallocate && is_append(table, index, file_size, offset, size) {
        overallocate_size(size)
    } else {
        size
    };

    let granularity = tx.granularity();
    let (mut offset, mut size) = granularity
        .expand_to_full_pages(offset, size)
        .ok_or(EmberError::Overflow)?;
    let max_len = u64::from(granularity.max_extent_len());

    // Start at the extent with the highest offset at or before the interval;
    // it does not necessarily intersect the interval.
    let mut cursor = index.find_closest(offset);
    let mut allocated = 0_u64;

    while size > 0 {
        match cursor {
            // Case 1: not in a hole, skip over the intersection.
            Some(id) if table.get(id).contains(offset) => {
                let available = table.get(id).end() - offset;
                if available >= size {
                    break;
                }
                offset += available;
                size -= available;
            }
            // Case 3: no extents in the file at all.
            None if table.head().is_none() => {
                let count = size.min(max_len);
                let payload = tx.alloc_payload(count as u32)?;
                cursor = Some(tx.insert_extent(table, None, offset, count as u32, payload, 0));
                allocated += count;
            }
            // Case 4: in a hole before the first extent. The new extent must
            // not intersect the original first extent.
            None => {
                let first = table.head().expect("non-empty table");
                let first_offset = table.get(first).offset;
                let count = size.min(first_offset - offset).min(max_len);
                let payload = tx.alloc_payload(count as u32)?;
                cursor = Some(tx.insert_extent(table, None, offset, count as u32, payload, 0));
                allocated += count;
            }
            // Case 2, at the tail: after the last allocated extent.
            Some(id) if table.next(id).is_none() => {
                let count = size.min(max_len);
                let payload = tx.alloc_payload(count as u32)?;
                cursor = Some(tx.insert_extent(table, Some(id), offset, count as u32, payload, 0));
                allocated += count;
            }
            // Case 2, between two extents: fill the hole, or step forward
            // when there is none.
            Some(id) => {
                let next = table.next(id).expect("cursor has a successor");
                let hole = table.get(next).offset - offset;
                if hole > 0 {
                    let count = size.min(hole).min(max_len);
                    let payload = tx.alloc_payload(count as u32)?;
                    cursor =
                        Some(tx.insert_extent(table, Some(id), offset, count as u32, payload, 0));
                    allocated += count;
                } else {
                    cursor = Some(next);
                }
            }
        }
    }

    trace!(allocated, "allocate_interval");
    Ok(allocated)
}

/// Zero every initialized payload byte in `[start, end)` without changing
/// the extent layout. Used for the partial-granule edges of a removal.
fn zero_covered_range(
    tx: &mut FileTx<'_>,
    table: &ExtentTable,
    index: &OffsetIndex,
    start: u64,
    end: u64,
) {
    if start >= end {
        return;
    }
    let mut cursor = match index.find_closest(start) {
        Some(id) => Some(id),
        None => table.head(),
    };
    while let Some(id) = cursor {
        let rec = table.get(id);
        if rec.offset >= end {
            break;
        }
        let lo = rec.offset.max(start);
        let hi = rec.end().min(end);
        if lo < hi && rec.is_initialized() {
            let payload = rec.payload;
            let in_payload = (lo - rec.offset) as usize;
            tx.zero_payload_range(payload, in_payload, (hi - lo) as usize);
        }
        cursor = table.next(id);
    }
}

/// Unback `[offset, offset + len)`, returning the bytes freed.
///
/// Whole granules inside the interval are removed from the file; partial
/// granules at its edges are zeroed but stay allocated. Freed bytes count
/// only the removed (structural) portion, so the caller can subtract the
/// result from the file's allocated-space counter.
pub fn remove_interval(
    tx: &mut FileTx<'_>,
    table: &mut ExtentTable,
    index: &OffsetIndex,
    offset: u64,
    len: u64,
) -> Result<u64> {
    debug_assert!(len > 0);

    let granularity = tx.granularity();
    let end = offset.saturating_add(len);
    let (inner_offset, inner_len) = granularity.narrow_to_full_pages(offset, len);
    let inner_end = inner_offset + inner_len;

    // Zero the protruding partial granules first; they remain allocated.
    if inner_len == 0 {
        zero_covered_range(tx, table, index, offset, end);
        return Ok(0);
    }
    zero_covered_range(tx, table, index, offset, inner_offset);
    if end > inner_end {
        zero_covered_range(tx, table, index, inner_end, end);
    }

    let mut freed = 0_u64;
    let mut cursor = index.find_closest(inner_end - 1);

    while let Some(id) = cursor {
        let rec = table.get(id).clone();
        if rec.end() <= inner_offset {
            break;
        }

        if rec.offset >= inner_offset && rec.end() <= inner_end {
            // Wholly contained: deallocate the extent and its payload.
            freed += u64::from(rec.length);
            cursor = tx.remove_extent(table, id);
            tx.free_payload(rec.payload);
        } else if rec.offset < inner_offset && rec.end() > inner_end {
            // Strict interior punch: split into left and right remainders.
            let left_len = inner_offset - rec.offset;
            let right_len = rec.end() - inner_end;
            let right_payload = tx.alloc_payload(right_len as u32)?;
            if rec.is_initialized() {
                tx.copy_between_payloads(
                    rec.payload,
                    (inner_end - rec.offset) as usize,
                    right_payload,
                    0,
                    right_len as usize,
                );
            }
            tx.set_extent_length(table, id, left_len as u32);
            tx.insert_extent(table, Some(id), inner_end, right_len as u32, right_payload, rec.flags);
            freed += inner_end - inner_offset;
            // The interior case covers the whole interval; nothing remains.
            break;
        } else if rec.end() > inner_end {
            // Right edge of the interval: keep the extent's tail, shifting
            // its payload down to the new start.
            let dropped = inner_end - rec.offset;
            let kept = rec.end() - inner_end;
            if rec.is_initialized() {
                tx.copy_within_payload(rec.payload, dropped as usize, 0, kept as usize);
            }
            tx.set_extent_length(table, id, kept as u32);
            tx.set_extent_offset(table, id, inner_end);
            freed += dropped;
            cursor = table.prev(id);
        } else {
            // Left edge of the interval: truncate the extent's tail.
            let kept = inner_offset - rec.offset;
            freed += rec.end() - inner_offset;
            tx.set_extent_length(table, id, kept as u32);
            cursor = table.prev(id);
        }
    }

    trace!(freed, "remove_interval");
    Ok(freed)
}
