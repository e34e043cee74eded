//! Hole/data scanner: `SEEK_DATA`, `SEEK_HOLE`, and allocated-space sums.
//!
//! Read-only traversals over the offset index and the extent list. The
//! caller guarantees the index is present (the file layer rebuilds it under
//! its write lock first); these functions themselves never mutate anything.
//!
//! Offsets at or past end-of-file follow observed filesystem behavior:
//! `seek_data` rejects `offset >= file_size` (there is no data at EOF, even
//! when `offset == file_size` exactly), `seek_hole` rejects only
//! `offset > file_size` (EOF is the start of the trailing hole).

use crate::index::OffsetIndex;
use crate::list::ExtentTable;
use ember_error::{EmberError, Result};

/// Find data at or after `offset`.
///
/// Inside an extent the offset is returned unchanged; in a hole the next
/// extent's start is returned; with no extent after the offset the file size
/// is returned (the trailing hole ends the search). `ENXIO` when `offset`
/// is not inside `[0, file_size)`.
pub fn seek_data(
    table: &ExtentTable,
    index: &OffsetIndex,
    offset: u64,
    file_size: u64,
) -> Result<u64> {
    if offset >= file_size {
        return Err(EmberError::Nxio);
    }

    let closest = match index.find_closest(offset) {
        None => {
            // Offset is before the first extent.
            return match table.head() {
                None => Ok(file_size), // no data in the whole file
                Some(first) => Ok(table.get(first).offset.min(file_size)),
            };
        }
        Some(id) => id,
    };

    if table.get(closest).contains(offset) {
        return Ok(offset);
    }

    match table.next(closest) {
        None => Ok(file_size), // no more data in the file
        Some(next) => Ok(table.get(next).offset.min(file_size)),
    }
}

/// Find a hole at or after `offset`.
///
/// Walks extents from the one at-or-before `offset`, accumulating covered
/// span, and returns the first uncovered offset: a gap between extents, the
/// point past the last extent, or `file_size` when extents run to EOF.
/// `ENXIO` when `offset` is not inside `[0, file_size]`.
pub fn seek_hole(
    table: &ExtentTable,
    index: &OffsetIndex,
    offset: u64,
    file_size: u64,
) -> Result<u64> {
    if offset > file_size {
        return Err(EmberError::Nxio);
    }

    let mut offset = offset;
    let mut cursor = index.find_closest(offset);

    while let Some(id) = cursor {
        if offset >= file_size {
            break;
        }
        let rec = table.get(id);
        let block_end = rec.end();
        if block_end >= offset {
            offset = block_end; // seek to the end of this extent
        }
        match table.next(id) {
            None => break, // the rest of the file is one hole
            Some(next) if offset < table.get(next).offset => break, // gap
            Some(next) => cursor = Some(next),
        }
    }

    Ok(offset.min(file_size))
}

/// Sum of all extent lengths — the allocated (non-hole) bytes of the file.
///
/// This is the full recomputation behind the file layer's cached value;
/// any allocate/remove invalidates that cache.
#[must_use]
pub fn allocated_bytes(table: &ExtentTable) -> u64 {
    table.iter().map(|(_, rec)| u64::from(rec.length)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::FileTx;
    use crate::Inode;
    use ember_txn::{Heap, HeapOptions};

    struct Fx {
        heap: Heap,
        table: ExtentTable,
        index: OffsetIndex,
        inode: Inode,
    }

    impl Fx {
        /// Build a file with one-granule extents at the given granule
        /// indices and the given size in granules.
        fn with_layout(granules: &[u64], size_granules: u64) -> Self {
            let heap = Heap::new(HeapOptions {
                block_size: Some(0x1000),
                ..HeapOptions::default()
            })
            .unwrap();
            let g = u64::from(heap.granularity().get());
            let mut table = ExtentTable::new();
            let mut index = OffsetIndex::new();
            let mut inode = Inode::new();

            let mut tx = FileTx::begin(&heap);
            let mut after = None;
            for &i in granules {
                let payload = tx.alloc_payload(g as u32).unwrap();
                after = Some(tx.insert_extent(&mut table, after, i * g, g as u32, payload, 0));
            }
            tx.stage_size(size_granules * g);
            tx.commit(&mut index, &mut inode);

            Self {
                heap,
                table,
                index,
                inode,
            }
        }

        fn g(&self) -> u64 {
            u64::from(self.heap.granularity().get())
        }

        fn data(&self, offset: u64) -> Result<u64> {
            seek_data(&self.table, &self.index, offset, self.inode.size)
        }

        fn hole(&self, offset: u64) -> Result<u64> {
            seek_hole(&self.table, &self.index, offset, self.inode.size)
        }
    }

    #[test]
    fn two_extents_with_gap() {
        // Extents [0, 0x1000) and [0x6000, 0x7000), size 0x7000.
        let fx = Fx::with_layout(&[0, 6], 7);

        assert_eq!(fx.hole(0x500), Ok(0x1000));
        assert_eq!(fx.data(0x1000), Ok(0x6000));
        assert_eq!(fx.data(0x7000), Err(EmberError::Nxio));
    }

    #[test]
    fn seek_data_inside_extent_returns_offset() {
        let fx = Fx::with_layout(&[0, 6], 7);
        assert_eq!(fx.data(0), Ok(0));
        assert_eq!(fx.data(0xFFF), Ok(0xFFF));
        assert_eq!(fx.data(0x6123), Ok(0x6123));
    }

    #[test]
    fn seek_data_in_trailing_hole_returns_size() {
        // Extent [0, 0x1000), size 0x3000: bytes past 0x1000 are a hole.
        let fx = Fx::with_layout(&[0], 3);
        assert_eq!(fx.data(0x1000), Ok(0x3000));
        assert_eq!(fx.data(0x2FFF), Ok(0x3000));
    }

    #[test]
    fn seek_data_on_fully_sparse_file() {
        let fx = Fx::with_layout(&[], 4);
        assert_eq!(fx.data(0), Ok(0x4000));
        assert_eq!(fx.data(0x3FFF), Ok(0x4000));
    }

    #[test]
    fn seek_hole_semantics() {
        let fx = Fx::with_layout(&[0, 1, 4], 6);
        let g = fx.g();

        // Adjacent extents accumulate: the hole starts after both.
        assert_eq!(fx.hole(0), Ok(2 * g));
        assert_eq!(fx.hole(g), Ok(2 * g));
        // Already in a hole: returned unchanged.
        assert_eq!(fx.hole(2 * g), Ok(2 * g));
        assert_eq!(fx.hole(3 * g), Ok(3 * g));
        // Inside the last extent: hole starts at its end.
        assert_eq!(fx.hole(4 * g), Ok(5 * g));
        // EOF itself is a valid query for SEEK_HOLE.
        assert_eq!(fx.hole(6 * g), Ok(6 * g));
        assert_eq!(fx.hole(6 * g + 1), Err(EmberError::Nxio));
    }

    #[test]
    fn seek_hole_clamps_to_file_size() {
        // Extent runs to EOF exactly: the hole is reported at EOF.
        let fx = Fx::with_layout(&[0, 1], 2);
        assert_eq!(fx.hole(0), Ok(2 * fx.g()));

        // Extent extends past the logical size (keep-size allocation):
        // the reported hole clamps to the size.
        let mut fx = Fx::with_layout(&[0], 1);
        fx.inode.size = 0x800;
        assert_eq!(fx.hole(0), Ok(0x800));
    }

    #[test]
    fn alternation_terminates_at_file_size() {
        let fx = Fx::with_layout(&[1, 2, 5, 8], 10);
        let size = fx.inode.size;

        let mut offsets = Vec::new();
        let mut at = 0_u64;
        loop {
            let d = match fx.data(at) {
                Ok(d) => d,
                Err(EmberError::Nxio) => break,
                Err(e) => panic!("unexpected error {e}"),
            };
            let h = fx.hole(d).unwrap();
            assert!(d >= at);
            assert!(h > d || (d == size && h == size));
            offsets.push(d);
            offsets.push(h);
            if h >= size {
                break;
            }
            at = h;
        }

        // Strictly increasing and terminating at file size.
        for pair in offsets.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(offsets.last(), Some(&size));
    }

    #[test]
    fn allocated_bytes_sums_lengths() {
        let fx = Fx::with_layout(&[0, 4, 9], 10);
        assert_eq!(allocated_bytes(&fx.table), 3 * fx.g());
        let empty = Fx::with_layout(&[], 0);
        assert_eq!(allocated_bytes(&empty.table), 0);
    }
}
