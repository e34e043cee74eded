//! Volatile offset index: a derived search structure over the extent list.
//!
//! Keyed by extent start offset, the index answers "which extent starts at or
//! immediately before this offset" in `O(log n)`. Entries carry the extent's
//! length so range-overlap checks never have to consult the list — the index
//! stays verifiable while a transaction's staged diff is being replayed.
//!
//! The index has no persistence guarantee: when the in-memory copy is missing
//! it is rebuilt from the durable list with [`OffsetIndex::build`], and
//! committed transactions patch it by applying their staged [`IndexDiff`].
//! It is never mutated while a transaction is still able to abort.
//!
//! Overlapping inserts and removals of unregistered extents are caller bugs,
//! not recoverable conditions; both panic.

use crate::list::{ExtentId, ExtentTable};
use ember_error::{EmberError, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    id: ExtentId,
    length: u32,
}

/// Offset-keyed index over a file's extents.
#[derive(Debug, Default)]
pub struct OffsetIndex {
    map: BTreeMap<u64, IndexEntry>,
}

impl OffsetIndex {
    /// Empty index (a valid state, distinct from "absent, needs rebuild").
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index mirroring the current extent list.
    ///
    /// `extent_cap` bounds how many extents the index may hold; exceeding it
    /// fails retryably without touching any durable state. The walk visits
    /// records in discovery order — the index is what imposes offset order.
    pub fn build(table: &ExtentTable, extent_cap: Option<usize>) -> Result<Self> {
        if let Some(cap) = extent_cap {
            if table.len() > cap {
                return Err(EmberError::IndexBuild(format!(
                    "{} extents exceed index cap {cap}",
                    table.len()
                )));
            }
        }
        let mut index = Self::new();
        for (id, rec) in table.iter() {
            index.insert(rec.offset, rec.length, id);
        }
        Ok(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Extent with the greatest start offset `<=` the query offset.
    ///
    /// Returns `None` when every extent starts after `offset`; callers that
    /// then need the first extent consult the list head. Querying with
    /// `u64::MAX` yields the last extent of the file.
    #[must_use]
    pub fn find_closest(&self, offset: u64) -> Option<ExtentId> {
        self.map.range(..=offset).next_back().map(|(_, e)| e.id)
    }

    /// Register an extent covering `[offset, offset + length)`.
    ///
    /// # Panics
    /// When the range overlaps a registered neighbor or another extent
    /// already starts at the same offset — a programming-invariant
    /// violation, not a recoverable error.
    pub fn insert(&mut self, offset: u64, length: u32, id: ExtentId) {
        assert!(length > 0, "offset index: zero-length insert");
        let end = offset
            .checked_add(u64::from(length))
            .expect("extent end overflows");
        if let Some((&pred_off, pred)) = self.map.range(..=offset).next_back() {
            assert!(
                pred_off != offset,
                "offset index: duplicate start offset {offset:#x}"
            );
            assert!(
                pred_off + u64::from(pred.length) <= offset,
                "offset index: insert overlaps predecessor"
            );
        }
        if let Some((&succ_off, _)) = self.map.range(offset..).next() {
            assert!(end <= succ_off, "offset index: insert overlaps successor");
        }
        self.map.insert(offset, IndexEntry { id, length });
    }

    /// Unregister an extent by identity.
    ///
    /// # Panics
    /// When no extent is registered at `offset`, or a different extent is —
    /// removal of an unknown extent is a programming-invariant violation.
    pub fn remove(&mut self, offset: u64, id: ExtentId) {
        let removed = self.map.remove(&offset);
        assert_eq!(
            removed.map(|e| e.id),
            Some(id),
            "offset index: removing an unregistered extent at {offset:#x}"
        );
    }

    /// Update the recorded length of the extent starting at `offset`.
    pub fn set_length(&mut self, offset: u64, id: ExtentId, length: u32) {
        assert!(length > 0, "offset index: zero-length update");
        let entry = self
            .map
            .get_mut(&offset)
            .expect("offset index: resizing an unregistered extent");
        assert_eq!(entry.id, id, "offset index: length update id mismatch");
        entry.length = length;
    }

    /// Move an extent's key from `old` to `new`, keeping its length.
    pub fn rekey(&mut self, old: u64, new: u64, id: ExtentId) {
        let entry = self
            .map
            .remove(&old)
            .expect("offset index: rekeying an unregistered extent");
        assert_eq!(entry.id, id, "offset index: rekey id mismatch");
        self.insert(new, entry.length, id);
    }

    /// Iterate `(offset, id)` pairs in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, ExtentId)> + '_ {
        self.map.iter().map(|(&off, e)| (off, e.id))
    }
}

#[derive(Debug)]
enum DiffOp {
    Insert {
        offset: u64,
        length: u32,
        id: ExtentId,
    },
    Remove {
        offset: u64,
        id: ExtentId,
    },
    SetLength {
        offset: u64,
        length: u32,
        id: ExtentId,
    },
    Rekey {
        old: u64,
        new: u64,
        id: ExtentId,
    },
}

/// Index mutations staged by an in-flight transaction.
///
/// The diff is recorded while the durable list is being mutated and applied
/// to the index only after the transaction commits; an abort simply drops
/// it, so the index and the (rolled-back) list never disagree. Entries are
/// applied in recording order, which mirrors the list mutation order, so the
/// index passes through the same sequence of consistent states the list did.
#[derive(Debug, Default)]
pub struct IndexDiff {
    ops: Vec<DiffOp>,
}

impl IndexDiff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn stage_insert(&mut self, offset: u64, length: u32, id: ExtentId) {
        self.ops.push(DiffOp::Insert { offset, length, id });
    }

    pub fn stage_remove(&mut self, offset: u64, id: ExtentId) {
        self.ops.push(DiffOp::Remove { offset, id });
    }

    pub fn stage_set_length(&mut self, offset: u64, length: u32, id: ExtentId) {
        self.ops.push(DiffOp::SetLength { offset, length, id });
    }

    pub fn stage_rekey(&mut self, old: u64, new: u64, id: ExtentId) {
        self.ops.push(DiffOp::Rekey { old, new, id });
    }

    /// Apply the staged mutations in recording order.
    pub(crate) fn apply(self, index: &mut OffsetIndex) {
        for op in self.ops {
            match op {
                DiffOp::Insert { offset, length, id } => index.insert(offset, length, id),
                DiffOp::Remove { offset, id } => index.remove(offset, id),
                DiffOp::SetLength { offset, length, id } => index.set_length(offset, id, length),
                DiffOp::Rekey { old, new, id } => index.rekey(old, new, id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::ListUndo;
    use ember_txn::{Heap, HeapOptions, PayloadId};

    struct Fixture {
        heap: Heap,
        table: ExtentTable,
        undo: Vec<ListUndo>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                heap: Heap::new(HeapOptions::default()).unwrap(),
                table: ExtentTable::new(),
                undo: Vec::new(),
            }
        }

        fn payload(&self) -> PayloadId {
            let mut tx = self.heap.begin();
            let id = tx.alloc_payload(self.heap.granularity().get()).unwrap();
            tx.commit();
            id
        }

        /// Append an extent of one granule at `offset` after `after`.
        fn push(&mut self, after: Option<ExtentId>, offset: u64) -> ExtentId {
            let g = self.heap.granularity().get();
            let payload = self.payload();
            self.table
                .insert_after(after, offset, g, payload, 0, &mut self.undo)
        }
    }

    #[test]
    fn find_closest_semantics() {
        let mut fx = Fixture::new();
        let g = u64::from(fx.heap.granularity().get());
        let a = fx.push(None, 2 * g);
        let b = fx.push(Some(a), 6 * g);
        let index = OffsetIndex::build(&fx.table, None).unwrap();

        // Before every extent: None, callers consult the list head.
        assert_eq!(index.find_closest(0), None);
        assert_eq!(index.find_closest(2 * g - 1), None);
        // Exact start and interior offsets resolve to the covering extent.
        assert_eq!(index.find_closest(2 * g), Some(a));
        assert_eq!(index.find_closest(3 * g), Some(a));
        // Between extents: the one before.
        assert_eq!(index.find_closest(5 * g), Some(a));
        assert_eq!(index.find_closest(6 * g), Some(b));
        // Max offset selects the last extent ("closest to EOF" lookup).
        assert_eq!(index.find_closest(u64::MAX), Some(b));
    }

    #[test]
    fn build_on_empty_table_is_empty_index() {
        let fx = Fixture::new();
        let index = OffsetIndex::build(&fx.table, None).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.find_closest(u64::MAX), None);
    }

    #[test]
    fn build_respects_extent_cap() {
        let mut fx = Fixture::new();
        let g = u64::from(fx.heap.granularity().get());
        let a = fx.push(None, 0);
        let b = fx.push(Some(a), 2 * g);
        fx.push(Some(b), 4 * g);

        assert!(OffsetIndex::build(&fx.table, Some(3)).is_ok());
        let err = OffsetIndex::build(&fx.table, Some(2)).unwrap_err();
        assert!(matches!(err, EmberError::IndexBuild(_)));
        // Retry after raising the cap succeeds: nothing was consumed.
        assert!(OffsetIndex::build(&fx.table, Some(16)).is_ok());
    }

    #[test]
    #[should_panic(expected = "overlaps predecessor")]
    fn overlapping_insert_panics() {
        let mut index = OffsetIndex::new();
        let mut fx = Fixture::new();
        let g = fx.heap.granularity().get();
        let a = fx.push(None, 0);
        index.insert(0, g, a);
        // Starts inside `a`'s range.
        index.insert(u64::from(g) / 2, g, a);
    }

    #[test]
    #[should_panic(expected = "duplicate start offset")]
    fn duplicate_offset_panics() {
        let mut index = OffsetIndex::new();
        let mut fx = Fixture::new();
        let g = fx.heap.granularity().get();
        let a = fx.push(None, 0);
        index.insert(0, g, a);
        index.insert(0, g, a);
    }

    #[test]
    #[should_panic(expected = "unregistered extent")]
    fn removing_unknown_extent_panics() {
        let mut fx = Fixture::new();
        let a = fx.push(None, 0);
        let mut index = OffsetIndex::new();
        index.remove(0, a);
    }

    #[test]
    fn diff_apply_mirrors_list_mutation_order() {
        let mut fx = Fixture::new();
        let g = u64::from(fx.heap.granularity().get());
        let a = fx.push(None, 0);
        let b = fx.push(Some(a), 2 * g);
        let mut index = OffsetIndex::build(&fx.table, None).unwrap();

        // Simulate a committed transaction: shrink `a`, remove `b`, insert a
        // replacement into the space `b` vacated.
        let mut diff = IndexDiff::new();
        fx.table.set_length(a, g as u32 / 2, &mut fx.undo);
        diff.stage_set_length(0, g as u32 / 2, a);
        fx.table.remove(b, &mut fx.undo);
        diff.stage_remove(2 * g, b);
        let c = fx.push(Some(a), 2 * g);
        diff.stage_insert(2 * g, g as u32, c);

        diff.apply(&mut index);
        assert_eq!(index.len(), 2);
        assert_eq!(index.find_closest(2 * g), Some(c));
        assert_eq!(index.find_closest(g), Some(a));
    }

    #[test]
    fn rekey_preserves_length() {
        let mut index = OffsetIndex::new();
        let mut fx = Fixture::new();
        let g = fx.heap.granularity().get();
        let a = fx.push(None, 0);
        index.insert(0, g, a);

        index.rekey(0, u64::from(g), a);
        assert_eq!(index.find_closest(0), None);
        assert_eq!(index.find_closest(u64::from(g)), Some(a));
    }

    #[test]
    fn closest_offset_monotonicity() {
        let mut fx = Fixture::new();
        let g = u64::from(fx.heap.granularity().get());
        let mut after = None;
        for i in [1_u64, 4, 5, 9] {
            after = Some(fx.push(after, i * g));
        }
        let index = OffsetIndex::build(&fx.table, None).unwrap();

        let mut last_start: Option<u64> = None;
        for probe in (0..12 * g).step_by(g as usize / 4) {
            if let Some(id) = index.find_closest(probe) {
                let start = fx.table.get(id).offset;
                if let Some(prev) = last_start {
                    assert!(start >= prev, "find_closest went backwards at {probe:#x}");
                }
                last_start = Some(start);
            } else {
                assert_eq!(last_start, None, "defined then undefined as offsets grow");
            }
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// `find_closest` agrees with a linear scan over arbitrary
            /// non-overlapping extent layouts.
            #[test]
            fn find_closest_matches_linear_scan(
                gaps in proptest::collection::vec(0_u64..4, 1..24),
                probes in proptest::collection::vec(0_u64..200, 32),
            ) {
                let mut fx = Fixture::new();
                let g = u64::from(fx.heap.granularity().get());

                let mut starts = Vec::new();
                let mut cursor = 0_u64;
                let mut after = None;
                for gap in gaps {
                    cursor += gap * g;
                    after = Some(fx.push(after, cursor));
                    starts.push(cursor);
                    cursor += g;
                }
                let index = OffsetIndex::build(&fx.table, None).unwrap();

                for probe in probes {
                    let probe = probe * g / 2;
                    let expect = starts.iter().rev().find(|&&s| s <= probe).copied();
                    let got = index.find_closest(probe).map(|id| fx.table.get(id).offset);
                    prop_assert_eq!(got, expect);
                }
            }
        }
    }
}
