//! Per-handle block-pointer cache.
//!
//! Sequential I/O tends to hit the same extent (or its successor) on every
//! call; the hint remembers the last extent a handle touched so the common
//! case skips the index. A hint is trusted only when its recorded generation
//! matches the file's current one — the counter bumps on every index rebuild
//! and every committed extent mutation, so a matching generation proves the
//! hinted id is still the same live extent. Correctness never depends on the
//! hint being warm; a mismatch just costs one `find_closest`.

use crate::index::OffsetIndex;
use crate::list::{ExtentId, ExtentTable};

/// Cached extent pointer plus the generation it was observed under.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockHint {
    slot: Option<(ExtentId, u64)>,
}

impl BlockHint {
    /// Cold hint.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the cached extent.
    pub fn clear(&mut self) {
        self.slot = None;
    }

    /// Remember `id` as the handle's last-touched extent.
    pub fn record(&mut self, id: ExtentId, generation: u64) {
        self.slot = Some((id, generation));
    }

    /// Resolve the extent at-or-before `offset`, reusing the hint when it is
    /// still valid and covers the offset; otherwise fall back to a full
    /// index lookup and refresh the hint.
    pub fn lookup_or_refresh(
        &mut self,
        table: &ExtentTable,
        index: &OffsetIndex,
        offset: u64,
        generation: u64,
    ) -> Option<ExtentId> {
        if let Some((id, observed)) = self.slot {
            if observed == generation && table.get(id).contains(offset) {
                return Some(id);
            }
        }

        let found = index.find_closest(offset);
        self.slot = found.map(|id| (id, generation));
        found
    }
}
