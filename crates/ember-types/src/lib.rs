#![forbid(unsafe_code)]
//! Shared primitive types for emberfs: byte-range arithmetic with explicit
//! overflow handling, the pool's allocation granularity, and timestamps.
//!
//! Offsets and lengths are plain `u64`/`u32` at API boundaries (matching the
//! on-media extent identity `(offset: u64, length: u32)`); everything that can
//! wrap goes through a checked helper instead of raw `+`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Smallest allocation unit of the pool, and the default granularity.
///
/// Every extent's offset and length are multiples of the granularity in
/// effect; partial-page requests are expanded outward before allocation.
pub const MIN_EXTENT_SIZE: u32 = 0x4000;

/// Accounting unit for `st_blocks`, fixed by stat(2) regardless of the
/// pool's actual granularity.
pub const STAT_BLOCK_SIZE: u64 = 512;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid granularity {value:#x}: {reason}")]
    InvalidGranularity { value: u32, reason: &'static str },
}

/// Validated pool granularity (power of two in `[0x1000, 0x4000000]`).
///
/// This is a format parameter supplied by the storage layer; the extent core
/// only consumes it. The default matches [`MIN_EXTENT_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Granularity(u32);

impl Granularity {
    /// Create a `Granularity` if `value` is a power of two in range.
    pub fn new(value: u32) -> Result<Self, GeometryError> {
        if !value.is_power_of_two() {
            return Err(GeometryError::InvalidGranularity {
                value,
                reason: "must be a power of two",
            });
        }
        if !(0x1000..=0x400_0000).contains(&value) {
            return Err(GeometryError::InvalidGranularity {
                value,
                reason: "must be in 0x1000..=0x4000000",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Largest single extent length expressible in a `u32` length field,
    /// rounded down to a whole number of granules.
    #[must_use]
    pub fn max_extent_len(self) -> u32 {
        u32::MAX - (u32::MAX % self.0)
    }

    /// Round `n` down to a granule boundary.
    #[must_use]
    pub fn round_down(self, n: u64) -> u64 {
        n & !u64::from(self.0 - 1)
    }

    /// Round `n` up to a granule boundary, `None` on overflow.
    #[must_use]
    pub fn round_up(self, n: u64) -> Option<u64> {
        let mask = u64::from(self.0 - 1);
        n.checked_add(mask).map(|v| v & !mask)
    }

    /// Grow `[offset, offset + length)` outward to whole granules.
    ///
    /// The resulting interval contains the original one. `None` when the
    /// rounded end would not fit in a `u64`.
    #[must_use]
    pub fn expand_to_full_pages(self, offset: u64, length: u64) -> Option<(u64, u64)> {
        let lead = offset % u64::from(self.0);
        let offset = offset - lead;
        let length = self.round_up(length.checked_add(lead)?)?;
        Some((offset, length))
    }

    /// Shrink `[offset, offset + length)` inward to whole granules.
    ///
    /// The resulting interval is contained by the original one and may be
    /// empty (length zero).
    #[must_use]
    pub fn narrow_to_full_pages(self, offset: u64, length: u64) -> (u64, u64) {
        let end = self.round_down(offset.saturating_add(length));
        let offset = match self.round_up(offset) {
            Some(o) => o,
            None => return (offset, 0),
        };
        if end > offset {
            (offset, end - offset)
        } else {
            (offset, 0)
        }
    }
}

impl Default for Granularity {
    fn default() -> Self {
        Self(MIN_EXTENT_SIZE)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// End offset of `[offset, offset + length)`, `None` on overflow.
#[must_use]
pub fn end_offset(offset: u64, length: u64) -> Option<u64> {
    offset.checked_add(length)
}

/// Convert a byte total to 512-byte stat blocks, rounding up.
#[must_use]
pub fn stat_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(STAT_BLOCK_SIZE)
}

/// Second/nanosecond timestamp, ordered chronologically.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    /// Current wall-clock time. Times before the epoch clamp to zero.
    #[must_use]
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                nsec: d.subsec_nanos(),
            },
            Err(_) => Self::default(),
        }
    }

    /// This timestamp shifted back by `secs` seconds (saturating).
    #[must_use]
    pub fn minus_secs(self, secs: i64) -> Self {
        Self {
            sec: self.sec.saturating_sub(secs),
            nsec: self.nsec,
        }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}
