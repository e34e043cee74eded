#![forbid(unsafe_code)]
//! Persistent-memory file engine.
//!
//! Files live inside a byte-addressable pool as extent-mapped byte ranges
//! with POSIX-like read/write/seek/truncate/fallocate/stat semantics.
//! This crate re-exports the public surface of the workspace members:
//! [`ember_file`] for the call layer, [`ember_extent`] for the extent core,
//! [`ember_txn`] for the durable-heap boundary.

pub use ember_error::{EmberError, Result};
pub use ember_file::{FileHandle, FileNode, FilePool, FileStat, OpenFlags, Whence};
pub use ember_txn::{FaultPlan, Heap, HeapOptions};
pub use ember_types::{Granularity, Timespec, MIN_EXTENT_SIZE};

pub use ember_extent as extent;
pub use ember_file as file;
pub use ember_txn as txn;
pub use ember_types as types;
