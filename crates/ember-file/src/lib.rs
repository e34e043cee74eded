#![forbid(unsafe_code)]
//! POSIX-shaped file operations over the extent core.
//!
//! [`FilePool`] owns the durable heap; each [`FileNode`] is one regular
//! file's in-memory wrapper (extent table, offset index, metadata) behind a
//! per-file reader/writer lock. [`FileHandle`] is one open descriptor:
//! cursor, access flags, and a generation-checked block-pointer hint.
//!
//! All operations are synchronous; they may block on the per-file lock or
//! on the transaction commit path, and an in-flight allocate/remove either
//! fully commits or fully rolls back — there is no cancellation.

mod data;
mod handle;
mod node;

pub use handle::{
    FileHandle, OpenFlags, Whence, FALLOC_FL_COLLAPSE_RANGE, FALLOC_FL_INSERT_RANGE,
    FALLOC_FL_KEEP_SIZE, FALLOC_FL_PUNCH_HOLE, FALLOC_FL_ZERO_RANGE,
};
pub use node::{FileNode, FileStat};

use ember_error::Result;
use ember_txn::{Heap, HeapOptions};
use std::sync::Arc;
use tracing::debug;

/// One mounted pool: the durable heap plus file factory.
///
/// Directory structure, naming, and path resolution live outside this
/// layer; the pool only hands out anonymous regular files.
#[derive(Debug)]
pub struct FilePool {
    heap: Arc<Heap>,
}

impl FilePool {
    /// Create a pool with the given heap geometry.
    pub fn new(options: HeapOptions) -> Result<Self> {
        let heap = Arc::new(Heap::new(options)?);
        debug!(granularity = heap.granularity().get(), "pool: open");
        Ok(Self { heap })
    }

    /// The pool's durable heap (shared with every file).
    #[must_use]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Create an empty regular file in the pool.
    #[must_use]
    pub fn create_file(&self) -> Arc<FileNode> {
        Arc::new(FileNode::new(Arc::clone(&self.heap)))
    }

    /// Open a handle to a file of this pool.
    #[must_use]
    pub fn open(&self, node: &Arc<FileNode>, flags: OpenFlags) -> FileHandle {
        FileHandle::open(Arc::clone(node), flags)
    }
}
