//! Open file handles: cursor, access flags, and the POSIX call surface.
//!
//! A handle owns its file offset and block-pointer hint behind its own
//! mutex; the file's shared state is only touched through [`FileNode`].
//! Positional reads and writes (`pread`/`pwrite`) leave the cursor alone,
//! exactly like their syscall counterparts.

use crate::node::{FileNode, FileStat};
use ember_error::{EmberError, Result};
use ember_extent::BlockHint;
use parking_lot::Mutex;
use std::sync::Arc;

/// `fallocate` mode bit: keep the reported file size unchanged.
pub const FALLOC_FL_KEEP_SIZE: i32 = 0x01;
/// `fallocate` mode bit: deallocate the range (requires `KEEP_SIZE`).
pub const FALLOC_FL_PUNCH_HOLE: i32 = 0x02;
/// Unsupported `fallocate` modes, recognized for exact errno reporting.
pub const FALLOC_FL_COLLAPSE_RANGE: i32 = 0x08;
pub const FALLOC_FL_ZERO_RANGE: i32 = 0x10;
pub const FALLOC_FL_INSERT_RANGE: i32 = 0x20;

/// Access mode and behavior bits carried by an open handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    /// Every write positions at end-of-file first.
    pub append: bool,
    /// Suppress access-time updates on reads.
    pub noatime: bool,
}

impl OpenFlags {
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }
}

/// `lseek` origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
    Data,
    Hole,
}

#[derive(Debug, Default)]
struct Cursor {
    offset: u64,
    hint: BlockHint,
}

/// An open handle to a [`FileNode`].
#[derive(Debug)]
pub struct FileHandle {
    node: Arc<FileNode>,
    flags: OpenFlags,
    cursor: Mutex<Cursor>,
}

impl FileHandle {
    /// Open a handle with the given flags.
    #[must_use]
    pub fn open(node: Arc<FileNode>, flags: OpenFlags) -> Self {
        Self {
            node,
            flags,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    #[must_use]
    pub fn node(&self) -> &Arc<FileNode> {
        &self.node
    }

    fn require_read(&self) -> Result<()> {
        if self.flags.read {
            Ok(())
        } else {
            Err(EmberError::BadHandle("not open for reading".into()))
        }
    }

    fn require_write(&self) -> Result<()> {
        if self.flags.write {
            Ok(())
        } else {
            Err(EmberError::BadHandle("not open for writing".into()))
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Read at the cursor, advancing it by the bytes read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.require_read()?;
        let mut cursor = self.cursor.lock();
        let count =
            self.node
                .read_at(cursor.offset, buf, &mut cursor.hint, !self.flags.noatime)?;
        cursor.offset += count as u64;
        Ok(count)
    }

    /// Positional read; the cursor does not move.
    pub fn pread(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        self.require_read()?;
        if offset < 0 {
            return Err(EmberError::InvalidArgument("negative read offset".into()));
        }
        // Borrow the handle's hint but leave the offset alone.
        let mut hint = self.cursor.lock().hint;
        let count = self
            .node
            .read_at(offset as u64, buf, &mut hint, !self.flags.noatime)?;
        self.cursor.lock().hint = hint;
        Ok(count)
    }

    /// Scatter read at the cursor.
    pub fn read_vectored(&self, bufs: &mut [&mut [u8]]) -> Result<usize> {
        self.require_read()?;
        let mut cursor = self.cursor.lock();
        let mut total = 0_usize;
        for buf in bufs {
            let count =
                self.node
                    .read_at(cursor.offset, buf, &mut cursor.hint, !self.flags.noatime)?;
            cursor.offset += count as u64;
            total += count;
            if count < buf.len() {
                break; // end of file
            }
        }
        Ok(total)
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Write at the cursor (or at end of file for append handles),
    /// advancing the cursor past the written bytes.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.require_write()?;
        let mut cursor = self.cursor.lock();
        let (start, count) =
            self.node
                .write_at(cursor.offset, data, &mut cursor.hint, self.flags.append)?;
        cursor.offset = start + count as u64;
        Ok(count)
    }

    /// Positional write; the cursor does not move. Append handles still
    /// write at end of file, matching pwrite(2) on `O_APPEND` descriptors.
    pub fn pwrite(&self, data: &[u8], offset: i64) -> Result<usize> {
        self.require_write()?;
        if offset < 0 {
            return Err(EmberError::InvalidArgument("negative write offset".into()));
        }
        let mut hint = self.cursor.lock().hint;
        let (_, count) = self
            .node
            .write_at(offset as u64, data, &mut hint, self.flags.append)?;
        self.cursor.lock().hint = hint;
        Ok(count)
    }

    /// Gather write at the cursor.
    pub fn write_vectored(&self, bufs: &[&[u8]]) -> Result<usize> {
        self.require_write()?;
        let mut cursor = self.cursor.lock();
        let mut total = 0_usize;
        for data in bufs {
            let (start, count) =
                self.node
                    .write_at(cursor.offset, data, &mut cursor.hint, self.flags.append)?;
            cursor.offset = start + count as u64;
            total += count;
            if count < data.len() {
                break; // size limit reached
            }
        }
        Ok(total)
    }

    // ── Seeking ─────────────────────────────────────────────────────────

    /// Reposition the cursor; returns the resulting offset.
    pub fn seek(&self, offset: i64, whence: Whence) -> Result<u64> {
        let mut cursor = self.cursor.lock();
        let resolved = match whence {
            Whence::Set => {
                if offset < 0 {
                    // The resulting offset would be negative for a regular
                    // file.
                    return Err(EmberError::InvalidArgument("negative seek target".into()));
                }
                offset as u64
            }
            Whence::Cur => Self::relative_seek(cursor.offset, offset)?,
            Whence::End => Self::relative_seek(self.node.size(), offset)?,
            Whence::Data | Whence::Hole => {
                if offset < 0 {
                    return Err(EmberError::Nxio);
                }
                let from = offset as u64;
                if whence == Whence::Data {
                    self.node.seek_data(from)?
                } else {
                    self.node.seek_hole(from)?
                }
            }
        };
        cursor.offset = resolved;
        Ok(resolved)
    }

    /// `base + delta` with POSIX error reporting: `EINVAL` when the result
    /// goes negative via a negative delta, `EOVERFLOW` when it cannot be
    /// represented.
    fn relative_seek(base: u64, delta: i64) -> Result<u64> {
        let base = i64::try_from(base).map_err(|_| EmberError::Overflow)?;
        match base.checked_add(delta) {
            Some(result) if result >= 0 => Ok(result as u64),
            Some(_) => Err(EmberError::InvalidArgument(
                "seek before start of file".into(),
            )),
            None if delta < 0 => Err(EmberError::InvalidArgument(
                "seek before start of file".into(),
            )),
            None => Err(EmberError::Overflow),
        }
    }

    // ── Resizing and allocation ─────────────────────────────────────────

    /// `ftruncate(2)`.
    pub fn truncate(&self, length: i64) -> Result<()> {
        self.require_write()?;
        if length < 0 {
            return Err(EmberError::InvalidArgument("negative truncate".into()));
        }
        self.node.truncate(length as u64)
    }

    /// `fallocate(2)` with mode bits.
    pub fn fallocate(&self, mode: i32, offset: i64, length: i64) -> Result<()> {
        self.require_write()?;
        Self::check_fallocate_arguments(mode, offset, length)?;
        let punch_hole = mode & FALLOC_FL_PUNCH_HOLE != 0;
        let keep_size = mode & FALLOC_FL_KEEP_SIZE != 0;
        self.node
            .fallocate_validated(punch_hole, keep_size, offset as u64, length as u64)
    }

    /// `posix_fallocate(2)`: plain allocation, size may grow.
    pub fn posix_fallocate(&self, offset: i64, length: i64) -> Result<()> {
        self.fallocate(0, offset, length)
    }

    /// Argument checks that do not depend on the file being operated on.
    fn check_fallocate_arguments(mode: i32, offset: i64, length: i64) -> Result<()> {
        // "EINVAL - offset was less than 0, or len was less than or equal
        // to 0."
        if length <= 0 || offset < 0 {
            return Err(EmberError::InvalidArgument(
                "fallocate offset/length out of range".into(),
            ));
        }

        // "EFBIG - offset+len exceeds the maximum file size."
        if offset.checked_add(length).is_none() {
            return Err(EmberError::FileTooBig);
        }

        if mode & FALLOC_FL_COLLAPSE_RANGE != 0 {
            return Err(EmberError::Unsupported("FALLOC_FL_COLLAPSE_RANGE".into()));
        }
        if mode & FALLOC_FL_ZERO_RANGE != 0 {
            return Err(EmberError::Unsupported("FALLOC_FL_ZERO_RANGE".into()));
        }
        if mode & FALLOC_FL_INSERT_RANGE != 0 {
            return Err(EmberError::Unsupported("FALLOC_FL_INSERT_RANGE".into()));
        }

        if mode & FALLOC_FL_PUNCH_HOLE != 0 {
            // "The FALLOC_FL_PUNCH_HOLE flag must be ORed with
            // FALLOC_FL_KEEP_SIZE in mode" — never silently promoted to a
            // resize.
            if mode != (FALLOC_FL_PUNCH_HOLE | FALLOC_FL_KEEP_SIZE) {
                return Err(EmberError::Unsupported(
                    "PUNCH_HOLE without KEEP_SIZE".into(),
                ));
            }
        } else if mode & !FALLOC_FL_KEEP_SIZE != 0 {
            return Err(EmberError::InvalidArgument(
                "unknown fallocate mode bits".into(),
            ));
        }

        Ok(())
    }

    // ── Metadata ────────────────────────────────────────────────────────

    /// `fstat(2)` equivalent.
    #[must_use]
    pub fn stat(&self) -> FileStat {
        self.node.stat()
    }
}
