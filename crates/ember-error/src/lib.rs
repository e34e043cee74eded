#![forbid(unsafe_code)]
//! Error types for emberfs.
//!
//! # Error Taxonomy
//!
//! The extent core distinguishes three failure classes:
//!
//! | Class | Mechanism | Examples |
//! |-------|-----------|----------|
//! | Invariant violation | panic (caller bug, fail fast) | overlapping index insert, removing an unregistered extent |
//! | Resource exhaustion | `EmberError` value, retryable | `NoSpace`, `IndexBuild` |
//! | Range/argument error | `EmberError` value | `Nxio`, `FileTooBig`, `InvalidArgument` |
//!
//! Invariant violations are deliberately *not* represented as variants:
//! retrying an overlapping insert cannot succeed, so the index panics
//! instead of handing callers an error they would be tempted to handle.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`EmberError::to_errno`].
//! The match is exhaustive (no wildcard arm) so adding a variant is a compile
//! error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `NoSpace` | `ENOSPC` |
//! | `IndexBuild` | `ENOMEM` |
//! | `Nxio` | `ENXIO` |
//! | `FileTooBig` | `EFBIG` |
//! | `Overflow` | `EOVERFLOW` |
//! | `InvalidArgument` | `EINVAL` |
//! | `BadHandle` | `EBADF` |
//! | `Unsupported` | `EOPNOTSUPP` |
//!
//! String payloads are owned so errors cross thread and layer boundaries
//! without lifetime entanglement.

use thiserror::Error;

/// Unified error type for all emberfs operations.
///
/// Allocation and removal roll their transaction back fully before returning
/// any of these; scanner and lookup paths have no side effects to undo.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmberError {
    /// The durable heap cannot satisfy an allocation.
    #[error("no space left on pool")]
    NoSpace,

    /// The volatile offset index could not be (re)built.
    ///
    /// Process-memory exhaustion, not pool exhaustion; the durable state is
    /// untouched and the call may be retried.
    #[error("offset index build failed: {0}")]
    IndexBuild(String),

    /// SEEK_DATA/SEEK_HOLE offset outside the file's data range.
    #[error("no data or hole at the requested offset")]
    Nxio,

    /// Resulting file size would exceed the maximum representable size.
    #[error("file too big")]
    FileTooBig,

    /// Offset arithmetic would not fit the result type.
    #[error("offset overflow")]
    Overflow,

    /// Malformed argument (negative length, bad flag combination, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Handle not opened for the attempted access.
    #[error("bad file handle: {0}")]
    BadHandle(String),

    /// Requested mode is recognized but not provided by this pool.
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl EmberError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NoSpace => libc::ENOSPC,
            Self::IndexBuild(_) => libc::ENOMEM,
            Self::Nxio => libc::ENXIO,
            Self::FileTooBig => libc::EFBIG,
            Self::Overflow => libc::EOVERFLOW,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::BadHandle(_) => libc::EBADF,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
        }
    }
}

/// Result alias using `EmberError`.
pub type Result<T> = std::result::Result<T, EmberError>;
