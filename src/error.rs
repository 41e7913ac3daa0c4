use std::io;

use thiserror::Error;

/// Errors reported by the storage engine.
///
/// No operation that fails leaves the on-disk structure inconsistent:
/// payload or index bytes written before the failure are unreachable dead
/// space.
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall failed; the underlying errno is preserved.
    #[error("I/O failure - {0}")]
    Io(#[from] io::Error),

    /// Magic mismatch, or the file is too short to hold a header.
    #[error("not a GSD file")]
    NotAGsdFile,

    /// The header version is outside the accepted range.
    #[error("invalid GSD file version {0:#010x}")]
    InvalidGsdFileVersion(u32),

    /// A structural invariant does not hold (index bounds, frame
    /// monotonicity, payload extent).
    #[error("corrupt GSD file - {0}")]
    FileCorrupt(String),

    #[error("memory allocation failed")]
    MemoryAllocationFailed,

    /// A new name was written after the name list reached capacity.
    #[error("name list is full")]
    NamelistFull,

    #[error("file must be writable")]
    FileMustBeWritable,

    #[error("file must be readable")]
    FileMustBeReadable,

    #[error("invalid argument - {0}")]
    InvalidArgument(&'static str),
}
