//! Error types for the storage engine.

use std::path::PathBuf;

use crate::FileId;

/// Errors surfaced by the engine's public API.
///
/// `NotFound` is deliberately not a variant here — `get` returns
/// `Result<Option<Bytes>, Error>`, so "key absent" never has to travel
/// through the same channel as a real failure.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An underlying read/write/fsync/unlink syscall failed.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record failed to decode: CRC mismatch or a structurally invalid
    /// header. During recovery this ends the scan of the offending file;
    /// from `get` it propagates to the caller.
    #[error("corrupt record in file {file_id} at offset {offset}: {reason}")]
    Corrupt {
        file_id: FileId,
        offset: u64,
        reason: &'static str,
    },

    /// The index points at a file or byte range that no longer exists.
    /// Indicates a bug or a torn merge — should be unreachable under the
    /// engine's invariants.
    #[error("index refers to missing file/offset: file {file_id} offset {offset}")]
    Inconsistent { file_id: FileId, offset: u64 },

    /// `key.len()` exceeds the permitted bound; rejected before any I/O.
    #[error("key of {len} bytes exceeds the maximum of {max} bytes")]
    InvalidKey { len: usize, max: usize },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
