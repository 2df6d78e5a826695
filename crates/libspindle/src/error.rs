use std::path::PathBuf;

/// Crate-wide error type.
///
/// Queue-full backpressure is deliberately *not* represented here: a rejected
/// request is a normal outcome (`ReadOutcome::Rejected` /
/// `WriteOutcome::Rejected`), distinguishable by the caller from a failed
/// one. Likewise a hash mismatch during verification is a `false` result,
/// not an error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("range offset={offset} len={len} out of bounds for capacity {capacity} of {path:?}")]
    Bounds {
        path: PathBuf,
        offset: u64,
        len: u64,
        capacity: u64,
    },

    #[error("range offset={offset} len={len} out of bounds for piece {piece} of length {piece_length}")]
    PieceBounds {
        piece: u32,
        offset: u32,
        len: u64,
        piece_length: u32,
    },

    #[error("invalid piece index {0}")]
    InvalidPieceIndex(u32),

    #[error("no file with index {0}")]
    NoSuchFile(usize),

    #[error("error creating {path:?}: {source:#}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error reading {path:?} at offset {offset}: {source:#}")]
    Read {
        path: PathBuf,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("error writing {path:?} at offset {offset}: {source:#}")]
    Write {
        path: PathBuf,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("error flushing {path:?}: {source:#}")]
    Flush {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error closing {path:?}: {source:#}")]
    Close {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cached open-file handles are never resurrected after close; the cache
    /// opens a fresh entry on the next lookup instead.
    #[error("cached file handle for {path:?} was closed")]
    FileClosed { path: PathBuf },

    /// A cache slot was invalidated (its fill failed) between lookup and
    /// read. The caller should retry, which will read from disk.
    #[error("cached data for piece {0} was discarded before it was read")]
    StalePiece(u32),

    #[error("data worker is dead")]
    WorkerDead,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
