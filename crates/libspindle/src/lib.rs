//! spindle is the data-storage and integrity core of a BitTorrent client:
//! it maps a torrent's fixed-size pieces onto one or more on-disk files,
//! tracks byte-exact write coverage from many concurrent peer connections,
//! verifies completed pieces against their expected SHA-1 hashes, and hides
//! disk access behind two bounded LRU caches (open file handles and
//! in-memory piece slots).
//!
//! The async front door is [`worker::DataWorker`]: peer connection handlers
//! submit block reads and writes and get back oneshot handles to the
//! eventual outcome. Everything below the worker is synchronous positional
//! file I/O.
//!
//! Everything protocol-related (bencoding, peer wire, trackers, piece
//! selection) lives outside this crate; the boundary is
//! [`storage::TorrentMeta`] going in and verified-piece notifications
//! coming out.

pub mod block_cache;
pub mod chunk;
pub mod error;
pub mod file_cache;
pub mod paths;
pub mod storage;
pub mod storage_unit;
pub mod type_aliases;
pub mod worker;

pub use block_cache::{BlockCache, BlockReader, CacheOutcome, DirectBlockCache, SlotBlockCache};
pub use chunk::{ChunkDescriptor, ChunkStatus, FileSpan};
pub use error::{Error, Result};
pub use file_cache::{FileCacheKey, OpenFileCache};
pub use storage::{Storage, StorageOptions, TorrentFile, TorrentHandle, TorrentMeta};
pub use storage_unit::StorageUnit;
pub use worker::{DataWorker, ReadOutcome, VerifiedPieceListener, WriteOutcome};
