//! Torrent registration and the per-torrent handle.
//!
//! [`Storage`] owns the download root and the shared open-file cache.
//! Registering a torrent maps its metadata onto sanitized paths under the
//! root, builds the piece-to-file span table, and spawns the torrent's data
//! worker. Must be called from within a tokio runtime.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use spindle_core::{Lengths, PieceHash};
use tracing::{debug, info};

use crate::block_cache::{BlockCache, DirectBlockCache, SlotBlockCache};
use crate::chunk::{ChunkDescriptor, FileSpan};
use crate::error::{Error, Result};
use crate::file_cache::{FileCacheKey, OpenFileCache};
use crate::paths::{sanitize_component, sanitize_path};
use crate::storage_unit::StorageUnit;
use crate::type_aliases::BF;
use crate::worker::DataWorker;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Bound on simultaneously open file handles across all torrents.
    pub max_open_files: usize,
    /// Bound on queued block requests per torrent before rejection.
    pub max_pending_requests: usize,
    /// Block granularity override; `None` uses the protocol default.
    pub block_size: Option<u32>,
    /// Serve reads through the piece-slot cache instead of hitting disk
    /// for every block.
    pub read_cache: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            max_open_files: 128,
            max_pending_requests: 256,
            block_size: None,
            read_cache: true,
        }
    }
}

/// One file entry from torrent metadata. `components` are the raw
/// (untrusted) path elements; empty components mean a single-file torrent
/// where the torrent name is the file name.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    pub components: Vec<String>,
    pub len: u64,
}

/// The subset of torrent metadata the storage layer needs.
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub name: String,
    pub piece_length: u32,
    pub files: Vec<TorrentFile>,
    pub piece_hashes: Vec<PieceHash>,
}

impl TorrentMeta {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }
}

/// Storage root shared by all registered torrents.
pub struct Storage {
    root: PathBuf,
    opts: StorageOptions,
    file_cache: Arc<OpenFileCache>,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, opts: StorageOptions) -> Self {
        let max_open = NonZeroUsize::new(opts.max_open_files.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            root: root.into(),
            file_cache: Arc::new(OpenFileCache::new(max_open)),
            opts,
        }
    }

    /// Map a torrent onto disk and spawn its data worker. Nothing is
    /// created on disk until data arrives (or [`TorrentHandle::preallocate`]
    /// is called).
    pub fn register(&self, meta: &TorrentMeta) -> Result<TorrentHandle> {
        let total_length = meta.total_length();
        let lengths = Lengths::new(total_length, meta.piece_length, self.opts.block_size)?;
        if meta.piece_hashes.len() != lengths.total_pieces() as usize {
            return Err(anyhow::anyhow!(
                "torrent {:?}: {} piece hashes for {} pieces",
                meta.name,
                meta.piece_hashes.len(),
                lengths.total_pieces()
            )
            .into());
        }

        let units = self.build_units(meta);
        let chunks = build_chunks(&lengths, meta, &units, &self.file_cache)?;

        let block_cache: Arc<dyn BlockCache> = if self.opts.read_cache {
            Arc::new(SlotBlockCache::new(&lengths))
        } else {
            Arc::new(DirectBlockCache)
        };
        let worker = DataWorker::spawn(
            lengths,
            chunks.clone(),
            block_cache,
            self.opts.max_pending_requests,
        );

        info!(
            name = %meta.name,
            files = units.len(),
            pieces = lengths.total_pieces(),
            total_length,
            "registered torrent"
        );
        Ok(TorrentHandle {
            name: meta.name.clone(),
            lengths,
            units,
            chunks,
            worker,
            file_cache: self.file_cache.clone(),
        })
    }

    fn build_units(&self, meta: &TorrentMeta) -> Vec<Arc<StorageUnit>> {
        let single_file = meta.files.len() == 1 && meta.files[0].components.is_empty();
        meta.files
            .iter()
            .map(|f| {
                let path = if single_file {
                    self.root.join(sanitize_component(&meta.name))
                } else {
                    self.root
                        .join(sanitize_component(&meta.name))
                        .join(sanitize_path(f.components.iter().map(String::as_str)))
                };
                Arc::new(StorageUnit::new(path, f.len))
            })
            .collect()
    }
}

fn build_chunks(
    lengths: &Lengths,
    meta: &TorrentMeta,
    units: &[Arc<StorageUnit>],
    file_cache: &Arc<OpenFileCache>,
) -> Result<Vec<Arc<ChunkDescriptor>>> {
    let mut chunks = Vec::with_capacity(lengths.total_pieces() as usize);
    let mut file_idx = 0usize;
    let mut file_start = 0u64;
    for pi in lengths.iter_piece_infos() {
        let mut abs = lengths.piece_offset(pi.index);
        let mut remaining = pi.len as u64;
        let mut spans = Vec::new();
        while remaining > 0 {
            // Skip files (including zero-length ones) ending at or before
            // the current offset. File offsets only move forward, so the
            // cursor carries over between pieces.
            while file_start + units[file_idx].capacity() <= abs {
                file_start += units[file_idx].capacity();
                file_idx += 1;
            }
            let unit = &units[file_idx];
            let offset_in_unit = abs - file_start;
            let take = (unit.capacity() - offset_in_unit).min(remaining);
            spans.push(FileSpan {
                unit: unit.clone(),
                offset_in_unit,
                len: take,
            });
            abs += take;
            remaining -= take;
        }
        let chunk = ChunkDescriptor::new(
            pi.index,
            pi.len,
            lengths.default_block_length(),
            meta.piece_hashes[pi.index.get() as usize],
            spans,
            file_cache.clone(),
        )?;
        chunks.push(Arc::new(chunk));
    }
    Ok(chunks)
}

/// A registered torrent: its layout, chunk descriptors, and worker handle.
pub struct TorrentHandle {
    name: String,
    lengths: Lengths,
    units: Vec<Arc<StorageUnit>>,
    chunks: Vec<Arc<ChunkDescriptor>>,
    worker: DataWorker,
    file_cache: Arc<OpenFileCache>,
}

impl TorrentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn num_files(&self) -> usize {
        self.units.len()
    }

    pub fn unit(&self, file_index: usize) -> Result<&Arc<StorageUnit>> {
        self.units.get(file_index).ok_or(Error::NoSuchFile(file_index))
    }

    pub fn chunk(&self, piece: u32) -> Result<&Arc<ChunkDescriptor>> {
        self.lengths
            .validate_piece_index(piece)
            .ok_or(Error::InvalidPieceIndex(piece))?;
        Ok(&self.chunks[piece as usize])
    }

    /// All block traffic goes through this.
    pub fn worker(&self) -> &DataWorker {
        &self.worker
    }

    /// Hash-check whatever is on disk and return the bitfield of verified
    /// pieces. Verified pieces are folded into chunk coverage so they read
    /// back as complete; nothing is created on disk. Intended to run once,
    /// before any block traffic.
    pub fn initial_check(&self) -> Result<BF> {
        let mut have = BF::from_vec(vec![0u8; self.lengths.piece_bitfield_bytes()]);
        have.truncate(self.lengths.total_pieces() as usize);
        let mut have_count = 0u32;
        for chunk in &self.chunks {
            if chunk.verify()? {
                chunk.mark_complete();
                have.set(chunk.piece_index().get() as usize, true);
                have_count += 1;
            }
        }
        debug!(
            name = %self.name,
            have = have_count,
            total = self.lengths.total_pieces(),
            "initial check done"
        );
        Ok(have)
    }

    /// Create every file at its full declared size.
    pub fn preallocate(&self) -> Result<()> {
        for unit in &self.units {
            unit.ensure_capacity()?;
        }
        Ok(())
    }

    /// Sync all written data for this torrent to disk.
    pub fn flush(&self) -> Result<()> {
        self.file_cache.flush()?;
        for unit in &self.units {
            unit.flush()?;
        }
        Ok(())
    }

    /// Close all file handles for this torrent, both cached and direct.
    /// Every handle is attempted; the first failure is reported afterwards.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for unit in &self.units {
            if let Err(e) = self.file_cache.close(&FileCacheKey::for_unit(unit)) {
                first_err.get_or_insert(e);
            }
            if let Err(e) = unit.close() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Piece verification state as seen by coverage, for tests and status
    /// displays: bit set iff the chunk reads back complete.
    pub fn coverage_bitfield(&self) -> BF {
        let mut bf = BF::from_vec(vec![0u8; self.lengths.piece_bitfield_bytes()]);
        bf.truncate(self.lengths.total_pieces() as usize);
        for chunk in &self.chunks {
            if chunk.status() == crate::chunk::ChunkStatus::Complete {
                bf.set(chunk.piece_index().get() as usize, true);
            }
        }
        bf
    }

    pub fn pieces(&self) -> impl Iterator<Item = &Arc<ChunkDescriptor>> {
        self.chunks.iter()
    }
}
