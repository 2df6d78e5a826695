//! Chunk descriptors: the logical piece layer.
//!
//! A [`ChunkDescriptor`] maps one piece of the torrent onto a list of
//! [`FileSpan`]s (a piece may start in the middle of one file and end in the
//! middle of another), tracks which byte ranges of the piece have been
//! written, and verifies the assembled piece against its expected SHA-1.
//!
//! Coverage is tracked as a merged set of byte intervals, so blocks may
//! arrive in any order, overlap, or straddle block boundaries; the derived
//! per-block bitfield only ever gains bits until [`ChunkDescriptor::reset`].

use std::sync::Arc;

use parking_lot::Mutex;
use spindle_core::{PieceHash, PieceHasher, ValidPieceIndex};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::file_cache::OpenFileCache;
use crate::storage_unit::StorageUnit;
use crate::type_aliases::BF;

const VERIFY_BUF_SIZE: usize = 65536;

/// A contiguous slice of one storage unit backing part of a piece.
#[derive(Debug, Clone)]
pub struct FileSpan {
    pub unit: Arc<StorageUnit>,
    pub offset_in_unit: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Empty,
    Incomplete,
    Complete,
}

#[derive(Debug, Default)]
struct Coverage {
    // Sorted, pairwise-disjoint, non-touching half-open intervals.
    intervals: Vec<(u64, u64)>,
    covered_bytes: u64,
    blocks: BF,
}

impl Coverage {
    fn insert(&mut self, start: u64, end: u64) {
        let mut merged = (start, end);
        self.intervals.retain(|&(s, e)| {
            if e < merged.0 || s > merged.1 {
                true
            } else {
                merged.0 = merged.0.min(s);
                merged.1 = merged.1.max(e);
                false
            }
        });
        let idx = self.intervals.partition_point(|&(s, _)| s < merged.0);
        self.intervals.insert(idx, merged);
        self.covered_bytes = self.intervals.iter().map(|&(s, e)| e - s).sum();
    }

    fn recompute_blocks(&mut self, piece_length: u32, block_size: u32) {
        let bs = block_size as u64;
        for &(s, e) in &self.intervals {
            let mut block = s.div_ceil(bs);
            loop {
                let block_start = block * bs;
                let block_end = (block_start + bs).min(piece_length as u64);
                if block_start >= piece_length as u64 || block_end > e {
                    break;
                }
                self.blocks.set(block as usize, true);
                block += 1;
            }
        }
    }

    fn clear(&mut self) {
        self.intervals.clear();
        self.covered_bytes = 0;
        self.blocks.fill(false);
    }
}

/// One piece: its identity, expected hash, backing spans, and write
/// coverage. I/O goes through the shared open-file cache.
pub struct ChunkDescriptor {
    piece_index: ValidPieceIndex,
    piece_length: u32,
    block_size: u32,
    expected_hash: PieceHash,
    spans: Vec<FileSpan>,
    cache: Arc<OpenFileCache>,
    coverage: Mutex<Coverage>,
}

impl ChunkDescriptor {
    pub fn new(
        piece_index: ValidPieceIndex,
        piece_length: u32,
        block_size: u32,
        expected_hash: PieceHash,
        spans: Vec<FileSpan>,
        cache: Arc<OpenFileCache>,
    ) -> anyhow::Result<Self> {
        let span_total: u64 = spans.iter().map(|s| s.len).sum();
        if span_total != piece_length as u64 {
            anyhow::bail!(
                "piece {}: spans cover {span_total} bytes, piece length is {piece_length}",
                piece_index.get()
            );
        }
        if block_size == 0 {
            anyhow::bail!("block size must be non-zero");
        }
        let num_blocks = piece_length.div_ceil(block_size) as usize;
        let mut blocks = BF::new();
        blocks.resize(num_blocks, false);
        Ok(Self {
            piece_index,
            piece_length,
            block_size,
            expected_hash,
            spans,
            cache,
            coverage: Mutex::new(Coverage {
                blocks,
                ..Default::default()
            }),
        })
    }

    pub fn piece_index(&self) -> ValidPieceIndex {
        self.piece_index
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn expected_hash(&self) -> &PieceHash {
        &self.expected_hash
    }

    fn check_piece_bounds(&self, offset: u32, len: usize) -> Result<()> {
        let end = offset as u64 + len as u64;
        if end > self.piece_length as u64 {
            return Err(Error::PieceBounds {
                piece: self.piece_index.get(),
                offset,
                len: len as u64,
                piece_length: self.piece_length,
            });
        }
        Ok(())
    }

    /// Walk the spans intersecting `[offset, offset + len)`, calling `f`
    /// with the span, the absolute offset within its unit, and the matching
    /// sub-range of the caller's buffer.
    fn map_range(
        &self,
        offset: u32,
        len: usize,
        mut f: impl FnMut(&FileSpan, u64, std::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let mut remaining = len;
        let mut pos = offset as u64;
        let mut buf_pos = 0usize;
        let mut span_start = 0u64;
        for span in &self.spans {
            let span_end = span_start + span.len;
            if remaining > 0 && pos < span_end {
                let in_span = pos - span_start;
                let take = ((span.len - in_span).min(remaining as u64)) as usize;
                f(span, span.offset_in_unit + in_span, buf_pos..buf_pos + take)?;
                pos += take as u64;
                buf_pos += take;
                remaining -= take;
            }
            if remaining == 0 {
                break;
            }
            span_start = span_end;
        }
        Ok(())
    }

    /// Write one block of data at `offset` within the piece and fold it into
    /// the coverage set. Returns the piece's status after the write.
    pub fn write_block(&self, offset: u32, data: &[u8]) -> Result<ChunkStatus> {
        self.check_piece_bounds(offset, data.len())?;
        if data.is_empty() {
            return Ok(self.status());
        }
        self.map_range(offset, data.len(), |span, unit_offset, range| {
            self.cache.write_unit(&span.unit, &data[range], unit_offset)
        })?;
        let mut cov = self.coverage.lock();
        cov.insert(offset as u64, offset as u64 + data.len() as u64);
        cov.recompute_blocks(self.piece_length, self.block_size);
        trace!(
            piece = self.piece_index.get(),
            offset,
            len = data.len(),
            covered = cov.covered_bytes,
            "wrote block"
        );
        Ok(self.status_locked(&cov))
    }

    /// Read `buf.len()` bytes starting at `offset` within the piece.
    pub fn read_range(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.check_piece_bounds(offset, buf.len())?;
        self.map_range(offset, buf.len(), |span, unit_offset, range| {
            self.cache.read_unit(&span.unit, &mut buf[range], unit_offset)
        })
    }

    /// Read the whole piece into a fresh buffer.
    pub fn read_piece(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.piece_length as usize];
        self.read_range(0, &mut buf)?;
        Ok(buf)
    }

    /// Hash the piece's on-disk bytes and compare against the expected
    /// SHA-1. A mismatch is `Ok(false)`, not an error.
    pub fn verify(&self) -> Result<bool> {
        let mut hasher = PieceHasher::new();
        let mut buf = vec![0u8; VERIFY_BUF_SIZE.min(self.piece_length as usize)];
        let mut pos = 0u32;
        while pos < self.piece_length {
            let take = buf.len().min((self.piece_length - pos) as usize);
            self.read_range(pos, &mut buf[..take])?;
            hasher.update(&buf[..take]);
            pos += take as u32;
        }
        let actual = hasher.finish();
        let ok = actual == self.expected_hash;
        if !ok {
            debug!(
                piece = self.piece_index.get(),
                expected = %self.expected_hash,
                actual = %actual,
                "piece hash mismatch"
            );
        }
        Ok(ok)
    }

    /// Forget all coverage, e.g. after a failed verification, so the piece
    /// can be re-downloaded from scratch.
    pub fn reset(&self) {
        self.coverage.lock().clear();
    }

    /// Mark the whole piece as present, used when on-disk data verified
    /// without having been written through this descriptor.
    pub(crate) fn mark_complete(&self) {
        let mut cov = self.coverage.lock();
        cov.insert(0, self.piece_length as u64);
        cov.recompute_blocks(self.piece_length, self.block_size);
    }

    pub fn bytes_covered(&self) -> u64 {
        self.coverage.lock().covered_bytes
    }

    /// Snapshot of the per-block completion bitfield.
    pub fn block_bitfield(&self) -> BF {
        self.coverage.lock().blocks.clone()
    }

    fn status_locked(&self, cov: &Coverage) -> ChunkStatus {
        if cov.covered_bytes == 0 {
            ChunkStatus::Empty
        } else if cov.covered_bytes == self.piece_length as u64 {
            ChunkStatus::Complete
        } else {
            ChunkStatus::Incomplete
        }
    }

    pub fn status(&self) -> ChunkStatus {
        self.status_locked(&self.coverage.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;

    fn cache() -> Arc<OpenFileCache> {
        Arc::new(OpenFileCache::new(NonZeroUsize::new(8).unwrap()))
    }

    fn pidx(i: u32) -> ValidPieceIndex {
        spindle_core::Lengths::new(1 << 20, 1 << 14, None)
            .unwrap()
            .validate_piece_index(i)
            .unwrap()
    }

    fn single_span_chunk(
        dir: &tempfile::TempDir,
        piece_length: u32,
        block_size: u32,
        expected: PieceHash,
    ) -> ChunkDescriptor {
        let unit = Arc::new(StorageUnit::new(dir.path().join("data.bin"), piece_length as u64));
        ChunkDescriptor::new(
            pidx(0),
            piece_length,
            block_size,
            expected,
            vec![FileSpan {
                unit,
                offset_in_unit: 0,
                len: piece_length as u64,
            }],
            cache(),
        )
        .unwrap()
    }

    #[test]
    fn test_span_lengths_must_match_piece_length() {
        let dir = tempfile::TempDir::new().unwrap();
        let unit = Arc::new(StorageUnit::new(dir.path().join("d.bin"), 100));
        let r = ChunkDescriptor::new(
            pidx(0),
            16,
            4,
            PieceHash([0u8; 20]),
            vec![FileSpan {
                unit,
                offset_in_unit: 0,
                len: 15,
            }],
            cache(),
        );
        assert!(r.is_err());
    }

    #[test]
    fn test_blocks_arrive_in_any_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let data: Vec<u8> = (0u8..16).collect();
        let hash = PieceHash::compute(&data);
        let chunk = single_span_chunk(&dir, 16, 4, hash);
        assert_eq!(chunk.status(), ChunkStatus::Empty);
        assert_eq!(chunk.write_block(8, &data[8..12]).unwrap(), ChunkStatus::Incomplete);
        assert_eq!(chunk.write_block(0, &data[0..4]).unwrap(), ChunkStatus::Incomplete);
        assert_eq!(chunk.write_block(12, &data[12..16]).unwrap(), ChunkStatus::Incomplete);
        assert_eq!(chunk.write_block(4, &data[4..8]).unwrap(), ChunkStatus::Complete);
        assert!(chunk.verify().unwrap());
        assert_eq!(chunk.read_piece().unwrap(), data);
    }

    #[test]
    fn test_partial_blocks_only_count_when_fully_covered() {
        let dir = tempfile::TempDir::new().unwrap();
        let chunk = single_span_chunk(&dir, 16, 4, PieceHash([0u8; 20]));
        // [1, 8) fully covers block 1 ([4, 8)) but only part of block 0.
        chunk.write_block(1, &[0xaa; 7]).unwrap();
        let bits = chunk.block_bitfield();
        assert_eq!(bits.iter().by_vals().collect::<Vec<_>>(), vec![false, true, false, false]);
        assert_eq!(chunk.bytes_covered(), 7);
        // Filling in byte 0 merges [0, 1) with [1, 8) and completes block 0.
        chunk.write_block(0, &[0xaa; 1]).unwrap();
        let bits = chunk.block_bitfield();
        assert_eq!(bits.iter().by_vals().collect::<Vec<_>>(), vec![true, true, false, false]);
    }

    #[test]
    fn test_overlapping_writes_merge() {
        let dir = tempfile::TempDir::new().unwrap();
        let chunk = single_span_chunk(&dir, 16, 4, PieceHash([0u8; 20]));
        chunk.write_block(0, &[1u8; 10]).unwrap();
        chunk.write_block(6, &[2u8; 10]).unwrap();
        assert_eq!(chunk.bytes_covered(), 16);
        assert_eq!(chunk.status(), ChunkStatus::Complete);
    }

    #[test]
    fn test_short_last_block() {
        let dir = tempfile::TempDir::new().unwrap();
        // 10-byte piece, block size 4: blocks of 4, 4, 2.
        let data: Vec<u8> = (0u8..10).collect();
        let chunk = single_span_chunk(&dir, 10, 4, PieceHash::compute(&data));
        chunk.write_block(0, &data[0..8]).unwrap();
        let bits = chunk.block_bitfield();
        assert_eq!(bits.iter().by_vals().collect::<Vec<_>>(), vec![true, true, false]);
        assert_eq!(chunk.write_block(8, &data[8..10]).unwrap(), ChunkStatus::Complete);
        assert!(chunk.verify().unwrap());
    }

    #[test]
    fn test_write_past_piece_end_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let chunk = single_span_chunk(&dir, 16, 4, PieceHash([0u8; 20]));
        assert!(matches!(
            chunk.write_block(12, &[0u8; 5]),
            Err(Error::PieceBounds { .. })
        ));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = [7u8; 16];
        let chunk = single_span_chunk(&dir, 16, 4, PieceHash::compute(&data));
        let mut wrong = data;
        wrong[3] = 0;
        chunk.write_block(0, &wrong).unwrap();
        assert!(!chunk.verify().unwrap());
        chunk.reset();
        assert_eq!(chunk.status(), ChunkStatus::Empty);
        assert_eq!(chunk.bytes_covered(), 0);
        assert!(chunk.block_bitfield().not_any());
        chunk.write_block(0, &data).unwrap();
        assert!(chunk.verify().unwrap());
    }

    #[test]
    fn test_piece_straddling_two_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = Arc::new(StorageUnit::new(dir.path().join("a.bin"), 10));
        let b = Arc::new(StorageUnit::new(dir.path().join("b.bin"), 20));
        let data: Vec<u8> = (0u8..16).collect();
        // Piece covers the last 6 bytes of `a` and the first 10 of `b`.
        let chunk = ChunkDescriptor::new(
            pidx(0),
            16,
            8,
            PieceHash::compute(&data),
            vec![
                FileSpan {
                    unit: a.clone(),
                    offset_in_unit: 4,
                    len: 6,
                },
                FileSpan {
                    unit: b.clone(),
                    offset_in_unit: 0,
                    len: 10,
                },
            ],
            cache(),
        )
        .unwrap();
        assert_eq!(chunk.write_block(0, &data).unwrap(), ChunkStatus::Complete);
        assert!(chunk.verify().unwrap());
        assert_eq!(chunk.read_piece().unwrap(), data);

        let mut tail_of_a = [0u8; 6];
        a.read_block(&mut tail_of_a, 4).unwrap();
        assert_eq!(&tail_of_a, &data[0..6]);
        let mut head_of_b = [0u8; 10];
        b.read_block(&mut head_of_b, 0).unwrap();
        assert_eq!(&head_of_b, &data[6..16]);
    }
}
