//! Piece and block arithmetic.
//!
//! Everything here is pure math over the torrent's declared sizes. A piece is
//! the hash-verified unit; a block is the granularity at which writes arrive
//! and completion is tracked. The last piece (and the last block of any
//! piece) may be shorter than the default.

/// Default block size used when the caller does not configure one. 16 KiB is
/// the de-facto peer wire request size.
pub const DEFAULT_BLOCK_SIZE: u32 = 16384;

pub const fn ceil_div_u64(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

pub const fn last_element_size_u64(total: u64, element_size: u64) -> u64 {
    let rem = total % element_size;
    if rem == 0 {
        return element_size;
    }
    rem
}

/// A piece index that has been checked against the torrent's piece count.
/// Constructed only through [`Lengths::validate_piece_index`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub index: ValidPieceIndex,
    pub len: u32,
}

/// One block within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: ValidPieceIndex,
    pub block_index: u32,
    /// Offset of the block within its piece.
    pub offset_in_piece: u32,
    pub len: u32,
}

/// All derived lengths of a torrent, precomputed once.
#[derive(Debug, Clone, Copy)]
pub struct Lengths {
    total_length: u64,
    piece_length: u32,
    block_length: u32,
    last_piece_id: u32,
    last_piece_length: u32,
    max_blocks_per_piece: u32,
}

impl Lengths {
    pub fn new(total_length: u64, piece_length: u32, block_length: Option<u32>) -> anyhow::Result<Self> {
        // The default block length is clamped so torrents with pieces
        // smaller than one standard block still work.
        let block_length = block_length.unwrap_or_else(|| DEFAULT_BLOCK_SIZE.min(piece_length));
        if block_length == 0 {
            anyhow::bail!("block length cannot be 0");
        }
        if block_length > piece_length {
            anyhow::bail!(
                "block length {} cannot exceed piece length {}",
                block_length,
                piece_length
            );
        }
        if total_length == 0 {
            anyhow::bail!("torrent with 0 length");
        }
        let total_pieces = ceil_div_u64(total_length, piece_length as u64) as u32;
        Ok(Self {
            total_length,
            piece_length,
            block_length,
            max_blocks_per_piece: ceil_div_u64(piece_length as u64, block_length as u64) as u32,
            last_piece_id: total_pieces - 1,
            last_piece_length: last_element_size_u64(total_length, piece_length as u64) as u32,
        })
    }

    pub const fn total_length(&self) -> u64 {
        self.total_length
    }
    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }
    pub const fn default_block_length(&self) -> u32 {
        self.block_length
    }
    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }
    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }
    pub const fn piece_bitfield_bytes(&self) -> usize {
        ceil_div_u64(self.total_pieces() as u64, 8) as usize
    }

    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }

    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_length
    }

    /// Absolute offset of the piece within the torrent's byte range.
    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_length as u64
    }

    pub const fn blocks_per_piece(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return (self.last_piece_length + self.block_length - 1) / self.block_length;
        }
        self.max_blocks_per_piece
    }

    pub fn block_size(&self, piece_index: ValidPieceIndex, block_index: u32) -> Option<u32> {
        if block_index >= self.blocks_per_piece(piece_index) {
            return None;
        }
        let offset = block_index * self.block_length;
        Some(std::cmp::min(
            self.block_length,
            self.piece_length(piece_index) - offset,
        ))
    }

    pub fn iter_piece_infos(&self) -> impl Iterator<Item = PieceInfo> {
        let last_id = self.last_piece_id;
        let last_len = self.last_piece_length;
        let pl = self.piece_length;
        (0..self.total_pieces()).map(move |idx| PieceInfo {
            index: ValidPieceIndex(idx),
            len: if idx == last_id { last_len } else { pl },
        })
    }

    pub fn iter_block_infos(&self, index: ValidPieceIndex) -> impl Iterator<Item = BlockInfo> {
        let mut remaining = self.piece_length(index);
        let block_length = self.block_length;
        (0u32..).scan(0u32, move |offset, idx| {
            if remaining == 0 {
                return None;
            }
            let len = std::cmp::min(remaining, block_length);
            let result = BlockInfo {
                piece_index: index,
                block_index: idx,
                offset_in_piece: *offset,
                len,
            };
            *offset += len;
            remaining -= len;
            Some(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lengths() -> Lengths {
        // 3 full 32 KiB pieces plus a 10000-byte tail.
        Lengths::new(32768 * 3 + 10000, 32768, None).unwrap()
    }

    #[test]
    fn test_total_pieces() {
        let l = make_lengths();
        assert_eq!(l.total_pieces(), 4);
        assert_eq!(l.last_piece_id().get(), 3);
    }

    #[test]
    fn test_piece_length() {
        let l = make_lengths();
        assert_eq!(l.piece_length(l.validate_piece_index(0).unwrap()), 32768);
        assert_eq!(l.piece_length(l.last_piece_id()), 10000);
    }

    #[test]
    fn test_blocks_per_piece() {
        let l = make_lengths();
        assert_eq!(l.blocks_per_piece(l.validate_piece_index(0).unwrap()), 2);
        assert_eq!(l.blocks_per_piece(l.last_piece_id()), 1);
    }

    #[test]
    fn test_block_size() {
        let l = make_lengths();
        let first = l.validate_piece_index(0).unwrap();
        assert_eq!(l.block_size(first, 0), Some(16384));
        assert_eq!(l.block_size(first, 1), Some(16384));
        assert_eq!(l.block_size(first, 2), None);
        assert_eq!(l.block_size(l.last_piece_id(), 0), Some(10000));
    }

    #[test]
    fn test_validate_piece_index() {
        let l = make_lengths();
        assert!(l.validate_piece_index(3).is_some());
        assert!(l.validate_piece_index(4).is_none());
    }

    #[test]
    fn test_iter_block_infos() {
        let l = Lengths::new(100000, 40000, Some(16384)).unwrap();
        let p = l.validate_piece_index(2).unwrap();
        // Last piece is 20000 bytes: one full block and a 3616-byte tail.
        let blocks: Vec<_> = l.iter_block_infos(p).collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].len, 16384);
        assert_eq!(blocks[0].offset_in_piece, 0);
        assert_eq!(blocks[1].len, 3616);
        assert_eq!(blocks[1].offset_in_piece, 16384);
    }

    #[test]
    fn test_piece_bitfield_bytes() {
        let l = Lengths::new(1174243328, 262144, None).unwrap();
        assert_eq!(l.total_pieces(), 4480);
        assert_eq!(l.piece_bitfield_bytes(), 560);
    }
}
