//! Piece hashes. Sha1 computation dominates CPU time during verification, so
//! keep the hasher wrapper thin.

use sha1::{Digest, Sha1};

/// The 20-byte SHA-1 hash of a piece, as declared by torrent metadata.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PieceHash(pub [u8; 20]);

impl PieceHash {
    pub fn new(from: [u8; 20]) -> Self {
        PieceHash(from)
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }

    /// Hash a full in-memory buffer. Used by tests and small pieces; the
    /// streaming path goes through [`PieceHasher`].
    pub fn compute(data: &[u8]) -> Self {
        let mut h = PieceHasher::new();
        h.update(data);
        h.finish()
    }
}

impl std::fmt::Debug for PieceHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x?}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for PieceHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl From<[u8; 20]> for PieceHash {
    fn from(value: [u8; 20]) -> Self {
        PieceHash(value)
    }
}

/// Incremental SHA-1 over a piece's bytes, fed span by span.
pub struct PieceHasher {
    inner: Sha1,
}

impl Default for PieceHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PieceHasher {
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    pub fn update(&mut self, buf: &[u8]) {
        self.inner.update(buf)
    }

    pub fn finish(self) -> PieceHash {
        PieceHash(self.inner.finalize().into())
    }
}
