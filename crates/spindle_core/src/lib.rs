pub mod hash;
pub mod lengths;

pub use hash::{PieceHash, PieceHasher};
pub use lengths::{BlockInfo, Lengths, PieceInfo, ValidPieceIndex};
