use std::net::SocketAddr;

/// Bitfield type used for piece and block completion tracking. Msb0 matches
/// the peer wire bitfield layout.
pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// Identity of the peer connection a request came from. Carried through the
/// worker for logging and outcome routing only.
pub type PeerHandle = SocketAddr;
