//! Read-side piece caching for serving block requests.
//!
//! Two implementations of [`BlockCache`]:
//!
//! - [`DirectBlockCache`]: no caching, every request goes to disk.
//! - [`SlotBlockCache`]: a small arena of piece-sized slots. A request for a
//!   cached piece copies out of the slot ([`CacheOutcome::Hit`]); a request
//!   for an uncached piece claims the least-recently-used unpinned slot and
//!   fills it with the whole piece ([`CacheOutcome::Claimed`]); when every
//!   slot is pinned by an in-flight reader the request falls through to disk
//!   ([`CacheOutcome::Fallback`]).
//!
//! A [`BlockReader`] pins its slot for its whole lifetime, so slot contents
//! can never be reclaimed out from under a reader. The pin is released on
//! drop, including on error paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use spindle_core::Lengths;
use tracing::trace;

use crate::chunk::ChunkDescriptor;
use crate::error::{Error, Result};

/// Upper bound on the slot arena. Torrents with fewer pieces get one slot
/// per piece.
const CACHE_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from an already-filled slot.
    Hit,
    /// The piece was loaded from disk into a claimed slot.
    Claimed,
    /// The cache could not serve this request; data was read directly.
    Fallback,
}

/// Source of block payloads for read requests.
pub trait BlockCache: Send + Sync {
    fn get(&self, chunk: &ChunkDescriptor, offset: u32, len: u32) -> Result<BlockReader>;
}

/// Pass-through: reads the requested range straight from the chunk.
pub struct DirectBlockCache;

impl BlockCache for DirectBlockCache {
    fn get(&self, chunk: &ChunkDescriptor, offset: u32, len: u32) -> Result<BlockReader> {
        Ok(BlockReader {
            outcome: CacheOutcome::Fallback,
            source: ReaderSource::Owned(read_direct(chunk, offset, len)?),
        })
    }
}

fn read_direct(chunk: &ChunkDescriptor, offset: u32, len: u32) -> Result<Bytes> {
    let mut buf = vec![0u8; len as usize];
    chunk.read_range(offset, &mut buf)?;
    Ok(Bytes::from(buf))
}

struct SlotData {
    buf: Box<[u8]>,
    /// Valid prefix of `buf`; the last piece is usually shorter than a slot.
    len: usize,
}

struct Slot {
    /// Number of live pins. A slot with pins is never reclaimed.
    refs: AtomicUsize,
    data: RwLock<SlotData>,
}

struct SlotState {
    /// piece index -> slot currently holding it.
    owners: HashMap<u32, usize>,
    /// Reverse of `owners`, indexed by slot.
    slot_owner: Vec<Option<u32>>,
    /// Slot indices ordered least- to most-recently used.
    recency: Vec<usize>,
}

impl SlotState {
    fn touch(&mut self, slot_idx: usize) {
        if let Some(pos) = self.recency.iter().position(|&i| i == slot_idx) {
            self.recency.remove(pos);
        }
        self.recency.push(slot_idx);
    }
}

struct CacheInner {
    slots: Box<[Slot]>,
    state: Mutex<SlotState>,
}

/// Piece-slot read cache. Pinning is an atomic refcount per slot; all other
/// bookkeeping lives behind one mutex that is never held across disk I/O.
pub struct SlotBlockCache {
    inner: Arc<CacheInner>,
}

impl SlotBlockCache {
    pub fn new(lengths: &Lengths) -> Self {
        let num_slots = (lengths.total_pieces() as usize).min(CACHE_SLOTS).max(1);
        let slot_len = lengths.default_piece_length() as usize;
        let slots: Vec<Slot> = (0..num_slots)
            .map(|_| Slot {
                refs: AtomicUsize::new(0),
                data: RwLock::new(SlotData {
                    buf: vec![0u8; slot_len].into_boxed_slice(),
                    len: 0,
                }),
            })
            .collect();
        Self {
            inner: Arc::new(CacheInner {
                slots: slots.into_boxed_slice(),
                state: Mutex::new(SlotState {
                    owners: HashMap::new(),
                    slot_owner: vec![None; num_slots],
                    recency: (0..num_slots).collect(),
                }),
            }),
        }
    }
}

impl BlockCache for SlotBlockCache {
    fn get(&self, chunk: &ChunkDescriptor, offset: u32, len: u32) -> Result<BlockReader> {
        let end = offset as u64 + len as u64;
        if end > chunk.piece_length() as u64 {
            return Err(Error::PieceBounds {
                piece: chunk.piece_index().get(),
                offset,
                len: len as u64,
                piece_length: chunk.piece_length(),
            });
        }
        let piece = chunk.piece_index().get();

        let mut state = self.inner.state.lock();

        if let Some(&slot_idx) = state.owners.get(&piece) {
            // Pin before releasing the state lock; reclaim checks refs under
            // that same lock, so a pinned slot cannot be retargeted.
            self.inner.slots[slot_idx].refs.fetch_add(1, Ordering::AcqRel);
            state.touch(slot_idx);
            drop(state);
            trace!(piece, slot = slot_idx, "block cache hit");
            return Ok(BlockReader {
                outcome: CacheOutcome::Hit,
                source: ReaderSource::Slot {
                    pin: SlotPin {
                        inner: self.inner.clone(),
                        slot_idx,
                    },
                    piece,
                    offset: offset as usize,
                    len: len as usize,
                },
            });
        }

        // Claim the least-recently-used unpinned slot, if any.
        let claim = state
            .recency
            .iter()
            .copied()
            .find(|&i| self.inner.slots[i].refs.load(Ordering::Acquire) == 0);
        let Some(slot_idx) = claim else {
            drop(state);
            trace!(piece, "block cache fully pinned, reading direct");
            return Ok(BlockReader {
                outcome: CacheOutcome::Fallback,
                source: ReaderSource::Owned(read_direct(chunk, offset, len)?),
            });
        };

        let slot = &self.inner.slots[slot_idx];
        slot.refs.store(1, Ordering::Release);
        if let Some(old) = state.slot_owner[slot_idx].take() {
            state.owners.remove(&old);
        }
        state.owners.insert(piece, slot_idx);
        state.slot_owner[slot_idx] = Some(piece);
        state.touch(slot_idx);
        let pin = SlotPin {
            inner: self.inner.clone(),
            slot_idx,
        };
        // Take the write lock while still holding the state lock: refs was
        // zero so no reader holds it, and concurrent hits on the new owner
        // will block on the read side until the fill completes.
        let mut data = slot.data.write();
        drop(state);

        trace!(piece, slot = slot_idx, "block cache claim, filling slot");
        match chunk.read_piece() {
            Ok(bytes) => {
                data.buf[..bytes.len()].copy_from_slice(&bytes);
                data.len = bytes.len();
            }
            Err(e) => {
                // Retarget failed: unmap the piece and invalidate the slot
                // before releasing the write lock, so a reader that pinned
                // it while we were filling gets `StalePiece` instead of
                // unfilled bytes.
                data.len = 0;
                let mut state = self.inner.state.lock();
                state.owners.remove(&piece);
                state.slot_owner[slot_idx] = None;
                return Err(e);
            }
        }
        drop(data);

        Ok(BlockReader {
            outcome: CacheOutcome::Claimed,
            source: ReaderSource::Slot {
                pin,
                piece,
                offset: offset as usize,
                len: len as usize,
            },
        })
    }
}

/// Releases a slot's refcount on drop.
struct SlotPin {
    inner: Arc<CacheInner>,
    slot_idx: usize,
}

impl Drop for SlotPin {
    fn drop(&mut self) {
        self.inner.slots[self.slot_idx].refs.fetch_sub(1, Ordering::AcqRel);
    }
}

enum ReaderSource {
    Slot {
        pin: SlotPin,
        piece: u32,
        offset: usize,
        len: usize,
    },
    Owned(Bytes),
}

/// Handle to one block's payload, tagged with how the cache served it.
/// Holding it pins the backing slot (if any); [`BlockReader::consume`]
/// copies the payload out and releases the pin.
pub struct BlockReader {
    outcome: CacheOutcome,
    source: ReaderSource,
}

impl BlockReader {
    pub fn outcome(&self) -> CacheOutcome {
        self.outcome
    }

    pub fn len(&self) -> usize {
        match &self.source {
            ReaderSource::Slot { len, .. } => *len,
            ReaderSource::Owned(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn consume(self) -> Result<Bytes> {
        match self.source {
            ReaderSource::Slot {
                pin,
                piece,
                offset,
                len,
            } => {
                let slot = &pin.inner.slots[pin.slot_idx];
                let data = slot.data.read();
                // A failed fill zeroes `len` before we can get the read
                // lock; the pinned slot is otherwise immutable.
                if offset + len > data.len {
                    return Err(Error::StalePiece(piece));
                }
                Ok(Bytes::copy_from_slice(&data.buf[offset..offset + len]))
            }
            ReaderSource::Owned(bytes) => Ok(bytes),
        }
    }
}
