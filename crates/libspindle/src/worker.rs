//! Per-torrent data worker: a single task owning all block I/O.
//!
//! Requests enter through a bounded channel with `try_send`; when the queue
//! is full the request resolves to `Rejected` immediately instead of waiting,
//! so peer connections see backpressure as an outcome, never as latency.
//!
//! The worker also owns piece verification. The first time a piece becomes
//! fully covered its hash is checked: success latches the piece as verified
//! and notifies every registered listener exactly once; failure resets the
//! piece's coverage so it can be re-downloaded. A piece can never be
//! verified, or its listeners notified, twice.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use spindle_core::{Lengths, ValidPieceIndex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::block_cache::BlockCache;
use crate::chunk::{ChunkDescriptor, ChunkStatus};
use crate::error::Error;
use crate::type_aliases::PeerHandle;

/// Result of a block read request.
#[derive(Debug)]
pub enum ReadOutcome {
    Data(Bytes),
    /// The worker's queue was full; try again later.
    Rejected,
    Failed(Error),
}

/// Result of a block write request.
#[derive(Debug)]
pub enum WriteOutcome {
    Written {
        piece_status: ChunkStatus,
        /// `Some(result)` if this write triggered a hash check, `None`
        /// otherwise (piece not yet complete, or already verified).
        verified: Option<bool>,
    },
    /// The worker's queue was full; try again later.
    Rejected,
    Failed(Error),
}

pub type VerifiedPieceListener = Box<dyn Fn(ValidPieceIndex) + Send + Sync>;

enum WorkerMessage {
    ReadBlock {
        peer: PeerHandle,
        piece: u32,
        offset: u32,
        len: u32,
        tx: oneshot::Sender<ReadOutcome>,
    },
    WriteBlock {
        peer: PeerHandle,
        piece: u32,
        offset: u32,
        payload: Bytes,
        tx: oneshot::Sender<WriteOutcome>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VerifyState {
    Pending,
    Verified,
}

/// Handle to a spawned worker. Cheap to clone; dropping all handles closes
/// the channel and ends the worker task after it drains the queue.
#[derive(Clone)]
pub struct DataWorker {
    tx: mpsc::Sender<WorkerMessage>,
    listeners: Arc<Mutex<Vec<VerifiedPieceListener>>>,
}

impl DataWorker {
    /// Spawn the worker task. `chunks` must hold exactly one descriptor per
    /// piece of `lengths`, in piece order; panics otherwise.
    pub fn spawn(
        lengths: Lengths,
        chunks: Vec<Arc<ChunkDescriptor>>,
        cache: Arc<dyn BlockCache>,
        max_pending: usize,
    ) -> Self {
        assert_eq!(
            chunks.len(),
            lengths.total_pieces() as usize,
            "need exactly one chunk descriptor per piece"
        );
        let (tx, rx) = mpsc::channel(max_pending.max(1));
        let listeners: Arc<Mutex<Vec<VerifiedPieceListener>>> = Arc::new(Mutex::new(Vec::new()));
        let task = WorkerTask {
            lengths,
            verification: vec![VerifyState::Pending; chunks.len()],
            chunks,
            cache,
            listeners: listeners.clone(),
        };
        tokio::spawn(task.run(rx));
        Self { tx, listeners }
    }

    /// Register a callback invoked (from the worker task) when a piece first
    /// passes verification.
    pub fn add_verified_piece_listener(&self, listener: VerifiedPieceListener) {
        self.listeners.lock().push(listener);
    }

    /// Queue a block read for a peer. Never blocks: a full queue resolves
    /// the returned handle to [`ReadOutcome::Rejected`] right away.
    pub fn add_block_request(
        &self,
        peer: PeerHandle,
        piece: u32,
        offset: u32,
        len: u32,
    ) -> oneshot::Receiver<ReadOutcome> {
        let (tx, rx) = oneshot::channel();
        let msg = WorkerMessage::ReadBlock {
            peer,
            piece,
            offset,
            len,
            tx,
        };
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                trace!(%peer, piece, offset, "read request rejected, queue full");
                if let WorkerMessage::ReadBlock { tx, .. } = msg {
                    let _ = tx.send(ReadOutcome::Rejected);
                }
            }
            Err(TrySendError::Closed(msg)) => {
                if let WorkerMessage::ReadBlock { tx, .. } = msg {
                    let _ = tx.send(ReadOutcome::Failed(Error::WorkerDead));
                }
            }
        }
        rx
    }

    /// Queue a block write from a peer. Never blocks; see
    /// [`DataWorker::add_block_request`].
    pub fn add_block(
        &self,
        peer: PeerHandle,
        piece: u32,
        offset: u32,
        payload: Bytes,
    ) -> oneshot::Receiver<WriteOutcome> {
        let (tx, rx) = oneshot::channel();
        let msg = WorkerMessage::WriteBlock {
            peer,
            piece,
            offset,
            payload,
            tx,
        };
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                trace!(%peer, piece, offset, "write request rejected, queue full");
                if let WorkerMessage::WriteBlock { tx, .. } = msg {
                    let _ = tx.send(WriteOutcome::Rejected);
                }
            }
            Err(TrySendError::Closed(msg)) => {
                if let WorkerMessage::WriteBlock { tx, .. } = msg {
                    let _ = tx.send(WriteOutcome::Failed(Error::WorkerDead));
                }
            }
        }
        rx
    }
}

struct WorkerTask {
    lengths: Lengths,
    chunks: Vec<Arc<ChunkDescriptor>>,
    cache: Arc<dyn BlockCache>,
    verification: Vec<VerifyState>,
    listeners: Arc<Mutex<Vec<VerifiedPieceListener>>>,
}

impl WorkerTask {
    async fn run(mut self, mut rx: mpsc::Receiver<WorkerMessage>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                WorkerMessage::ReadBlock {
                    peer,
                    piece,
                    offset,
                    len,
                    tx,
                } => {
                    let outcome = self.handle_read(piece, offset, len);
                    if let ReadOutcome::Failed(e) = &outcome {
                        debug!(%peer, piece, offset, len, "read failed: {e:#}");
                    }
                    // Requester may have gone away; that is fine.
                    let _ = tx.send(outcome);
                }
                WorkerMessage::WriteBlock {
                    peer,
                    piece,
                    offset,
                    payload,
                    tx,
                } => {
                    let outcome = self.handle_write(piece, offset, &payload);
                    if let WriteOutcome::Failed(e) = &outcome {
                        debug!(%peer, piece, offset, "write failed: {e:#}");
                    }
                    let _ = tx.send(outcome);
                }
            }
        }
        trace!("data worker shutting down");
    }

    fn chunk(&self, piece: u32) -> Result<(ValidPieceIndex, &Arc<ChunkDescriptor>), Error> {
        let index = self
            .lengths
            .validate_piece_index(piece)
            .ok_or(Error::InvalidPieceIndex(piece))?;
        Ok((index, &self.chunks[piece as usize]))
    }

    fn handle_read(&self, piece: u32, offset: u32, len: u32) -> ReadOutcome {
        let chunk = match self.chunk(piece) {
            Ok((_, chunk)) => chunk,
            Err(e) => return ReadOutcome::Failed(e),
        };
        let bytes = self
            .cache
            .get(chunk, offset, len)
            .and_then(|reader| reader.consume());
        match bytes {
            Ok(bytes) => ReadOutcome::Data(bytes),
            Err(e) => ReadOutcome::Failed(e),
        }
    }

    fn handle_write(&mut self, piece: u32, offset: u32, payload: &[u8]) -> WriteOutcome {
        let (index, chunk) = match self.chunk(piece) {
            Ok((index, chunk)) => (index, chunk.clone()),
            Err(e) => return WriteOutcome::Failed(e),
        };
        let status = match chunk.write_block(offset, payload) {
            Ok(status) => status,
            Err(e) => return WriteOutcome::Failed(e),
        };
        if status != ChunkStatus::Complete
            || self.verification[piece as usize] == VerifyState::Verified
        {
            return WriteOutcome::Written {
                piece_status: status,
                verified: None,
            };
        }
        match chunk.verify() {
            Ok(true) => {
                self.verification[piece as usize] = VerifyState::Verified;
                debug!(piece, "piece verified");
                for listener in self.listeners.lock().iter() {
                    listener(index);
                }
                WriteOutcome::Written {
                    piece_status: status,
                    verified: Some(true),
                }
            }
            Ok(false) => {
                warn!(piece, "piece failed verification, resetting");
                chunk.reset();
                WriteOutcome::Written {
                    piece_status: ChunkStatus::Empty,
                    verified: Some(false),
                }
            }
            Err(e) => WriteOutcome::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::DirectBlockCache;
    use crate::chunk::FileSpan;
    use crate::file_cache::OpenFileCache;
    use crate::storage_unit::StorageUnit;
    use spindle_core::PieceHash;
    use std::num::NonZeroUsize;

    fn peer() -> PeerHandle {
        "127.0.0.1:6881".parse().unwrap()
    }

    /// 2 pieces of 16 bytes, block size 8, over one file.
    fn fixture(dir: &tempfile::TempDir) -> (DataWorker, Vec<Vec<u8>>) {
        let lengths = Lengths::new(32, 16, Some(8)).unwrap();
        let unit = Arc::new(StorageUnit::new(dir.path().join("data.bin"), 32));
        let cache = Arc::new(OpenFileCache::new(NonZeroUsize::new(4).unwrap()));
        let mut datas = Vec::new();
        let chunks: Vec<Arc<ChunkDescriptor>> = lengths
            .iter_piece_infos()
            .map(|pi| {
                let data: Vec<u8> = (0..pi.len).map(|i| (pi.index.get() * 100 + i) as u8).collect();
                let chunk = ChunkDescriptor::new(
                    pi.index,
                    pi.len,
                    8,
                    PieceHash::compute(&data),
                    vec![FileSpan {
                        unit: unit.clone(),
                        offset_in_unit: lengths.piece_offset(pi.index),
                        len: pi.len as u64,
                    }],
                    cache.clone(),
                )
                .unwrap();
                datas.push(data);
                Arc::new(chunk)
            })
            .collect();
        let worker = DataWorker::spawn(lengths, chunks, Arc::new(DirectBlockCache), 64);
        (worker, datas)
    }

    #[tokio::test]
    async fn test_write_verify_notify_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let (worker, datas) = fixture(&dir);
        let notified = Arc::new(Mutex::new(Vec::new()));
        let n = notified.clone();
        worker.add_verified_piece_listener(Box::new(move |idx| n.lock().push(idx.get())));

        let r = worker
            .add_block(peer(), 0, 0, Bytes::copy_from_slice(&datas[0][0..8]))
            .await
            .unwrap();
        match r {
            WriteOutcome::Written {
                piece_status: ChunkStatus::Incomplete,
                verified: None,
            } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }

        let r = worker
            .add_block(peer(), 0, 8, Bytes::copy_from_slice(&datas[0][8..16]))
            .await
            .unwrap();
        match r {
            WriteOutcome::Written {
                piece_status: ChunkStatus::Complete,
                verified: Some(true),
            } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(&*notified.lock(), &[0]);

        // Rewriting an already-verified piece never re-verifies or
        // re-notifies.
        let r = worker
            .add_block(peer(), 0, 0, Bytes::copy_from_slice(&datas[0][0..8]))
            .await
            .unwrap();
        match r {
            WriteOutcome::Written {
                piece_status: ChunkStatus::Complete,
                verified: None,
            } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(&*notified.lock(), &[0]);
    }

    #[tokio::test]
    async fn test_failed_verification_resets_piece() {
        let dir = tempfile::TempDir::new().unwrap();
        let (worker, datas) = fixture(&dir);
        let notified = Arc::new(Mutex::new(Vec::new()));
        let n = notified.clone();
        worker.add_verified_piece_listener(Box::new(move |idx| n.lock().push(idx.get())));

        let mut bad = datas[1].clone();
        bad[0] ^= 0xff;
        let r = worker
            .add_block(peer(), 1, 0, Bytes::from(bad))
            .await
            .unwrap();
        match r {
            WriteOutcome::Written {
                piece_status: ChunkStatus::Empty,
                verified: Some(false),
            } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(notified.lock().is_empty());

        // Re-download with good data verifies normally.
        let r = worker
            .add_block(peer(), 1, 0, Bytes::copy_from_slice(&datas[1]))
            .await
            .unwrap();
        match r {
            WriteOutcome::Written {
                piece_status: ChunkStatus::Complete,
                verified: Some(true),
            } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(&*notified.lock(), &[1]);
    }

    #[tokio::test]
    async fn test_read_roundtrip_and_invalid_piece() {
        let dir = tempfile::TempDir::new().unwrap();
        let (worker, datas) = fixture(&dir);
        worker
            .add_block(peer(), 0, 0, Bytes::copy_from_slice(&datas[0]))
            .await
            .unwrap();

        let r = worker.add_block_request(peer(), 0, 4, 8).await.unwrap();
        match r {
            ReadOutcome::Data(bytes) => assert_eq!(&bytes[..], &datas[0][4..12]),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let r = worker.add_block_request(peer(), 99, 0, 8).await.unwrap();
        assert!(matches!(
            r,
            ReadOutcome::Failed(Error::InvalidPieceIndex(99))
        ));
    }

    #[tokio::test]
    #[should_panic(expected = "one chunk descriptor per piece")]
    async fn test_spawn_requires_chunk_per_piece() {
        let dir = tempfile::TempDir::new().unwrap();
        let lengths = Lengths::new(32, 16, Some(8)).unwrap();
        let unit = Arc::new(StorageUnit::new(dir.path().join("data.bin"), 32));
        let cache = Arc::new(OpenFileCache::new(NonZeroUsize::new(4).unwrap()));
        // One descriptor for a two-piece torrent.
        let pi = lengths.iter_piece_infos().next().unwrap();
        let chunk = Arc::new(
            ChunkDescriptor::new(
                pi.index,
                pi.len,
                8,
                PieceHash([0u8; 20]),
                vec![FileSpan {
                    unit,
                    offset_in_unit: 0,
                    len: pi.len as u64,
                }],
                cache,
            )
            .unwrap(),
        );
        DataWorker::spawn(lengths, vec![chunk], Arc::new(DirectBlockCache), 4);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let dir = tempfile::TempDir::new().unwrap();
        let lengths = Lengths::new(32, 16, Some(8)).unwrap();
        let unit = Arc::new(StorageUnit::new(dir.path().join("data.bin"), 32));
        let cache = Arc::new(OpenFileCache::new(NonZeroUsize::new(4).unwrap()));
        let chunks: Vec<Arc<ChunkDescriptor>> = lengths
            .iter_piece_infos()
            .map(|pi| {
                Arc::new(
                    ChunkDescriptor::new(
                        pi.index,
                        pi.len,
                        8,
                        PieceHash([0u8; 20]),
                        vec![FileSpan {
                            unit: unit.clone(),
                            offset_in_unit: lengths.piece_offset(pi.index),
                            len: pi.len as u64,
                        }],
                        cache.clone(),
                    )
                    .unwrap(),
                )
            })
            .collect();
        let worker = DataWorker::spawn(lengths, chunks, Arc::new(DirectBlockCache), 1);

        // On a current-thread runtime the worker task has not run yet, so
        // the second request deterministically finds the queue full.
        let first = worker.add_block_request(peer(), 0, 0, 8);
        let second = worker.add_block_request(peer(), 0, 8, 8);
        assert!(matches!(second.await.unwrap(), ReadOutcome::Rejected));
        assert!(matches!(first.await.unwrap(), ReadOutcome::Data(_)));
    }
}
