use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex, MutexGuard},
};

use sha1::{Digest, Sha1};
use tokio::{
    sync::{watch, Mutex},
    task,
};
use tracing::{debug, info, warn};

use crate::{
    peer::{peer_connection::PeerConnection, peer_message::Bitfield},
    torrent_parser::torrent::Torrent,
    Sha1Hash, BLOCK_SIZE,
};

use super::disk;

/// Posible `PieceStore` errors.
#[derive(Debug)]
pub enum PieceStoreError {
    InvalidPieceIndex,
    PieceHashMismatch,
    PrepareOutputError(std::io::Error),
    SavePieceError(std::io::Error),
    ReadWorkerError,
}

/// State behind the store's single mutex.
struct StoreState {
    completed: Vec<bool>,
    blocks: HashMap<u32, HashMap<u32, Vec<u8>>>,
    in_progress: HashMap<u32, HashSet<SocketAddr>>,
    piece_events: HashMap<u32, watch::Sender<bool>>,
}

/// The authoritative map of piece completion and the shared scheduling
/// oracle for every request pipeline.
///
/// Holds per-piece block tables while pieces are being assembled, the
/// reservation table, one-shot completion events, and performs the disk
/// reads and writes. All mutable state lives behind one mutex; disk reads
/// run on the blocking worker pool.
pub struct PieceStore {
    torrent: Torrent,
    download_dir: PathBuf,
    state: Mutex<StoreState>,
    peers: StdMutex<Vec<Arc<PeerConnection>>>,
    done_tx: watch::Sender<bool>,
}

impl PieceStore {
    /// Creates the store and the output directory structure for the
    /// torrent's files.
    ///
    /// # Errors
    /// - `PrepareOutputError` if a parent directory could not be created.
    pub fn new(torrent: Torrent, download_dir: &str) -> Result<Self, PieceStoreError> {
        let download_dir = PathBuf::from(download_dir);
        disk::prepare_output_paths(&download_dir, &torrent.info.files)
            .map_err(PieceStoreError::PrepareOutputError)?;

        let num_pieces = torrent.total_pieces() as usize;
        let (done_tx, _) = watch::channel(num_pieces == 0);

        Ok(Self {
            state: Mutex::new(StoreState {
                completed: vec![false; num_pieces],
                blocks: HashMap::new(),
                in_progress: HashMap::new(),
                piece_events: HashMap::new(),
            }),
            torrent,
            download_dir,
            peers: StdMutex::new(Vec::new()),
            done_tx,
        })
    }

    /// Registers a live connection so piece rarity can be computed across
    /// the swarm. Closed peers stay in the list; their `closed` flag
    /// excludes them from the counts.
    pub fn register_peer(&self, peer: Arc<PeerConnection>) {
        self.lock_peers().push(peer);
    }

    /// A snapshot of every registered connection, for the choke manager's
    /// per-round view of the swarm.
    pub fn peers_snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.lock_peers().clone()
    }

    /// Reserves a piece for the peer.
    ///
    /// Prefers the rarest unreserved piece the peer has (ties broken by
    /// lowest index). When every needed piece is already reserved, enters
    /// endgame: joins the piece with the fewest workers that this peer is
    /// not already downloading. Returns `None` when the peer has nothing
    /// useful.
    pub async fn reserve_piece_for_peer(&self, peer: &PeerConnection) -> Option<u32> {
        let mut state = self.state.lock().await;
        let available = peer.available_pieces();

        let candidates: Vec<u32> = available
            .iter()
            .copied()
            .filter(|index| {
                !state.completed[*index as usize] && !state.in_progress.contains_key(index)
            })
            .collect();

        if !candidates.is_empty() {
            let counts = self.availability_counts(&candidates);
            let best = candidates
                .iter()
                .copied()
                .min_by_key(|index| (counts.get(index).copied().unwrap_or(0), *index))?;
            state
                .in_progress
                .entry(best)
                .or_default()
                .insert(peer.addr());
            return Some(best);
        }

        // Endgame: every piece we still need is being worked on by someone.
        let endgame: Vec<u32> = available
            .iter()
            .copied()
            .filter(|index| !state.completed[*index as usize])
            .filter(|index| {
                !state
                    .in_progress
                    .get(index)
                    .map_or(false, |workers| workers.contains(&peer.addr()))
            })
            .collect();
        if endgame.is_empty() {
            return None;
        }

        let best = endgame
            .iter()
            .copied()
            .min_by_key(|index| {
                (
                    state.in_progress.get(index).map_or(0, |workers| workers.len()),
                    *index,
                )
            })?;
        state
            .in_progress
            .entry(best)
            .or_default()
            .insert(peer.addr());
        debug!("Endgame reservation of piece {} for {}", best, peer.addr());
        Some(best)
    }

    /// Drops the peer's reservation of the piece, if it holds one.
    pub async fn release_piece(&self, index: u32, peer_addr: SocketAddr) {
        let mut state = self.state.lock().await;
        if let Some(workers) = state.in_progress.get_mut(&index) {
            workers.remove(&peer_addr);
            if workers.is_empty() {
                state.in_progress.remove(&index);
            }
        }
    }

    /// Records one downloaded block. When the last block of the piece
    /// arrives, assembles the piece, checks its SHA-1 and commits it to
    /// disk exactly once.
    ///
    /// A block for an already completed piece is discarded silently.
    /// Misshapen blocks (wrong offset alignment or length) are dropped.
    ///
    /// # Errors
    /// - `InvalidPieceIndex` for an out of range index.
    /// - `PieceHashMismatch` if the assembled piece fails verification; the
    ///   block table is cleared and the piece can be reserved again.
    /// - `SavePieceError` if the disk write fails.
    pub async fn store_block(
        &self,
        index: u32,
        begin: u32,
        block: Vec<u8>,
    ) -> Result<(), PieceStoreError> {
        if index >= self.torrent.total_pieces() {
            return Err(PieceStoreError::InvalidPieceIndex);
        }
        let piece_len = self.torrent.piece_len(index);
        let expected_len = BLOCK_SIZE.min(piece_len.saturating_sub(begin));
        if begin % BLOCK_SIZE != 0 || begin >= piece_len || block.len() as u32 != expected_len {
            debug!("Dropping misshapen block {}:{} ({} bytes)", index, begin, block.len());
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.completed[index as usize] {
            // Endgame leftover from a second worker.
            return Ok(());
        }

        state.blocks.entry(index).or_default().insert(begin, block);

        let table = match state.blocks.get(&index) {
            Some(table) => table,
            None => return Ok(()),
        };
        let mut assembled = Vec::with_capacity(piece_len as usize);
        let mut offset = 0;
        while offset < piece_len {
            match table.get(&offset) {
                Some(block) => assembled.extend_from_slice(block),
                // Still missing blocks.
                None => return Ok(()),
            }
            offset += BLOCK_SIZE;
        }

        let digest: Sha1Hash = Sha1::digest(&assembled).into();
        if digest != self.torrent.info.pieces[index as usize] {
            warn!("Piece {} failed hash check, discarding", index);
            state.blocks.insert(index, HashMap::new());
            return Err(PieceStoreError::PieceHashMismatch);
        }

        let piece_start = index as u64 * self.torrent.piece_length();
        disk::write_span(
            &self.download_dir,
            &self.torrent.info.files,
            piece_start,
            &assembled,
        )
        .map_err(PieceStoreError::SavePieceError)?;

        state.completed[index as usize] = true;
        state.blocks.remove(&index);
        state.in_progress.remove(&index);
        if let Some(event) = state.piece_events.get(&index) {
            let _ = event.send(true);
        }
        info!(
            "Piece {} written ({}/{})",
            index,
            state.completed.iter().filter(|done| **done).count(),
            self.torrent.total_pieces()
        );

        if state.completed.iter().all(|done| *done) {
            let _ = self.done_tx.send(true);
        }
        Ok(())
    }

    /// Returns a receiver on the piece's one-shot completion signal,
    /// creating it lazily. The receiver observes `true` once the piece has
    /// been committed to disk.
    pub async fn get_piece_event(&self, index: u32) -> watch::Receiver<bool> {
        let mut state = self.state.lock().await;
        let completed = state.completed.get(index as usize).copied().unwrap_or(false);
        state
            .piece_events
            .entry(index)
            .or_insert_with(|| watch::channel(completed).0)
            .subscribe()
    }

    /// Whether the piece has been committed to disk.
    pub async fn piece_complete(&self, index: u32) -> bool {
        let state = self.state.lock().await;
        state.completed.get(index as usize).copied().unwrap_or(false)
    }

    pub async fn all_pieces_done(&self) -> bool {
        let state = self.state.lock().await;
        state.completed.iter().all(|done| *done)
    }

    pub async fn downloaded_pieces(&self) -> usize {
        let state = self.state.lock().await;
        state.completed.iter().filter(|done| **done).count()
    }

    /// A receiver that observes `true` once every piece is on disk.
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Our current piece availability, for advertising to peers.
    pub async fn completed_bitfield(&self) -> Bitfield {
        let state = self.state.lock().await;
        Bitfield::from_completed(&state.completed)
    }

    pub fn get_piece_length(&self, index: u32) -> u32 {
        self.torrent.piece_len(index)
    }

    pub fn num_pieces(&self) -> u32 {
        self.torrent.total_pieces()
    }

    pub fn torrent(&self) -> &Torrent {
        &self.torrent
    }

    /// Reads a block of an already completed piece for uploading. The read
    /// runs on the blocking worker pool so the event loop is not held up.
    ///
    /// Returns `None` if the piece is not complete or the read fails.
    pub async fn read_block(&self, index: u32, begin: u32, length: u32) -> Option<Vec<u8>> {
        if !self.piece_complete(index).await {
            return None;
        }

        let download_dir = self.download_dir.clone();
        let files = self.torrent.info.files.clone();
        let start = index as u64 * self.torrent.piece_length() + begin as u64;

        task::spawn_blocking(move || disk::read_span(&download_dir, &files, start, length as usize))
            .await
            .ok()?
            .ok()
    }

    /// One-shot startup scan: reads every piece back from disk and marks
    /// the ones whose SHA-1 still matches as completed, enabling resume.
    /// Missing or short files simply mean "not complete".
    ///
    /// Returns how many pieces were recovered.
    pub async fn verify_existing_data(&self) -> Result<usize, PieceStoreError> {
        let torrent = self.torrent.clone();
        let download_dir = self.download_dir.clone();

        let verified: Vec<bool> = task::spawn_blocking(move || {
            (0..torrent.total_pieces())
                .map(|index| {
                    let start = index as u64 * torrent.piece_length();
                    let length = torrent.piece_len(index) as usize;
                    match disk::read_span(&download_dir, &torrent.info.files, start, length) {
                        Ok(data) => {
                            let digest: Sha1Hash = Sha1::digest(&data).into();
                            digest == torrent.info.pieces[index as usize]
                        }
                        Err(_) => false,
                    }
                })
                .collect()
        })
        .await
        .map_err(|_| PieceStoreError::ReadWorkerError)?;

        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for (index, ok) in verified.iter().enumerate() {
            if *ok && !state.completed[index] {
                state.completed[index] = true;
                if let Some(event) = state.piece_events.get(&(index as u32)) {
                    let _ = event.send(true);
                }
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("Resumed {} verified pieces from disk", recovered);
        }
        if !state.completed.is_empty() && state.completed.iter().all(|done| *done) {
            let _ = self.done_tx.send(true);
        }
        Ok(recovered)
    }

    /// Counts how many live peers claim each candidate piece.
    fn availability_counts(&self, candidates: &[u32]) -> HashMap<u32, usize> {
        let peers = self.lock_peers();
        candidates
            .iter()
            .map(|index| {
                let count = peers
                    .iter()
                    .filter(|peer| !peer.is_closed() && peer.has_piece(*index))
                    .count();
                (*index, count)
            })
            .collect()
    }

    fn lock_peers(&self) -> MutexGuard<Vec<Arc<PeerConnection>>> {
        match self.peers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
