use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::cfg::Cfg,
    piece_store::store::{PieceStore, PieceStoreError},
    BLOCK_SIZE, MAX_REQUEST_SIZE,
};

use super::{
    peer_connection::{PeerConnection, PeerConnectionError},
    peer_message::{Message, MessageId, Request},
};

#[derive(Debug)]
pub enum PeerSessionError {
    PeerConnectionError(PeerConnectionError),
    PeerClosedConnection,
    BlockTimeout(u32),
    PieceHashDoesNotMatch(u32),
    PieceEventDropped(u32),
    StoreError(PieceStoreError),
    NoPiecesLeftToDownloadInThisPeer,
}

/// The request pipeline: drives one connected peer through
/// interested → unchoke → reserve piece → pipelined block requests →
/// block ingest → commit, over and over until the peer has nothing useful
/// or the torrent completes. Also answers the peer's own block requests.
pub struct PeerSession {
    peer: Arc<PeerConnection>,
    store: Arc<PieceStore>,
    config: Cfg,
}

impl PeerSession {
    pub fn new(peer: Arc<PeerConnection>, store: Arc<PieceStore>, config: Cfg) -> Self {
        Self {
            peer,
            store,
            config,
        }
    }

    /// Runs the pipeline to completion.
    ///
    /// It returns an error if:
    /// - The peer times out, closes the stream, or sends a corrupt piece.
    /// - There are no pieces left that this peer can provide.
    pub async fn start(&self) -> Result<(), PeerSessionError> {
        // Advertise what we already have, so a resumed client can be asked
        // for uploads.
        let bitfield = self.store.completed_bitfield().await;
        if bitfield.has_any_piece() {
            self.peer
                .send(Message::new(MessageId::Bitfield, bitfield.get_vec()))
                .await
                .map_err(PeerSessionError::PeerConnectionError)?;
        }

        self.peer
            .send(Message::new(MessageId::Interested, vec![]))
            .await
            .map_err(PeerSessionError::PeerConnectionError)?;

        self.wait_for_unchoke().await?;

        loop {
            if self.store.all_pieces_done().await {
                return Ok(());
            }

            let piece_index = match self.store.reserve_piece_for_peer(&self.peer).await {
                Some(index) => index,
                None => {
                    if self.store.all_pieces_done().await {
                        return Ok(());
                    }
                    debug!("No more pieces to download from {}", self.peer.addr());
                    return Err(PeerSessionError::NoPiecesLeftToDownloadInThisPeer);
                }
            };

            if let Err(err) = self.download_piece(piece_index).await {
                self.store
                    .release_piece(piece_index, self.peer.addr())
                    .await;
                return Err(err);
            }
        }
    }

    /// Reads messages until the peer unchokes us, answering any block
    /// requests that arrive in the meantime.
    async fn wait_for_unchoke(&self) -> Result<(), PeerSessionError> {
        while self.peer.peer_choking() {
            let msg = self
                .peer
                .read_message()
                .await
                .map_err(PeerSessionError::PeerConnectionError)?;
            if msg.id == MessageId::Request {
                self.handle_request(&msg.payload).await;
            }
        }
        Ok(())
    }

    /// Downloads one piece through a sliding window of pipelined block
    /// requests.
    ///
    /// Waits on "next message OR the piece's completion event OR the block
    /// idle timer". The completion event fires when another worker finishes
    /// the piece during endgame; still pending requests are cancelled and
    /// the download counts as a success.
    async fn download_piece(&self, piece_index: u32) -> Result<(), PeerSessionError> {
        let piece_len = self.store.get_piece_length(piece_index);
        let mut piece_event = self.store.get_piece_event(piece_index).await;
        let mut pending: HashSet<u32> = HashSet::new();
        let mut next_offset: u32 = 0;

        // Fill the window, batching the writes and draining once.
        let window = self.build_requests(piece_index, piece_len, &mut pending, &mut next_offset);
        self.peer
            .send_all(window)
            .await
            .map_err(PeerSessionError::PeerConnectionError)?;

        while !self.store.piece_complete(piece_index).await {
            if self.store.all_pieces_done().await {
                return Ok(());
            }

            let msg = tokio::select! {
                result = self.peer.read_message() => {
                    match result {
                        Ok(msg) => Some(msg),
                        Err(PeerConnectionError::ConnectionClosed) => {
                            return Err(PeerSessionError::PeerClosedConnection)
                        }
                        Err(err) => return Err(PeerSessionError::PeerConnectionError(err)),
                    }
                }
                event = piece_event.wait_for(|done| *done) => {
                    if event.is_err() {
                        return Err(PeerSessionError::PieceEventDropped(piece_index));
                    }
                    None
                }
                _ = sleep(Duration::from_secs(self.config.block_timeout_s)) => {
                    warn!(
                        "Block timeout on piece {} from {}",
                        piece_index,
                        self.peer.addr()
                    );
                    return Err(PeerSessionError::BlockTimeout(piece_index));
                }
            };

            let msg = match msg {
                Some(msg) => msg,
                None => {
                    // Another peer finished this piece while we were racing
                    // it in endgame.
                    self.cancel_pending(piece_index, piece_len, &pending).await;
                    return Ok(());
                }
            };

            match msg.id {
                MessageId::Request => self.handle_request(&msg.payload).await,
                MessageId::Piece => {
                    let (got_index, begin, block) = match Self::parse_piece_payload(&msg.payload) {
                        Some(parts) => parts,
                        None => continue,
                    };
                    if got_index != piece_index {
                        // Endgame leftover of an earlier reservation.
                        continue;
                    }
                    pending.remove(&begin);

                    match self.store.store_block(piece_index, begin, block).await {
                        Ok(()) => (),
                        Err(PieceStoreError::PieceHashMismatch) => {
                            return Err(PeerSessionError::PieceHashDoesNotMatch(piece_index))
                        }
                        Err(err) => return Err(PeerSessionError::StoreError(err)),
                    }

                    // Slide the window.
                    let refill =
                        self.build_requests(piece_index, piece_len, &mut pending, &mut next_offset);
                    if !refill.is_empty() {
                        self.peer
                            .send_all(refill)
                            .await
                            .map_err(PeerSessionError::PeerConnectionError)?;
                    }
                }
                // Choke and interest changes were already applied by the
                // connection; keep-alives need nothing.
                _ => (),
            }
        }

        info!(
            "Piece {} downloaded from {} ({}/{})",
            piece_index,
            self.peer.addr(),
            self.store.downloaded_pieces().await,
            self.store.num_pieces()
        );
        Ok(())
    }

    /// Builds REQUEST messages until the window is full or the piece's
    /// offset space is exhausted, tracking them in `pending`.
    fn build_requests(
        &self,
        piece_index: u32,
        piece_len: u32,
        pending: &mut HashSet<u32>,
        next_offset: &mut u32,
    ) -> Vec<Message> {
        let mut requests = Vec::new();
        while *next_offset < piece_len && pending.len() < self.config.pipeline_depth as usize {
            let len = BLOCK_SIZE.min(piece_len - *next_offset);
            requests.push(Message::new(
                MessageId::Request,
                Request::new(piece_index, *next_offset, len).as_bytes(),
            ));
            pending.insert(*next_offset);
            *next_offset += len;
        }
        requests
    }

    /// Sends a CANCEL for every still pending request of the piece, saving
    /// the peer the bandwidth of answering them.
    async fn cancel_pending(&self, piece_index: u32, piece_len: u32, pending: &HashSet<u32>) {
        let cancels: Vec<Message> = pending
            .iter()
            .map(|offset| {
                let len = BLOCK_SIZE.min(piece_len - offset);
                Message::new(
                    MessageId::Cancel,
                    Request::new(piece_index, *offset, len).as_bytes(),
                )
            })
            .collect();
        if cancels.is_empty() {
            return;
        }
        if let Err(err) = self.peer.send_all(cancels).await {
            debug!("Could not cancel requests on {}: {:?}", self.peer.addr(), err);
        }
    }

    /// The upload path: answers an incoming REQUEST with the block read
    /// from disk.
    ///
    /// Silently ignored when we are choking the peer, when the request is
    /// oversized or malformed, or when the piece is not complete yet.
    async fn handle_request(&self, payload: &[u8]) {
        if self.peer.we_choking() {
            return;
        }
        let request = match Request::from_bytes(payload) {
            Ok(request) => request,
            Err(_) => return,
        };
        if request.length > MAX_REQUEST_SIZE {
            return;
        }

        let block = match self
            .store
            .read_block(request.index, request.begin, request.length)
            .await
        {
            Some(block) => block,
            None => return,
        };

        let mut piece_payload = Vec::with_capacity(8 + block.len());
        piece_payload.extend(request.index.to_be_bytes());
        piece_payload.extend(request.begin.to_be_bytes());
        piece_payload.extend(block);

        match self
            .peer
            .send(Message::new(MessageId::Piece, piece_payload))
            .await
        {
            Ok(()) => debug!(
                "Sent piece {} / offset {} to {}",
                request.index,
                request.begin,
                self.peer.addr()
            ),
            Err(err) => debug!("Could not serve {}: {:?}", self.peer.addr(), err),
        }
    }

    fn parse_piece_payload(payload: &[u8]) -> Option<(u32, u32, Vec<u8>)> {
        if payload.len() < 8 {
            return None;
        }
        let mut index = [0; 4];
        let mut begin = [0; 4];
        index.copy_from_slice(&payload[0..4]);
        begin.copy_from_slice(&payload[4..8]);
        Some((
            u32::from_be_bytes(index),
            u32::from_be_bytes(begin),
            payload[8..].to_vec(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        peer::peer_message::{handshake::HANDSHAKE_LEN, Handshake},
        torrent_parser::{
            info::{Info, TorrentFile},
            torrent::Torrent,
        },
        PeerId, Sha1Hash,
    };
    use sha1::{Digest, Sha1};
    use std::{fs, net::SocketAddr, path::Path, path::PathBuf};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        task::JoinHandle,
    };

    const INFO_HASH: Sha1Hash = [7; 20];
    const OUR_ID: PeerId = *b"-RB0001-012345678901";
    const REMOTE_ID: PeerId = *b"-RB0001-fakeseeder00";

    /// Scenario: a fake seeder with one 16 KiB piece of zeros serves it
    /// honestly. The session must send INTERESTED before anything else,
    /// request at least once, and leave the verified piece on disk.
    #[tokio::test]
    async fn test_download_single_piece_from_fake_seeder() {
        let dir = test_dir("session_download");
        let piece = vec![0u8; BLOCK_SIZE as usize];
        let store = Arc::new(build_store(&dir, piece.clone()));
        let (addr, seeder) = spawn_fake_seeder(piece, ServeMode::Honest).await;

        let peer = connect(addr).await;
        store.register_peer(peer.clone());
        let session = PeerSession::new(peer.clone(), store.clone(), Cfg::default());

        session.start().await.unwrap();
        peer.close().await;
        let received = seeder.await.unwrap();

        assert_eq!(received[0], 2); // INTERESTED first
        assert!(received.iter().any(|id| *id == 6)); // at least one REQUEST
        assert!(store.piece_complete(0).await);
        assert_eq!(
            fs::metadata(dir.join("out.bin")).unwrap().len(),
            BLOCK_SIZE as u64
        );
        cleanup(&dir);
    }

    /// Scenario: the fake seeder answers with 16 KiB of 0x01 instead. The
    /// hash check must fail, the blocks be discarded and the piece stay
    /// reservable.
    #[tokio::test]
    async fn test_download_corrupt_piece_fails_and_releases() {
        let dir = test_dir("session_corrupt");
        let piece = vec![0u8; BLOCK_SIZE as usize];
        let store = Arc::new(build_store(&dir, piece));
        let (addr, _seeder) = spawn_fake_seeder(vec![1u8; BLOCK_SIZE as usize], ServeMode::Honest).await;

        let peer = connect(addr).await;
        store.register_peer(peer.clone());
        let session = PeerSession::new(peer.clone(), store.clone(), Cfg::default());

        assert!(matches!(
            session.start().await,
            Err(PeerSessionError::PieceHashDoesNotMatch(0))
        ));
        assert!(!store.piece_complete(0).await);
        // The reservation was released, so the piece can be taken again.
        assert_eq!(store.reserve_piece_for_peer(&peer).await, Some(0));
        cleanup(&dir);
    }

    /// A seeder that unchokes but never answers trips the block idle timer.
    #[tokio::test]
    async fn test_download_block_timeout() {
        let dir = test_dir("session_timeout");
        let piece = vec![0u8; BLOCK_SIZE as usize];
        let store = Arc::new(build_store(&dir, piece));
        let (addr, _seeder) = spawn_fake_seeder(vec![], ServeMode::Silent).await;

        let peer = connect(addr).await;
        store.register_peer(peer.clone());
        let config = Cfg {
            block_timeout_s: 1,
            ..Cfg::default()
        };
        let session = PeerSession::new(peer.clone(), store.clone(), config);

        assert!(matches!(
            session.start().await,
            Err(PeerSessionError::BlockTimeout(0))
        ));
        cleanup(&dir);
    }

    /// Endgame: while this session waits on a silent peer, another worker
    /// commits the piece. The session must return success immediately and
    /// cancel its outstanding requests.
    #[tokio::test]
    async fn test_piece_event_finishes_download() {
        let dir = test_dir("session_event");
        let piece = vec![0u8; BLOCK_SIZE as usize];
        let store = Arc::new(build_store(&dir, piece.clone()));
        let (addr, seeder) = spawn_fake_seeder(vec![], ServeMode::Silent).await;

        let peer = connect(addr).await;
        store.register_peer(peer.clone());
        let session = PeerSession::new(peer.clone(), store.clone(), Cfg::default());

        let store_clone = store.clone();
        let committer = tokio::spawn(async move {
            // Give the session time to issue its requests first.
            sleep(Duration::from_millis(200)).await;
            store_clone.store_block(0, 0, piece).await.unwrap();
        });

        session.start().await.unwrap();
        committer.await.unwrap();
        peer.close().await;
        let received = seeder.await.unwrap();

        assert!(received.iter().any(|id| *id == 8)); // CANCEL for the pending block
        assert!(store.all_pieces_done().await);
        cleanup(&dir);
    }

    /// The upload path: once we hold the piece and are not choking, an
    /// incoming REQUEST is answered with the block; oversized requests are
    /// dropped.
    #[tokio::test]
    async fn test_handle_request_serves_completed_piece() {
        let dir = test_dir("session_upload");
        let piece: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 13) as u8).collect();
        let store = Arc::new(build_store(&dir, piece.clone()));
        store.store_block(0, 0, piece.clone()).await.unwrap();

        let (addr, seeder) = spawn_fake_seeder(vec![], ServeMode::Silent).await;
        let peer = connect(addr).await;
        let session = PeerSession::new(peer.clone(), store.clone(), Cfg::default());

        // We are choking: ignored.
        session
            .handle_request(&Request::new(0, 0, 64).as_bytes())
            .await;
        // Unchoke the peer, then serve.
        peer.send(Message::new(MessageId::Unchoke, vec![]))
            .await
            .unwrap();
        session
            .handle_request(&Request::new(0, 128, 64).as_bytes())
            .await;
        // Oversized: dropped.
        session
            .handle_request(&Request::new(0, 0, MAX_REQUEST_SIZE + 1).as_bytes())
            .await;

        peer.close().await;
        let received = seeder.await.unwrap();
        assert_eq!(received, vec![1, 7]); // our UNCHOKE, then exactly one PIECE

        let (_down, up, _duration) = peer.reset_stats();
        assert_eq!(up, 64);
        cleanup(&dir);
    }

    // Auxiliary functions

    enum ServeMode {
        /// Answer each REQUEST with the corresponding slice of the piece.
        Honest,
        /// Unchoke but never answer anything.
        Silent,
    }

    async fn connect(addr: SocketAddr) -> Arc<PeerConnection> {
        let conn =
            PeerConnection::connect(addr, INFO_HASH, OUR_ID, 1, Duration::from_secs(5))
                .await
                .unwrap();
        // Consume the seeder's bitfield so availability is known.
        conn.read_message().await.unwrap();
        Arc::new(conn)
    }

    fn build_store(dir: &Path, piece: Vec<u8>) -> PieceStore {
        let total_length = piece.len() as u64;
        let torrent = Torrent {
            announce_url: "http://example.com/announce".to_string(),
            info: Info {
                name: "example".to_string(),
                piece_length: BLOCK_SIZE as u64,
                pieces: vec![Sha1::digest(&piece).into()],
                files: vec![TorrentFile {
                    path: "out.bin".to_string(),
                    length: total_length,
                    offset: 0,
                }],
                total_length,
            },
            info_hash: INFO_HASH,
        };
        PieceStore::new(torrent, dir.to_str().unwrap()).unwrap()
    }

    /// A fake remote seeder holding one piece. Performs the handshake,
    /// advertises the piece, unchokes when asked, optionally serves block
    /// requests, and returns the IDs of every frame it received once the
    /// client hangs up.
    async fn spawn_fake_seeder(
        piece: Vec<u8>,
        mode: ServeMode,
    ) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut incoming = [0; HANDSHAKE_LEN];
            socket.read_exact(&mut incoming).await.unwrap();
            socket
                .write_all(&Handshake::new(INFO_HASH, REMOTE_ID).as_bytes())
                .await
                .unwrap();
            socket
                .write_all(&Message::new(MessageId::Bitfield, vec![0b1000_0000]).as_bytes())
                .await
                .unwrap();

            let mut received = Vec::new();
            while let Some((id, payload)) = read_frame(&mut socket).await {
                received.push(id);
                match id {
                    2 => {
                        // INTERESTED: unchoke the client.
                        socket
                            .write_all(&Message::new(MessageId::Unchoke, vec![]).as_bytes())
                            .await
                            .unwrap();
                    }
                    6 => {
                        if let ServeMode::Honest = mode {
                            let request = Request::from_bytes(&payload).unwrap();
                            let begin = request.begin as usize;
                            let end = begin + request.length as usize;
                            let mut body = Vec::new();
                            body.extend(request.index.to_be_bytes());
                            body.extend(request.begin.to_be_bytes());
                            body.extend(&piece[begin..end]);
                            socket
                                .write_all(&Message::new(MessageId::Piece, body).as_bytes())
                                .await
                                .unwrap();
                        }
                    }
                    _ => (),
                }
            }
            received
        });

        (addr, handle)
    }

    async fn read_frame(socket: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let mut len_buf = [0; 4];
        socket.read_exact(&mut len_buf).await.ok()?;
        let len = u32::from_be_bytes(len_buf);
        if len == 0 {
            return Some((255, vec![])); // keep-alive marker
        }
        let mut body = vec![0; len as usize];
        socket.read_exact(&mut body).await.ok()?;
        Some((body[0], body[1..].to_vec()))
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("btclient_{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }
}
