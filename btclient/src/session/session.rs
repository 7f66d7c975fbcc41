use std::{net::SocketAddr, sync::Arc, time::Duration};

use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, info, warn};

use crate::{
    config::cfg::Cfg,
    peer::{
        choke_manager::ChokeManager,
        peer_connection::PeerConnection,
        peer_session::PeerSession,
    },
    piece_store::store::{PieceStore, PieceStoreError},
    torrent_parser::torrent::Torrent,
    tracker::tracker_handler::{TrackerHandler, TrackerHandlerError},
    PeerId,
};

/// Posible `Session` errors.
#[derive(Debug)]
pub enum SessionError {
    StoreError(PieceStoreError),
    TrackerError(TrackerHandlerError),
    NoPeersConnected,
    AllPeersDied,
}

/// Composes the whole download: the piece store, one request pipeline per
/// connected peer, and the periodic choke task. Runs until the store
/// reports every piece on disk, then cancels the pipelines and closes the
/// sockets.
pub struct Session {
    torrent: Torrent,
    config: Cfg,
    store: Arc<PieceStore>,
    client_peer_id: PeerId,
}

impl Session {
    pub fn new(torrent: Torrent, config: Cfg) -> Result<Self, SessionError> {
        let store = Arc::new(
            PieceStore::new(torrent.clone(), &config.download_dir)
                .map_err(SessionError::StoreError)?,
        );

        Ok(Self {
            torrent,
            config,
            store,
            client_peer_id: Self::generate_peer_id(),
        })
    }

    /// An Azureus style peer id: client prefix plus twelve random
    /// alphanumeric bytes.
    fn generate_peer_id() -> PeerId {
        let mut peer_id: PeerId = *b"-RB0001-000000000000";
        let suffix: Vec<u8> = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .collect();
        peer_id[8..].copy_from_slice(&suffix);
        peer_id
    }

    pub fn store(&self) -> Arc<PieceStore> {
        self.store.clone()
    }

    /// Verifies any data already on disk, announces to the tracker, and
    /// downloads from the returned peers until the torrent completes.
    ///
    /// It returns an error if:
    /// - The announce fails.
    /// - No peer could be connected, or every peer died before completion.
    pub async fn run(&self) -> Result<(), SessionError> {
        self.store
            .verify_existing_data()
            .await
            .map_err(SessionError::StoreError)?;
        if self.store.all_pieces_done().await {
            info!("Torrent: {} already complete on disk", self.torrent.name());
            return Ok(());
        }

        let tracker = TrackerHandler::new(
            self.torrent.clone(),
            self.config.tcp_port,
            self.client_peer_id,
        )
        .map_err(SessionError::TrackerError)?;
        let tracker_response = tracker
            .get_peers_list()
            .await
            .map_err(SessionError::TrackerError)?;
        info!(
            "Tracker returned {} peers ({} seeders / {} leechers)",
            tracker_response.peers.len(),
            tracker_response.complete,
            tracker_response.incomplete
        );

        self.download_from(tracker_response.peers).await
    }

    /// Downloads the torrent from the given peer endpoints.
    pub async fn download_from(&self, endpoints: Vec<SocketAddr>) -> Result<(), SessionError> {
        let peers = self.connect_peers(endpoints).await;
        if peers.is_empty() {
            return Err(SessionError::NoPeersConnected);
        }
        info!("Connected to {} peers", peers.len());

        let choke_manager = ChokeManager::new(self.config.clone());
        let choke_task = tokio::spawn(choke_manager.run(
            self.store.clone(),
            self.store.subscribe_done(),
        ));

        let mut pipelines = Vec::with_capacity(peers.len());
        for peer in &peers {
            let pipeline = PeerSession::new(peer.clone(), self.store.clone(), self.config.clone());
            let mut done = self.store.subscribe_done();
            let peer = peer.clone();
            pipelines.push(tokio::spawn(async move {
                let result = tokio::select! {
                    result = pipeline.start() => Some(result),
                    _ = done.wait_for(|done| *done) => None,
                };
                match result {
                    Some(Ok(())) => debug!("Pipeline for {} finished", peer.addr()),
                    Some(Err(err)) => warn!("Pipeline for {} failed: {:?}", peer.addr(), err),
                    None => debug!("Pipeline for {} cancelled", peer.addr()),
                }
                peer.close().await;
            }));
        }

        let mut done = self.store.subscribe_done();
        let result = tokio::select! {
            _ = done.wait_for(|done| *done) => {
                info!("Torrent: {} download finished", self.torrent.name());
                Ok(())
            }
            _ = futures::future::join_all(pipelines) => {
                if self.store.all_pieces_done().await {
                    info!("Torrent: {} download finished", self.torrent.name());
                    Ok(())
                } else {
                    Err(SessionError::AllPeersDied)
                }
            }
        };

        choke_task.abort();
        for peer in &peers {
            peer.close().await;
        }
        result
    }

    /// Dials every endpoint concurrently; failures are logged and skipped.
    async fn connect_peers(&self, endpoints: Vec<SocketAddr>) -> Vec<Arc<PeerConnection>> {
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_s);
        let num_pieces = self.torrent.total_pieces();
        let info_hash = self.torrent.info_hash;
        let client_peer_id = self.client_peer_id;

        let attempts: Vec<_> = endpoints
            .into_iter()
            .take(self.config.max_peers as usize)
            .map(|addr| {
                tokio::spawn(async move {
                    PeerConnection::connect(addr, info_hash, client_peer_id, num_pieces, connect_timeout)
                        .await
                        .map_err(|err| (addr, err))
                })
            })
            .collect();

        let mut peers = Vec::new();
        for attempt in attempts {
            match attempt.await {
                Ok(Ok(conn)) => {
                    let conn = Arc::new(conn);
                    self.store.register_peer(conn.clone());
                    peers.push(conn);
                }
                Ok(Err((addr, err))) => debug!("Could not connect to {}: {:?}", addr, err),
                Err(err) => warn!("Connect task failed: {:?}", err),
            }
        }
        peers
    }
}
