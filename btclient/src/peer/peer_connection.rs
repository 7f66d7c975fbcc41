use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::{PeerId, Sha1Hash};

use super::peer_message::{
    handshake::HANDSHAKE_LEN, Bitfield, CodecError, Handshake, Message, MessageId, PeerCodec,
};

/// Posible `PeerConnection` errors.
///
/// Everything here is terminal for the connection: the caller is expected to
/// drop the peer and move on.
#[derive(Debug)]
pub enum PeerConnectionError {
    ConnectTimeout,
    CouldNotConnectToPeer,
    HandshakeTimeout,
    ClosedDuringHandshake,
    InvalidHandshake,
    InfoHashMismatch,
    PeerIsOurself,
    ConnectionClosed,
    ErrorReadingMessage(CodecError),
    ErrorSendingMessage(CodecError),
}

/// The four choke/interest flags of a peer session, in their protocol
/// defined initial state.
#[derive(Debug, Clone, Copy)]
struct Flags {
    we_choking: bool,
    we_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            we_choking: true,
            we_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// What the peer claims to have: the raw bitfield (if one was sent) plus
/// piece indices learned from HAVE messages.
#[derive(Debug, Default)]
struct Availability {
    bitfield: Option<Bitfield>,
    have: HashSet<u32>,
}

impl Availability {
    fn has_piece(&self, index: u32) -> bool {
        if self.have.contains(&index) {
            return true;
        }
        match &self.bitfield {
            Some(bitfield) => bitfield.has_piece(index),
            None => false,
        }
    }
}

/// Byte meters sampled and reset by the choke manager.
#[derive(Debug)]
struct Meters {
    downloaded_sample: u64,
    uploaded_sample: u64,
    last_reset: Instant,
    last_write: Instant,
}

/// A live duplex session with one peer.
///
/// Owns the socket (split into framed halves), tracks the four choke/interest
/// flags, collects piece availability, and meters bytes in both directions.
/// The read half is only ever drained by the peer's request pipeline; the
/// write half is shared with the choke manager, which sends choke decisions
/// and keep-alives.
pub struct PeerConnection {
    addr: SocketAddr,
    remote_peer_id: PeerId,
    num_pieces: u32,
    sink: tokio::sync::Mutex<SplitSink<Framed<TcpStream, PeerCodec>, Message>>,
    stream: tokio::sync::Mutex<SplitStream<Framed<TcpStream, PeerCodec>>>,
    flags: Mutex<Flags>,
    availability: Mutex<Availability>,
    meters: Mutex<Meters>,
    closed: AtomicBool,
}

impl PeerConnection {
    /// Opens a TCP connection to `addr` and performs the handshake exchange,
    /// both bounded by `connect_timeout`.
    ///
    /// It returns an error if:
    /// - The TCP connect fails or times out.
    /// - The peer closes the stream mid-handshake or the reply times out.
    /// - The reply is not a valid handshake.
    /// - The advertised info-hash is not ours, or the peer is ourself.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        our_peer_id: PeerId,
        num_pieces: u32,
        connect_timeout: Duration,
    ) -> Result<Self, PeerConnectionError> {
        let mut socket = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(_)) => return Err(PeerConnectionError::CouldNotConnectToPeer),
            Err(_) => return Err(PeerConnectionError::ConnectTimeout),
        };

        let handshake = Handshake::new(info_hash, our_peer_id);
        socket
            .write_all(&handshake.as_bytes())
            .await
            .map_err(|_| PeerConnectionError::ClosedDuringHandshake)?;

        let mut reply = [0; HANDSHAKE_LEN];
        match timeout(connect_timeout, socket.read_exact(&mut reply)).await {
            Ok(Ok(_)) => (),
            Ok(Err(_)) => return Err(PeerConnectionError::ClosedDuringHandshake),
            Err(_) => return Err(PeerConnectionError::HandshakeTimeout),
        }

        let remote = Handshake::from_bytes(&reply)
            .map_err(|_| PeerConnectionError::InvalidHandshake)?;

        if remote.info_hash != info_hash {
            return Err(PeerConnectionError::InfoHashMismatch);
        }
        // Avoid connecting to ourself.
        if remote.peer_id == our_peer_id {
            return Err(PeerConnectionError::PeerIsOurself);
        }

        info!("IP: {} Handshake successful", addr);

        let now = Instant::now();
        let (sink, stream) = Framed::new(socket, PeerCodec).split();

        Ok(Self {
            addr,
            remote_peer_id: remote.peer_id,
            num_pieces,
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            flags: Mutex::new(Flags::default()),
            availability: Mutex::new(Availability::default()),
            meters: Mutex::new(Meters {
                downloaded_sample: 0,
                uploaded_sample: 0,
                last_reset: now,
                last_write: now,
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Frames and writes a single message.
    pub async fn send(&self, msg: Message) -> Result<(), PeerConnectionError> {
        self.send_all(vec![msg]).await
    }

    /// Frames and writes a batch of messages, draining the socket once at
    /// the end.
    ///
    /// Sends on a closed connection are silently dropped. On a write error
    /// the connection is marked closed and the error returned.
    pub async fn send_all(&self, msgs: Vec<Message>) -> Result<(), PeerConnectionError> {
        if self.is_closed() {
            return Ok(());
        }

        let sent: Vec<(MessageId, usize)> =
            msgs.iter().map(|msg| (msg.id, msg.payload.len())).collect();

        let mut sink = self.sink.lock().await;
        for msg in msgs {
            if let Err(err) = sink.feed(msg).await {
                self.closed.store(true, Ordering::Relaxed);
                return Err(PeerConnectionError::ErrorSendingMessage(err));
            }
        }
        if let Err(err) = sink.flush().await {
            self.closed.store(true, Ordering::Relaxed);
            return Err(PeerConnectionError::ErrorSendingMessage(err));
        }
        drop(sink);

        for (id, payload_len) in sent {
            self.apply_outgoing(id, payload_len);
        }
        Ok(())
    }

    /// Reads the next framed message from the peer and applies its state
    /// updates (flags, availability, download meter).
    ///
    /// It returns an error if:
    /// - The peer closed the stream (`ConnectionClosed`).
    /// - The frame was malformed or oversized.
    pub async fn read_message(&self) -> Result<Message, PeerConnectionError> {
        let mut stream = self.stream.lock().await;
        let next = stream.next().await;
        drop(stream);

        match next {
            None => {
                self.closed.store(true, Ordering::Relaxed);
                Err(PeerConnectionError::ConnectionClosed)
            }
            Some(Err(err)) => {
                self.closed.store(true, Ordering::Relaxed);
                Err(PeerConnectionError::ErrorReadingMessage(err))
            }
            Some(Ok(msg)) => {
                self.apply_incoming(&msg);
                Ok(msg)
            }
        }
    }

    /// Returns whether the peer appears to have the given piece, either via
    /// its bitfield or an explicit HAVE.
    pub fn has_piece(&self, index: u32) -> bool {
        self.lock_availability().has_piece(index)
    }

    /// Returns the indices of every piece this peer claims to have.
    pub fn available_pieces(&self) -> Vec<u32> {
        let availability = self.lock_availability();
        (0..self.num_pieces)
            .filter(|index| availability.has_piece(*index))
            .collect()
    }

    /// Returns `(bytes_downloaded, bytes_uploaded, duration)` since the last
    /// call and zeroes the counters.
    pub fn reset_stats(&self) -> (u64, u64, Duration) {
        let mut meters = self.lock_meters();
        let now = Instant::now();
        let duration = now.duration_since(meters.last_reset);
        let downloaded = meters.downloaded_sample;
        let uploaded = meters.uploaded_sample;
        meters.downloaded_sample = 0;
        meters.uploaded_sample = 0;
        meters.last_reset = now;
        (downloaded, uploaded, duration)
    }

    /// Time since the last outbound write, used for keep-alive scheduling.
    pub fn outbound_silence(&self) -> Duration {
        self.lock_meters().last_write.elapsed()
    }

    pub fn we_choking(&self) -> bool {
        self.lock_flags().we_choking
    }

    pub fn we_interested(&self) -> bool {
        self.lock_flags().we_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.lock_flags().peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.lock_flags().peer_interested
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    /// Marks the connection closed and shuts the write half down.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let mut sink = self.sink.lock().await;
        if let Err(err) = sink.close().await {
            debug!("IP: {} Error closing sink: {:?}", self.addr, err);
        }
    }

    fn apply_outgoing(&self, id: MessageId, payload_len: usize) {
        {
            let mut flags = self.lock_flags();
            match id {
                MessageId::Choke => flags.we_choking = true,
                MessageId::Unchoke => flags.we_choking = false,
                MessageId::Interested => flags.we_interested = true,
                MessageId::NotInterested => flags.we_interested = false,
                _ => (),
            }
        }

        let mut meters = self.lock_meters();
        if id == MessageId::Piece {
            // Application bytes delivered: the block itself, not the
            // index/begin header.
            meters.uploaded_sample += payload_len.saturating_sub(8) as u64;
        }
        meters.last_write = Instant::now();
    }

    fn apply_incoming(&self, msg: &Message) {
        if msg.id == MessageId::KeepAlive {
            return;
        }

        self.lock_meters().downloaded_sample += msg.payload.len() as u64;

        match msg.id {
            MessageId::Choke => self.lock_flags().peer_choking = true,
            MessageId::Unchoke => self.lock_flags().peer_choking = false,
            MessageId::Interested => self.lock_flags().peer_interested = true,
            MessageId::NotInterested => self.lock_flags().peer_interested = false,
            MessageId::Bitfield => {
                self.lock_availability().bitfield = Some(Bitfield::new(msg.payload.clone()));
            }
            MessageId::Have => {
                if msg.payload.len() >= 4 {
                    let mut index = [0; 4];
                    index.copy_from_slice(&msg.payload[0..4]);
                    self.lock_availability()
                        .have
                        .insert(u32::from_be_bytes(index));
                }
            }
            _ => (),
        }
    }

    // Lock helpers: recover the guard if a holder panicked.

    fn lock_flags(&self) -> MutexGuard<Flags> {
        match self.flags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_availability(&self) -> MutexGuard<Availability> {
        match self.availability.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_meters(&self) -> MutexGuard<Meters> {
        match self.meters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
