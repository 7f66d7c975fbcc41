use std::io::Error as IOError;
use std::time::Duration;

use rand::Rng;
use tokio::{net::UdpSocket, time::timeout};

use crate::{PeerId, Sha1Hash};

use super::tracker_response::{compact_to_peers, TrackerResponse};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const EVENT_STARTED: u32 = 2;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// `UdpTracker` performs the two packet connect/announce exchange of the
/// UDP tracker protocol and returns the compact peer list.
#[derive(Debug)]
pub struct UdpTracker {
    host: String,
    port: u16,
    info_hash: Sha1Hash,
    client_peer_id: PeerId,
    client_port: u16,
    left: u64,
}

/// Posible `UdpTracker` errors.
#[derive(Debug)]
pub enum UdpTrackerError {
    BindError(IOError),
    ConnectError(IOError),
    SendError(IOError),
    RecvError(IOError),
    ResponseTimeout,
    InvalidConnectResponse,
    InvalidAnnounceResponse,
}

impl UdpTracker {
    pub fn new(
        host: String,
        port: u16,
        info_hash: Sha1Hash,
        client_peer_id: PeerId,
        client_port: u16,
        left: u64,
    ) -> Self {
        Self {
            host,
            port,
            info_hash,
            client_peer_id,
            client_port,
            left,
        }
    }

    /// Runs the connect round trip and then the announce round trip.
    ///
    /// It returns a `UdpTrackerError` if:
    /// - The socket could not be bound or connected.
    /// - Either exchange times out (5 s).
    /// - A response is short, echoes the wrong transaction id, or carries
    ///   the wrong action.
    pub async fn announce(&self) -> Result<TrackerResponse, UdpTrackerError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(UdpTrackerError::BindError)?;
        socket
            .connect((self.host.as_str(), self.port))
            .await
            .map_err(UdpTrackerError::ConnectError)?;

        let connection_id = self.connect_exchange(&socket).await?;
        self.announce_exchange(&socket, connection_id).await
    }

    async fn connect_exchange(&self, socket: &UdpSocket) -> Result<u64, UdpTrackerError> {
        let transaction_id: u32 = rand::thread_rng().gen();

        let mut request = Vec::with_capacity(16);
        request.extend(PROTOCOL_ID.to_be_bytes());
        request.extend(ACTION_CONNECT.to_be_bytes());
        request.extend(transaction_id.to_be_bytes());

        let response = Self::exchange(socket, &request).await?;
        if response.len() < 16 {
            return Err(UdpTrackerError::InvalidConnectResponse);
        }

        let action = read_u32(&response[0..4]);
        let echoed = read_u32(&response[4..8]);
        if action != ACTION_CONNECT || echoed != transaction_id {
            return Err(UdpTrackerError::InvalidConnectResponse);
        }

        let mut connection_id = [0; 8];
        connection_id.copy_from_slice(&response[8..16]);
        Ok(u64::from_be_bytes(connection_id))
    }

    async fn announce_exchange(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
    ) -> Result<TrackerResponse, UdpTrackerError> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let key: u32 = rand::thread_rng().gen();

        let mut request = Vec::with_capacity(98);
        request.extend(connection_id.to_be_bytes());
        request.extend(ACTION_ANNOUNCE.to_be_bytes());
        request.extend(transaction_id.to_be_bytes());
        request.extend(self.info_hash);
        request.extend(self.client_peer_id);
        request.extend(0u64.to_be_bytes()); // downloaded
        request.extend(self.left.to_be_bytes());
        request.extend(0u64.to_be_bytes()); // uploaded
        request.extend(EVENT_STARTED.to_be_bytes());
        request.extend(0u32.to_be_bytes()); // ip: let the tracker derive it
        request.extend(key.to_be_bytes());
        request.extend((-1i32).to_be_bytes()); // num_want
        request.extend(self.client_port.to_be_bytes());

        let response = Self::exchange(socket, &request).await?;
        if response.len() < 20 {
            return Err(UdpTrackerError::InvalidAnnounceResponse);
        }

        let action = read_u32(&response[0..4]);
        let echoed = read_u32(&response[4..8]);
        if action != ACTION_ANNOUNCE || echoed != transaction_id {
            return Err(UdpTrackerError::InvalidAnnounceResponse);
        }

        let interval = read_u32(&response[8..12]);
        let leechers = read_u32(&response[12..16]);
        let seeders = read_u32(&response[16..20]);

        Ok(TrackerResponse {
            interval: i64::from(interval),
            complete: i64::from(seeders),
            incomplete: i64::from(leechers),
            peers: compact_to_peers(&response[20..]),
        })
    }

    async fn exchange(socket: &UdpSocket, request: &[u8]) -> Result<Vec<u8>, UdpTrackerError> {
        socket
            .send(request)
            .await
            .map_err(UdpTrackerError::SendError)?;

        let mut buffer = vec![0; 2048];
        let received = timeout(RESPONSE_TIMEOUT, socket.recv(&mut buffer))
            .await
            .map_err(|_| UdpTrackerError::ResponseTimeout)?
            .map_err(UdpTrackerError::RecvError)?;
        buffer.truncate(received);
        Ok(buffer)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buffer = [0; 4];
    buffer.copy_from_slice(bytes);
    u32::from_be_bytes(buffer)
}
