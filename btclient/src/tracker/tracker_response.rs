use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bencoder::bencode::{Bencode, BencodeError};

/// `TrackerResponse` struct containing a tracker response.
///
/// To create a new `TrackerResponse` use the method builder `from()`.
#[derive(Debug, PartialEq, Eq)]
pub struct TrackerResponse {
    pub interval: i64,
    pub complete: i64,
    pub incomplete: i64,
    pub peers: Vec<SocketAddr>,
}

/// Posible `TrackerResponse` errors.
#[derive(Debug, PartialEq, Eq)]
pub enum FromTrackerResponseError {
    DecodeResponseError(BencodeError),
    TrackerFailure(String),
    InvalidInterval,
    InvalidComplete,
    InvalidIncomplete,
    InvalidPeers,
    NotADict,
}

/// Decodes the compact peer format: six bytes per peer, four byte IPv4
/// big-endian followed by a two byte big-endian port. Trailing bytes that
/// do not make a whole peer are ignored.
pub fn compact_to_peers(blob: &[u8]) -> Vec<SocketAddr> {
    blob.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

impl TrackerResponse {
    /// Builds a new `TrackerResponse` decoding a bencoded response body.
    ///
    /// Accepts the peer list in both the dictionary form and the compact
    /// string form.
    ///
    /// It returns a `FromTrackerResponseError` if:
    /// - The body is not valid bencode or not a dict.
    /// - The tracker reported a failure reason.
    /// - A field has the wrong type.
    pub fn from(response: Vec<u8>) -> Result<TrackerResponse, FromTrackerResponseError> {
        let mut interval = 0;
        let mut complete = 0;
        let mut incomplete = 0;
        let mut peers = Vec::new();

        let decoded = Bencode::decode(&response)
            .map_err(FromTrackerResponseError::DecodeResponseError)?;

        let d = match decoded {
            Bencode::BDict(d) => d,
            _ => return Err(FromTrackerResponseError::NotADict),
        };

        if let Some(Bencode::BString(reason)) = d.get(&b"failure reason"[..]) {
            return Err(FromTrackerResponseError::TrackerFailure(
                String::from_utf8_lossy(reason).to_string(),
            ));
        }

        for (k, v) in d.iter() {
            if k == b"interval" {
                interval = Self::create_number(v, FromTrackerResponseError::InvalidInterval)?;
            } else if k == b"complete" {
                complete = Self::create_number(v, FromTrackerResponseError::InvalidComplete)?;
            } else if k == b"incomplete" {
                incomplete = Self::create_number(v, FromTrackerResponseError::InvalidIncomplete)?;
            } else if k == b"peers" {
                peers = Self::create_peers(v)?;
            }
        }

        Ok(TrackerResponse {
            interval,
            complete,
            incomplete,
            peers,
        })
    }

    fn create_number(
        bencode: &Bencode,
        error: FromTrackerResponseError,
    ) -> Result<i64, FromTrackerResponseError> {
        match bencode {
            Bencode::BNumber(n) => Ok(*n),
            _ => Err(error),
        }
    }

    fn create_peers(bencode: &Bencode) -> Result<Vec<SocketAddr>, FromTrackerResponseError> {
        match bencode {
            Bencode::BList(list) => Self::create_peers_from_dicts(list),
            Bencode::BString(blob) => Ok(compact_to_peers(blob)),
            _ => Err(FromTrackerResponseError::InvalidPeers),
        }
    }

    fn create_peers_from_dicts(
        list: &[Bencode],
    ) -> Result<Vec<SocketAddr>, FromTrackerResponseError> {
        let mut peers = Vec::with_capacity(list.len());

        for entry in list {
            let d = match entry {
                Bencode::BDict(d) => d,
                _ => return Err(FromTrackerResponseError::InvalidPeers),
            };

            let ip = match d.get(&b"ip"[..]) {
                Some(Bencode::BString(raw)) => String::from_utf8(raw.clone())
                    .ok()
                    .and_then(|text| text.parse::<Ipv4Addr>().ok())
                    .ok_or(FromTrackerResponseError::InvalidPeers)?,
                _ => return Err(FromTrackerResponseError::InvalidPeers),
            };
            let port = match d.get(&b"port"[..]) {
                Some(Bencode::BNumber(port)) if (0..=i64::from(u16::MAX)).contains(port) => {
                    *port as u16
                }
                _ => return Err(FromTrackerResponseError::InvalidPeers),
            };

            peers.push(SocketAddr::new(IpAddr::V4(ip), port));
        }

        Ok(peers)
    }
}
