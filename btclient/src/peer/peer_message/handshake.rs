use crate::{PeerId, Sha1Hash};

#[derive(Debug, PartialEq, Eq)]
pub enum FromHandshakeError {
    InvalidHandshake,
}

/// Represents a handshake message.
/// Is the first message sent to start a connection with a peer.
#[derive(Debug, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

const PSTR: &[u8] = b"BitTorrent protocol";

/// Total size of a handshake on the wire: pstrlen + pstr + reserved +
/// info_hash + peer_id.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

impl Handshake {
    /// Creates a new `Handshake` message with zeroed reserved bytes.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Converts a `Handshake` message to its fixed 68-byte wire form.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HANDSHAKE_LEN);
        bytes.push(PSTR.len() as u8);
        bytes.extend(PSTR);
        bytes.extend(&self.reserved);
        bytes.extend(&self.info_hash);
        bytes.extend(&self.peer_id);
        bytes
    }

    /// Parses a byte array into a `Handshake` message.
    ///
    /// It returns an error if the input is not exactly 68 bytes or the
    /// protocol string is not "BitTorrent protocol".
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FromHandshakeError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(FromHandshakeError::InvalidHandshake);
        }

        let pstrlen = bytes[0] as usize;
        if pstrlen != PSTR.len() || &bytes[1..1 + pstrlen] != PSTR {
            return Err(FromHandshakeError::InvalidHandshake);
        }

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}
