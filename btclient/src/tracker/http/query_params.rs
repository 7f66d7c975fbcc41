use url_encoder::url_encoder::encode;

use crate::{PeerId, Sha1Hash};

/// `QueryParams` struct containing the announce query parameters.
///
/// To build the query string use the method `build()`.
#[derive(Debug)]
pub struct QueryParams {
    info_hash: Sha1Hash,
    client_peer_id: PeerId,
    client_port: u16,
    left: u64,
}

impl QueryParams {
    /// Creates a new `QueryParams` from the torrent identity, our peer id,
    /// the port we announce, and how many bytes are left to download.
    pub fn new(info_hash: Sha1Hash, client_peer_id: PeerId, client_port: u16, left: u64) -> Self {
        Self {
            info_hash,
            client_peer_id,
            client_port,
            left,
        }
    }

    /// Builds the query string, percent-encoding the binary fields.
    pub fn build(&self) -> String {
        format!(
            "?info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
            encode(&self.info_hash),
            encode(&self.client_peer_id),
            self.client_port,
            self.left
        )
    }
}
