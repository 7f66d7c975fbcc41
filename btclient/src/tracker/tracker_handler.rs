use crate::{torrent_parser::torrent::Torrent, PeerId};

use super::http::http_handler::{HttpHandler, HttpHandlerError};
use super::http::query_params::QueryParams;
use super::http::url_parser::{ConnectionProtocol, TrackerUrl, TrackerUrlError};
use super::tracker_response::{FromTrackerResponseError, TrackerResponse};
use super::udp_tracker::{UdpTracker, UdpTrackerError};

/// `TrackerHandler` struct for announcing to the torrent's tracker over
/// whatever scheme its announce URL names.
///
/// To create a new `TrackerHandler` use the method builder `new()`.
///
/// To get the tracker's peer list use the method `get_peers_list()`.
#[derive(Debug)]
pub struct TrackerHandler {
    torrent: Torrent,
    tracker_url: TrackerUrl,
    client_port: u16,
    client_peer_id: PeerId,
}

/// Posible `TrackerHandler` errors.
#[derive(Debug)]
pub enum TrackerHandlerError {
    HttpHandlerError(HttpHandlerError),
    UdpTrackerError(UdpTrackerError),
    FromTrackerResponseError(FromTrackerResponseError),
    UrlParseError(TrackerUrlError),
}

impl TrackerHandler {
    /// Builds a new `TrackerHandler` from a **Torrent**, the port we
    /// announce, and our peer id.
    ///
    /// It returns a `TrackerHandlerError` if the torrent's announce URL
    /// does not parse.
    pub fn new(
        torrent: Torrent,
        client_port: u16,
        client_peer_id: PeerId,
    ) -> Result<Self, TrackerHandlerError> {
        let tracker_url = TrackerUrl::parse(torrent.announce_url.as_str())
            .map_err(TrackerHandlerError::UrlParseError)?;

        Ok(Self {
            torrent,
            tracker_url,
            client_port,
            client_peer_id,
        })
    }

    /// Announces once and returns the tracker's peer list.
    ///
    /// It returns a `TrackerHandlerError` if:
    /// - The request could not be sent or the response not read.
    /// - The response did not decode into a peer list.
    pub async fn get_peers_list(&self) -> Result<TrackerResponse, TrackerHandlerError> {
        let left = self.torrent.total_length();

        if self.tracker_url.protocol == ConnectionProtocol::Udp {
            let udp_tracker = UdpTracker::new(
                self.tracker_url.host.clone(),
                self.tracker_url.port,
                self.torrent.info_hash,
                self.client_peer_id,
                self.client_port,
                left,
            );
            return udp_tracker
                .announce()
                .await
                .map_err(TrackerHandlerError::UdpTrackerError);
        }

        let query_params = QueryParams::new(
            self.torrent.info_hash,
            self.client_peer_id,
            self.client_port,
            left,
        );
        let http_handler = HttpHandler::new(self.tracker_url.clone(), query_params);

        let response = if self.tracker_url.protocol == ConnectionProtocol::Https {
            http_handler
                .https_request()
                .await
                .map_err(TrackerHandlerError::HttpHandlerError)?
        } else {
            http_handler
                .http_request()
                .await
                .map_err(TrackerHandlerError::HttpHandlerError)?
        };

        TrackerResponse::from(response).map_err(TrackerHandlerError::FromTrackerResponseError)
    }
}
