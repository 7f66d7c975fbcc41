/// `TrackerUrl` struct containing a tracker url information.
///
/// To create a new `TrackerUrl` use the method builder `parse()`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TrackerUrl {
    pub protocol: ConnectionProtocol,
    pub host: String,
    pub port: u16,
    pub endpoint: String,
}

/// Posible `TrackerUrl` Connection Protocol values.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ConnectionProtocol {
    Http,
    Https,
    Udp,
}

/// Posible `TrackerUrl` Errors.
#[derive(Debug, PartialEq, Eq)]
pub enum TrackerUrlError {
    InvalidTrackerURL,
    UnsupportedConnectionProtocol,
    InvalidPortNumber,
}

impl TrackerUrl {
    /// Builds a new `TrackerUrl` from a &str tracker url.
    ///
    /// Supported schemes are `http`, `https` and `udp`. The path is
    /// optional (UDP announce URLs often have none); the port defaults to
    /// the scheme's usual one.
    ///
    /// It returns a `TrackerUrlError` if:
    /// - The url format is invalid.
    /// - The url connection protocol is unsupported.
    /// - The url port number is not a number.
    pub fn parse(url: &str) -> Result<Self, TrackerUrlError> {
        let (url_without_protocol, protocol) = Self::identify_and_remove_protocol(url)?;

        let (authority, endpoint) = match url_without_protocol.split_once('/') {
            Some((authority, endpoint)) => (authority.to_string(), endpoint.to_string()),
            None => (url_without_protocol, String::new()),
        };
        if authority.is_empty() {
            return Err(TrackerUrlError::InvalidTrackerURL);
        }

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse()
                    .map_err(|_| TrackerUrlError::InvalidPortNumber)?,
            ),
            None => (
                authority,
                match protocol {
                    ConnectionProtocol::Https => 443,
                    ConnectionProtocol::Http => 80,
                    ConnectionProtocol::Udp => 80,
                },
            ),
        };

        Ok(Self {
            protocol,
            host,
            port,
            endpoint,
        })
    }

    fn identify_and_remove_protocol(
        url: &str,
    ) -> Result<(String, ConnectionProtocol), TrackerUrlError> {
        let (protocol_name, rest) = match url.split_once("://") {
            Some(parts) => parts,
            None => return Err(TrackerUrlError::InvalidTrackerURL),
        };

        let protocol = match protocol_name {
            "http" => ConnectionProtocol::Http,
            "https" => ConnectionProtocol::Https,
            "udp" => ConnectionProtocol::Udp,
            _ => return Err(TrackerUrlError::UnsupportedConnectionProtocol),
        };

        Ok((rest.to_string(), protocol))
    }
}
