use std::io::Error as IOError;

use native_tls::TlsConnector;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use super::query_params::QueryParams;
use super::url_parser::TrackerUrl;

/// `HttpHandler` struct to make tracker announce requests over **HTTP** or
/// **HTTPS**.
///
/// To create a new `HttpHandler` use the method builder `new()`.
#[derive(Debug)]
pub struct HttpHandler {
    tracker_url: TrackerUrl,
    query_params: QueryParams,
}

/// Posible `HttpHandler` errors
#[derive(Debug)]
pub enum HttpHandlerError {
    CreateTlsConnectorError(native_tls::Error),
    TcpStreamConnectError(IOError),
    TlsStreamConnectError,
    ErrorWritingStream(IOError),
    ErrorReadingStream(IOError),
}

impl HttpHandler {
    /// Builds a new `HttpHandler` from a **TrackerUrl** and a
    /// **QueryParams** passed by parameters.
    pub fn new(tracker_url: TrackerUrl, query_params: QueryParams) -> Self {
        Self {
            tracker_url,
            query_params,
        }
    }

    /// Makes a **HTTPS** announce request to the tracker url.
    ///
    /// On success it returns a `Vec<u8>` containing the response body.
    ///
    /// It returns an `HttpHandlerError` if:
    /// - There was a problem creating a TlsConnector.
    /// - There was a problem connecting to the tracker.
    /// - There was a problem writing or reading the stream.
    pub async fn https_request(&self) -> Result<Vec<u8>, HttpHandlerError> {
        let connector =
            TlsConnector::new().map_err(HttpHandlerError::CreateTlsConnectorError)?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let stream = self.connect_tcp_stream().await?;
        let mut stream = connector
            .connect(self.tracker_url.host.as_str(), stream)
            .await
            .map_err(|_| HttpHandlerError::TlsStreamConnectError)?;

        self.request_and_decode(&mut stream).await
    }

    /// Makes a plain **HTTP** announce request to the tracker url.
    ///
    /// On success it returns a `Vec<u8>` containing the response body.
    ///
    /// It returns an `HttpHandlerError` if:
    /// - There was a problem connecting to the tracker.
    /// - There was a problem writing or reading the stream.
    pub async fn http_request(&self) -> Result<Vec<u8>, HttpHandlerError> {
        let mut stream = self.connect_tcp_stream().await?;
        self.request_and_decode(&mut stream).await
    }

    async fn connect_tcp_stream(&self) -> Result<TcpStream, HttpHandlerError> {
        TcpStream::connect((self.tracker_url.host.as_str(), self.tracker_url.port))
            .await
            .map_err(HttpHandlerError::TcpStreamConnectError)
    }

    async fn request_and_decode<A>(&self, stream: &mut A) -> Result<Vec<u8>, HttpHandlerError>
    where
        A: AsyncRead + AsyncWrite + Unpin,
    {
        let query_params = self.query_params.build();
        let mut request = format!(
            "GET /{}{} HTTP/1.1",
            self.tracker_url.endpoint, query_params
        );
        request.push_str("\r\n");
        request.push_str("Host: ");
        request.push_str(self.tracker_url.host.as_str());
        request.push_str("\r\n");
        request.push_str("User-Agent: btclient/0.1");
        request.push_str("\r\n");
        request.push_str("Connection: close");
        request.push_str("\r\n");
        request.push_str("\r\n");

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(HttpHandlerError::ErrorWritingStream)?;

        let mut response = vec![];
        stream
            .read_to_end(&mut response)
            .await
            .map_err(HttpHandlerError::ErrorReadingStream)?;

        Ok(Self::parse_http_response(&response).to_vec())
    }

    /// Strips the status line and headers, returning the body after the
    /// first blank line.
    fn parse_http_response(response: &[u8]) -> &[u8] {
        for i in 0..response.len().saturating_sub(3) {
            if &response[i..i + 4] == b"\r\n\r\n" {
                return &response[(i + 4)..];
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::http::url_parser;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_http_request_against_local_tracker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = b"d8:intervali1800e5:peers6:\x7F\x00\x00\x01\x1A\xE1e".to_vec();
        let body_clone = body.clone();

        let tracker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0; 1024];
            let n = socket.read(&mut request).await.unwrap();
            let request = String::from_utf8_lossy(&request[..n]).to_string();

            let mut response = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n".to_vec();
            response.extend(&body_clone);
            socket.write_all(&response).await.unwrap();
            request
        });

        let handler = HttpHandler::new(
            url_parser::TrackerUrl::parse(&format!("http://127.0.0.1:{}/announce", addr.port()))
                .unwrap(),
            QueryParams::new([1; 20], *b"-RB0001-aaaaaaaaaaaa", 6969, 100),
        );
        let response = handler.http_request().await.unwrap();
        let request = tracker.await.unwrap();

        assert_eq!(response, body);
        assert!(request.starts_with("GET /announce?info_hash="));
        assert!(request.contains("compact=1"));
    }

    #[test]
    fn test_parse_http_response_splits_body() {
        let response = b"HTTP/1.1 200 OK\r\nX: y\r\n\r\nd2:hi2:yoe";

        assert_eq!(HttpHandler::parse_http_response(response), b"d2:hi2:yoe");
    }

    #[test]
    fn test_parse_http_response_without_headers_returns_all() {
        let response = b"d2:hi2:yoe";

        assert_eq!(HttpHandler::parse_http_response(response), response);
    }
}
