//! Relay adapters: a classified request bundled with the connection it arrived on.

use std::{fmt, net::SocketAddr};
use tokio::io::BufReader;

use crate::request::HttpRequest;

/// Headers that describe the client-to-proxy hop and are never forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Proxy-Connection",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

/// How the relay layer should treat the connection after handoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayMode {
    /// CONNECT already answered; relay raw bytes both ways.
    Tunnel,
    /// Forward the request to its destination, then relay raw bytes.
    Plain,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tunnel => f.write_str("tunnel"),
            Self::Plain => f.write_str("plain"),
        }
    }
}

/// Where a handed-off connection comes from and should go to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub mode: RelayMode,
    pub source: SocketAddr,
    pub host: String,
    pub port: u16,
}

impl Metadata {
    /// `host:port`, bracketing IPv6 literals.
    pub fn remote_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// A request and its connection, owned by the relay layer after handoff.
///
/// The connection keeps its read buffer so bytes the client sent past the
/// request head are not lost.
pub struct RelayAdapter<S> {
    request: HttpRequest,
    conn: BufReader<S>,
    metadata: Metadata,
}

impl<S> RelayAdapter<S> {
    /// Adapter for an established CONNECT tunnel.
    pub fn tunnel(request: HttpRequest, conn: BufReader<S>, source: SocketAddr) -> Self {
        Self::new(request, conn, source, RelayMode::Tunnel)
    }

    /// Adapter for a plain (absolute-URI) proxy request.
    pub fn plain(request: HttpRequest, conn: BufReader<S>, source: SocketAddr) -> Self {
        Self::new(request, conn, source, RelayMode::Plain)
    }

    fn new(request: HttpRequest, conn: BufReader<S>, source: SocketAddr, mode: RelayMode) -> Self {
        let metadata = Metadata {
            mode,
            source,
            host: request.host().to_string(),
            port: request.port(),
        };
        Self {
            request,
            conn,
            metadata,
        }
    }

    pub fn mode(&self) -> RelayMode {
        self.metadata.mode
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// The request head to send upstream: origin-form target, hop-by-hop
    /// headers stripped, `Host` added when the client left it out.
    pub fn forward_head(&self) -> Vec<u8> {
        let authority = if self.request.port() == 80 {
            self.metadata.host.clone()
        } else {
            self.metadata.remote_address()
        };
        let missing_host = self.request.header("Host").is_none();

        let headers = self
            .request
            .headers()
            .iter()
            .filter(|(name, _)| {
                !HOP_BY_HOP_HEADERS
                    .iter()
                    .any(|hop| hop.eq_ignore_ascii_case(name))
            })
            .map(|(name, value)| (name.as_str(), value.as_str()));

        let host = missing_host.then_some(("Host", authority.as_str()));
        self.request
            .encode_head(self.request.origin_form(), host.into_iter().chain(headers))
    }

    pub fn into_parts(self) -> (HttpRequest, BufReader<S>, Metadata) {
        (self.request, self.conn, self.metadata)
    }
}

impl<S> fmt::Debug for RelayAdapter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayAdapter")
            .field("request", &self.request)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::read_request;

    async fn adapter(raw: &[u8]) -> RelayAdapter<&[u8]> {
        let mut conn = BufReader::new(raw);
        let request = read_request(&mut conn).await.unwrap();
        let source = "127.0.0.1:50000".parse().unwrap();
        if request.is_connect() {
            RelayAdapter::tunnel(request, conn, source)
        } else {
            RelayAdapter::plain(request, conn, source)
        }
    }

    #[tokio::test]
    async fn metadata_follows_request() {
        let adapter = adapter(b"CONNECT [2001:db8::1]:443 HTTP/1.1\r\n\r\n").await;

        assert_eq!(adapter.mode(), RelayMode::Tunnel);
        assert_eq!(adapter.metadata().remote_address(), "[2001:db8::1]:443");
        assert_eq!(adapter.metadata().source.port(), 50000);
    }

    #[tokio::test]
    async fn forward_head_strips_proxy_headers() {
        let adapter = adapter(
            b"GET http://example.com/p?q=1 HTTP/1.1\r\n\
              Host: example.com\r\n\
              Proxy-Connection: keep-alive\r\n\
              Proxy-Authorization: Basic dTpw\r\n\
              Accept: */*\r\n\r\n",
        )
        .await;

        assert_eq!(adapter.mode(), RelayMode::Plain);
        assert_eq!(
            String::from_utf8(adapter.forward_head()).unwrap(),
            "GET /p?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn forward_head_adds_missing_host() {
        let adapter = adapter(b"GET http://example.com:8080/ HTTP/1.0\r\n\r\n").await;

        assert_eq!(
            String::from_utf8(adapter.forward_head()).unwrap(),
            "GET / HTTP/1.0\r\nHost: example.com:8080\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn keeps_buffered_bytes_with_connection() {
        use tokio::io::AsyncReadExt;

        let adapter = adapter(b"CONNECT example.com:443 HTTP/1.1\r\n\r\nclient-hello").await;
        let (_, mut conn, _) = adapter.into_parts();

        let mut early = Vec::new();
        conn.read_to_end(&mut early).await.unwrap();
        assert_eq!(early, b"client-hello");
    }
}
