//! Per-connection protocol state machine.
//!
//! A connection moves through `ReadRequest -> AuthGate -> Dispatch`. A failed
//! authentication loops back to `ReadRequest` when the client asked for
//! `Proxy-Connection: keep-alive`; otherwise the connection is closed. Once a
//! request is dispatched the connection belongs to the relay layer and is never
//! read here again.

use ipnet::IpNet;
use std::{net::IpAddr, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    time,
};
use tracing::{debug, info};

use crate::{
    adapter::{RelayAdapter, RelayMode},
    auth::{self, Authenticator, DecisionCache},
    error::{Error, Result},
    relay::Dispatcher,
    request::{HttpRequest, read_request},
    security::is_client_ip_allowed,
};

pub const PROXY_AUTH_REQUIRED: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n";
pub const FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Settings shared by every connection a listener accepts.
#[derive(Clone, Default)]
pub struct ProxyContext {
    authenticator: Option<Arc<dyn Authenticator>>,
    request_timeout: Option<Duration>,
    allowed_clients: Option<Vec<IpNet>>,
}

impl ProxyContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires proxy authentication against `authenticator`.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Bounds every request-head read. Unset, a silent client holds its
    /// connection indefinitely.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Only accepts clients whose address falls in one of `networks`.
    #[must_use]
    pub fn with_allowed_clients(mut self, networks: Vec<IpNet>) -> Self {
        self.allowed_clients = Some(networks);
        self
    }

    pub fn authenticator(&self) -> Option<&dyn Authenticator> {
        self.authenticator.as_deref()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn is_client_allowed(&self, ip: IpAddr) -> bool {
        is_client_ip_allowed(ip, self.allowed_clients.as_deref())
    }
}

/// What became of a connection when its handler returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    HandedOff(RelayMode),
    Closed(CloseReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Unparsable head, missing destination host, EOF or read timeout.
    MalformedRequest,
    /// `Proxy-Authorization` absent or not `<scheme> <token>`; answered 407.
    AuthRequired,
    /// Credentials rejected; answered 403.
    Forbidden,
    /// The CONNECT acknowledgement could not be written.
    WriteFailed,
}

enum State {
    ReadRequest,
    AuthGate(HttpRequest),
    Dispatch(HttpRequest),
}

enum AuthOutcome {
    Granted,
    Challenged,
    Denied,
}

/// Drives one accepted connection until it is handed to `dispatcher` or closed.
#[tracing::instrument(skip_all, fields(client_addr = %peer_addr))]
pub async fn handle_connection<S>(
    stream: S,
    peer_addr: SocketAddr,
    context: &ProxyContext,
    cache: &DecisionCache,
    dispatcher: &dyn Dispatcher<S>,
) -> Disposition
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut conn = BufReader::new(stream);
    let mut state = State::ReadRequest;

    loop {
        state = match state {
            State::ReadRequest => match next_request(&mut conn, context.request_timeout).await {
                Ok(request) if !request.host().is_empty() => State::AuthGate(request),
                Ok(request) => {
                    debug!(request_target = request.target(), "Request has no destination host");
                    return close(conn, CloseReason::MalformedRequest).await;
                }
                Err(e) => {
                    debug!(error = %e, "Failed to read request");
                    return close(conn, CloseReason::MalformedRequest).await;
                }
            },
            State::AuthGate(request) => {
                let Some(authenticator) = context.authenticator() else {
                    state = State::Dispatch(request);
                    continue;
                };
                let keep_alive = request.wants_keep_alive();

                let reason = match authorize(&request, authenticator, cache) {
                    AuthOutcome::Granted => {
                        state = State::Dispatch(request);
                        continue;
                    }
                    AuthOutcome::Challenged => {
                        respond(&mut conn, PROXY_AUTH_REQUIRED).await;
                        CloseReason::AuthRequired
                    }
                    AuthOutcome::Denied => {
                        respond(&mut conn, FORBIDDEN).await;
                        info!(client_addr = %peer_addr, "Auth failed");
                        CloseReason::Forbidden
                    }
                };

                if !keep_alive {
                    return close(conn, reason).await;
                }
                State::ReadRequest
            }
            State::Dispatch(request) => return dispatch(request, conn, peer_addr, dispatcher).await,
        };
    }
}

async fn next_request<S>(conn: &mut BufReader<S>, timeout: Option<Duration>) -> Result<HttpRequest>
where
    S: AsyncRead + Unpin,
{
    match timeout {
        Some(limit) => time::timeout(limit, read_request(conn))
            .await
            .map_err(|_| Error::RequestTimeout(limit))?,
        None => read_request(conn).await,
    }
}

fn authorize(
    request: &HttpRequest,
    authenticator: &dyn Authenticator,
    cache: &DecisionCache,
) -> AuthOutcome {
    let header = request.header("Proxy-Authorization").unwrap_or_default();
    let tokens: Vec<&str> = header.split(' ').collect();
    let [_scheme, credential] = tokens.as_slice() else {
        return AuthOutcome::Challenged;
    };

    if auth::evaluate(credential, authenticator, cache) {
        AuthOutcome::Granted
    } else {
        AuthOutcome::Denied
    }
}

async fn dispatch<S>(
    request: HttpRequest,
    mut conn: BufReader<S>,
    peer_addr: SocketAddr,
    dispatcher: &dyn Dispatcher<S>,
) -> Disposition
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let adapter = if request.is_connect() {
        if let Err(e) = write_response(&mut conn, CONNECTION_ESTABLISHED).await {
            debug!(error = %e, "Failed to acknowledge CONNECT");
            return close(conn, CloseReason::WriteFailed).await;
        }
        RelayAdapter::tunnel(request, conn, peer_addr)
    } else {
        RelayAdapter::plain(request, conn, peer_addr)
    };

    let mode = adapter.mode();
    debug!(
        mode = %mode,
        target_addr = %adapter.metadata().remote_address(),
        "Handing connection to relay"
    );
    dispatcher.dispatch(adapter);
    Disposition::HandedOff(mode)
}

async fn write_response<S>(conn: &mut BufReader<S>, response: &[u8]) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_all(response).await?;
    conn.flush().await
}

/// Best-effort response; a failed write surfaces on the next read instead.
async fn respond<S>(conn: &mut BufReader<S>, response: &[u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = write_response(conn, response).await {
        debug!(error = %e, "Failed to write response");
    }
}

async fn close<S>(mut conn: BufReader<S>, reason: CloseReason) -> Disposition
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = conn.shutdown().await;
    Disposition::Closed(reason)
}
