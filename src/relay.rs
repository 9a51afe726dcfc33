//! Relay dispatch: where connections go once the ingress is done with them.

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

use crate::adapter::{RelayAdapter, RelayMode};

pub const BUFFER_SIZE: usize = 8192;

/// Takes ownership of classified connections.
pub trait Dispatcher<S>: Send + Sync {
    fn dispatch(&self, adapter: RelayAdapter<S>);
}

/// Queues adapters for a consumer running elsewhere.
pub struct ChannelDispatcher<S> {
    tx: mpsc::UnboundedSender<RelayAdapter<S>>,
}

impl<S> ChannelDispatcher<S> {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayAdapter<S>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<S: Send> Dispatcher<S> for ChannelDispatcher<S> {
    fn dispatch(&self, adapter: RelayAdapter<S>) {
        if let Err(e) = self.tx.send(adapter) {
            let metadata = e.0.metadata();
            warn!(
                client_addr = %metadata.source,
                target_addr = %metadata.remote_address(),
                "Relay queue closed, dropping connection"
            );
        }
    }
}

/// Connects straight to each destination and relays bytes on a spawned task.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectRelay;

impl<S> Dispatcher<S> for DirectRelay
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn dispatch(&self, adapter: RelayAdapter<S>) {
        tokio::spawn(async move {
            let client_addr = adapter.metadata().source;
            if let Err(e) = relay(adapter).await {
                error!(client_addr = %client_addr, error = %e, "Relay failed");
            }
        });
    }
}

#[tracing::instrument(skip(adapter), fields(
    client_addr = %adapter.metadata().source,
    target_addr = %adapter.metadata().remote_address(),
    mode = %adapter.mode(),
))]
pub async fn relay<S>(adapter: RelayAdapter<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target_addr = adapter.metadata().remote_address();

    debug!(target_addr = %target_addr, "Attempting to connect to target server");
    let mut target = TcpStream::connect(&target_addr)
        .await
        .with_context(|| format!("Failed to connect to target {target_addr}"))?;
    info!(target_addr = %target_addr, "Connected to target server");

    if adapter.mode() == RelayMode::Plain {
        target
            .write_all(&adapter.forward_head())
            .await
            .context("Failed to forward request head to target")?;
    }

    let (_, conn, _) = adapter.into_parts();
    let (mut client_reader, mut client_writer) = tokio::io::split(conn);
    let (mut target_reader, mut target_writer) = target.into_split();

    let client_to_target = pump(&mut client_reader, &mut target_writer, "client", "target");
    let target_to_client = pump(&mut target_reader, &mut client_writer, "target", "client");

    let (sent, received) = tokio::try_join!(client_to_target, target_to_client)?;

    info!(sent, received, "Proxy connection closed");
    Ok(())
}

/// Copies `reader` into `writer` until EOF, then shuts `writer` down so the
/// other side sees the half-close.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    from: &'static str,
    to: &'static str,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!(from, "Connection closed");
                let _ = writer.shutdown().await;
                return Ok(total);
            }
            Ok(n) => {
                debug!(bytes = n, from, to, "Forwarding data");
                writer
                    .write_all(&buffer[..n])
                    .await
                    .with_context(|| format!("Failed to write {from} data to {to}"))?;
                total += n as u64;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read from {from}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::read_request;
    use std::net::SocketAddr;
    use tokio::{
        io::{BufReader, DuplexStream, duplex},
        net::TcpListener,
        sync::oneshot,
        time::{Duration, timeout},
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(1);

    /// Starts TCP echo server on free port, returns port number
    async fn start_echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buffer = [0; 4096];
                    loop {
                        match stream.read(&mut buffer).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) if stream.write_all(&buffer[..n]).await.is_err() => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });

        port
    }

    /// Starts an origin server that captures the first request head and answers it.
    async fn start_origin_server(response: &'static [u8]) -> (u16, oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut head = Vec::new();
                let mut buffer = [0u8; 1024];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buffer[..n]),
                    }
                }
                let _ = tx.send(head);
                let _ = stream.write_all(response).await;
            }
        });

        (port, rx)
    }

    fn source() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    /// Parses `head` off an in-memory pipe and returns the client end plus the adapter.
    async fn adapter_for(head: String) -> (DuplexStream, RelayAdapter<DuplexStream>) {
        let (mut client, server) = duplex(4096);
        client.write_all(head.as_bytes()).await.unwrap();

        let mut conn = BufReader::new(server);
        let request = read_request(&mut conn).await.unwrap();
        let adapter = if request.is_connect() {
            RelayAdapter::tunnel(request, conn, source())
        } else {
            RelayAdapter::plain(request, conn, source())
        };
        (client, adapter)
    }

    #[tokio::test]
    async fn tunnel_relays_both_directions() {
        let port = start_echo_server().await;
        let (mut client, adapter) =
            adapter_for(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\nearly ")).await;

        DirectRelay.dispatch(adapter);

        client.write_all(b"data").await.unwrap();
        let mut echoed = [0u8; 10];
        timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"early data");
    }

    #[tokio::test]
    async fn plain_forwards_rewritten_head() {
        let response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let (port, head_rx) = start_origin_server(response).await;
        let (mut client, adapter) = adapter_for(format!(
            "GET http://127.0.0.1:{port}/path HTTP/1.1\r\n\
             Host: 127.0.0.1:{port}\r\n\
             Proxy-Connection: keep-alive\r\n\r\n"
        ))
        .await;

        let relay_task = tokio::spawn(relay(adapter));

        let head = timeout(TEST_TIMEOUT, head_rx).await.unwrap().unwrap();
        assert_eq!(
            String::from_utf8(head).unwrap(),
            format!("GET /path HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n")
        );

        let mut received = vec![0u8; response.len()];
        timeout(TEST_TIMEOUT, client.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, response);

        drop(client);
        timeout(TEST_TIMEOUT, relay_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_target_is_an_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (_client, adapter) =
            adapter_for(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n")).await;

        let err = relay(adapter).await.unwrap_err();
        assert!(err.to_string().contains("Failed to connect to target"));
    }

    #[tokio::test]
    async fn closed_queue_drops_adapter() {
        let (dispatcher, rx) = ChannelDispatcher::new();
        drop(rx);

        let (_client, adapter) = adapter_for("CONNECT example.com:443 HTTP/1.1\r\n\r\n".into()).await;
        dispatcher.dispatch(adapter);
    }
}
