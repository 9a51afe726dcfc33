//! Listening socket and accept loop.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::JoinHandle,
    time,
};
use tracing::{debug, info};

use crate::{
    auth::{CACHE_SWEEP_INTERVAL, DecisionCache},
    error::{Error, Result},
    handler::{ProxyContext, handle_connection},
    relay::Dispatcher,
};

/// Pause before retrying after a failed accept, so a persistent error such as
/// fd exhaustion does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A bound HTTP proxy socket with its accept loop running in the background.
///
/// Every connection is handled on its own task. Dropping the handle does not
/// stop the loop; call [`Listener::close`] or [`Listener::shutdown`].
pub struct Listener {
    address: String,
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    cache: DecisionCache,
    task: JoinHandle<()>,
}

/// Source of inbound connections for the accept loop.
trait Accept: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

struct AcceptLoop<A> {
    acceptor: A,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    context: Arc<ProxyContext>,
    cache: DecisionCache,
    dispatcher: Arc<dyn Dispatcher<TcpStream>>,
}

impl Listener {
    /// Binds `addr` and starts accepting connections.
    pub async fn open(
        addr: &str,
        context: ProxyContext,
        dispatcher: Arc<dyn Dispatcher<TcpStream>>,
    ) -> Result<Self> {
        let bind_error = |source| Error::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(
            listen_addr = %local_addr,
            auth = context.authenticator().is_some(),
            "HTTP proxy listening"
        );

        Ok(Self::start(listener, local_addr, context, dispatcher))
    }

    fn start<A: Accept>(
        acceptor: A,
        local_addr: SocketAddr,
        context: ProxyContext,
        dispatcher: Arc<dyn Dispatcher<TcpStream>>,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());
        let cache = DecisionCache::with_janitor(CACHE_SWEEP_INTERVAL);

        let task = tokio::spawn(
            AcceptLoop {
                acceptor,
                closed: Arc::clone(&closed),
                shutdown: Arc::clone(&shutdown),
                context: Arc::new(context),
                cache: cache.clone(),
                dispatcher,
            }
            .run(),
        );

        Self {
            address: local_addr.to_string(),
            local_addr,
            closed,
            shutdown,
            cache,
            task,
        }
    }

    /// The address the socket is bound to, with any ephemeral port resolved.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Decision cache shared by every connection of this listener.
    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting. The socket is released once the accept loop observes
    /// the close; connections already accepted keep running.
    pub fn close(&self) {
        // The flag goes first so the woken loop never mistakes shutdown for a fault.
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    /// Closes the listener and waits for the accept loop to exit.
    pub async fn shutdown(self) {
        self.close();
        if let Err(e) = self.task.await {
            debug!(error = %e, "Accept loop ended abnormally");
        }
    }
}

impl<A: Accept> AcceptLoop<A> {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.shutdown.notified() => break,
                accepted = self.acceptor.accept() => accepted,
            };

            if self.closed.load(Ordering::Acquire) {
                break;
            }

            match accepted {
                Ok((stream, peer_addr)) => self.spawn_handler(stream, peer_addr),
                Err(e) => {
                    debug!(error = %e, "Failed to accept connection, retrying");
                    time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }

        debug!("Accept loop stopped");
    }

    fn spawn_handler(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if !self.context.is_client_allowed(peer_addr.ip()) {
            info!(client_addr = %peer_addr, "Rejected connection from disallowed client");
            return;
        }

        let context = Arc::clone(&self.context);
        let cache = self.cache.clone();
        let dispatcher = Arc::clone(&self.dispatcher);

        tokio::spawn(async move {
            let disposition =
                handle_connection(stream, peer_addr, &context, &cache, dispatcher.as_ref()).await;
            debug!(client_addr = %peer_addr, ?disposition, "Connection handler finished");
        });
    }
}
