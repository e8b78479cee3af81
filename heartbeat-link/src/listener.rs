//! The [`Listener`] contract and the TCP server that implements it.
//!
//! ```text
//!   StreamListener
//!     └── accept loop task ──accept──▶ StreamConnection ──▶ receive loop task
//!                          ──accept──▶ StreamConnection ──▶ receive loop task
//!                                                            (JoinSet registry)
//! ```
//!
//! Every accepted connection gets its own receive loop, so a fault on one
//! connection is logged and ends that loop only.  The accept loop itself stops
//! when the listener is disposed; any other accept error is fatal and disposes
//! the listener from inside the loop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::LinkConfig;
use crate::connection::{Connection, ReceiveHandler};
use crate::error::{LinkError, Result};
use crate::state::ListenerState;
use crate::stream::StreamConnection;

/// Something that accepts and/or drives connections and can be stopped.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Stop listening and release every resource.  Safe to call repeatedly.
    async fn dispose(&self) -> Result<()>;

    fn state(&self) -> ListenerState;

    fn local_addr(&self) -> SocketAddr;
}

/// Source of inbound TCP connections.  [`TcpListener`] is the only one
/// outside of tests.
#[async_trait]
pub(crate) trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accepts TCP connections and supervises one receive loop per connection.
///
/// Cloning yields another handle to the same listener.
#[derive(Clone)]
pub struct StreamListener {
    inner: Arc<Inner>,
}

struct Inner {
    local: SocketAddr,
    config: LinkConfig,
    handler: Arc<dyn ReceiveHandler>,
    disposed: AtomicBool,
    accepted: AtomicUsize,
    /// Parent of every receive loop's token.
    sessions_cancel: CancellationToken,
    accept_cancel: CancellationToken,
    sessions: Mutex<JoinSet<()>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    /// Held for the whole of `dispose()`; later callers wait on it.
    closing: Mutex<()>,
}

impl StreamListener {
    /// Start accepting on an already bound listener.
    ///
    /// Every accepted connection is built from a clone of `config` and
    /// delivers to `handler`.  Must be called from within a tokio runtime.
    pub fn new(
        listener: TcpListener,
        config: LinkConfig,
        handler: impl ReceiveHandler,
    ) -> Result<Self> {
        let local = listener.local_addr()?;
        Ok(Self::start(listener, local, config, Arc::new(handler)))
    }

    pub(crate) fn start<A: Acceptor>(
        acceptor: A,
        local: SocketAddr,
        config: LinkConfig,
        handler: Arc<dyn ReceiveHandler>,
    ) -> Self {
        let inner = Arc::new(Inner {
            local,
            config,
            handler,
            disposed: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
            sessions_cancel: CancellationToken::new(),
            accept_cancel: CancellationToken::new(),
            sessions: Mutex::new(JoinSet::new()),
            accept_task: StdMutex::new(None),
            closing: Mutex::new(()),
        });

        let task = tokio::spawn(guard_accept_loop(acceptor, inner.clone()));
        *inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        log::info!("[listener] listening on {local}");
        Self { inner }
    }

    /// Bind to `addr` and start accepting.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: LinkConfig,
        handler: impl ReceiveHandler,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::new(listener, config, handler)
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.inner.accepted.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Listener for StreamListener {
    /// Returns once every receive loop has ended and the acceptor is closed,
    /// also for callers that race an ongoing disposal.
    async fn dispose(&self) -> Result<()> {
        let _closing = self.inner.closing.lock().await;
        let first = self.inner.shutdown_sessions().await;

        self.inner.accept_cancel.cancel();
        let task = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                report_join_error("accept loop", e);
            }
        }
        if first {
            log::info!("[listener] {} disposed", self.inner.local);
        }
        Ok(())
    }

    fn state(&self) -> ListenerState {
        if self.inner.disposed.load(Ordering::Acquire) {
            ListenerState::Disposed
        } else {
            ListenerState::Listening
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }
}

impl std::fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamListener")
            .field("local", &self.inner.local)
            .field("accepted", &self.accepted())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    /// Cancel and join every receive loop.  Returns true for the first caller
    /// only; later callers still wait until the registry is drained.
    async fn shutdown_sessions(&self) -> bool {
        let first = !self.disposed.swap(true, Ordering::AcqRel);
        self.sessions_cancel.cancel();

        let mut sessions = self.sessions.lock().await;
        while let Some(done) = sessions.join_next().await {
            if let Err(e) = done {
                report_join_error("receive loop", e);
            }
        }
        first
    }

    async fn adopt(&self, stream: TcpStream, addr: SocketAddr) {
        let built =
            StreamConnection::with_shared_handler(stream, self.config.clone(), self.handler.clone());
        let conn = match built {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("[listener] dropping connection from {addr}: {e}");
                return;
            }
        };

        let mut sessions = self.sessions.lock().await;
        if self.sessions_cancel.is_cancelled() {
            // Disposal started while this connection was being accepted.
            drop(sessions);
            if let Err(e) = conn.dispose().await {
                log::debug!("[listener] dispose {addr}: {e}");
            }
            return;
        }
        while let Some(done) = sessions.try_join_next() {
            if let Err(e) = done {
                report_join_error("receive loop", e);
            }
        }
        self.accepted.fetch_add(1, Ordering::AcqRel);
        sessions.spawn(receive_loop(conn, self.sessions_cancel.child_token()));
        log::debug!("[listener] accepted {addr} ({} active)", sessions.len());
    }
}

/// Runs the accept loop on its own task so that even a panic inside it is
/// reported and the receive loops are shut down instead of lingering.
async fn guard_accept_loop<A: Acceptor>(acceptor: A, inner: Arc<Inner>) {
    let local = inner.local;
    let outcome = tokio::spawn(accept_loop(acceptor, inner.clone())).await;
    if let Err(e) = outcome {
        log::error!("[listener] accept loop on {local} died unexpectedly: {e}");
        inner.shutdown_sessions().await;
    }
}

async fn accept_loop<A: Acceptor>(acceptor: A, inner: Arc<Inner>) {
    loop {
        let accepted = tokio::select! {
            _ = inner.accept_cancel.cancelled() => Err(LinkError::Closed),
            accepted = acceptor.accept() => accepted.map_err(LinkError::from),
        };
        match accepted {
            Ok((stream, addr)) => inner.adopt(stream, addr).await,
            Err(e) if e.is_local_closure() => {
                log::debug!("[listener] {} acceptor closed", inner.local);
                break;
            }
            Err(e) => {
                log::error!("[listener] accept on {} failed, disposing: {e}", inner.local);
                inner.shutdown_sessions().await;
                break;
            }
        }
    }
    // Dropping `acceptor` here closes it.
}

async fn receive_loop(conn: StreamConnection, cancel: CancellationToken) {
    let peer = conn.peer_addr();
    while conn.is_connected() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = conn.receive() => {
                if let Err(e) = received {
                    log::warn!("[listener] receive from {peer} failed: {e}");
                }
            }
        }
    }
    if let Err(e) = conn.dispose().await {
        log::debug!("[listener] dispose {peer}: {e}");
    }
    log::debug!("[listener] receive loop for {peer} ended");
}

fn report_join_error(what: &str, e: JoinError) {
    if e.is_panic() {
        log::error!("[listener] {what} panicked: {e}");
    } else {
        log::debug!("[listener] {what} cancelled: {e}");
    }
}
