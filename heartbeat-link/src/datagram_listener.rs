//! UDP "server": a [`DatagramConnection`] driven by its own receive loop.
//!
//! There is no accept phase.  The listener only keeps calling `receive()`
//! while the connection is open; replies go out through
//! [`DatagramListener::connection`] and [`DatagramConnection::send_to`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::ToSocketAddrs;
use tokio::task::JoinHandle;

use crate::config::LinkConfig;
use crate::connection::{Connection, ReceiveHandler};
use crate::datagram::DatagramConnection;
use crate::error::Result;
use crate::listener::Listener;
use crate::state::ListenerState;

/// Drives the receive loop of one datagram connection.
#[derive(Clone)]
pub struct DatagramListener {
    inner: Arc<Inner>,
}

struct Inner {
    connection: DatagramConnection,
    task: JoinHandle<()>,
}

impl DatagramListener {
    /// Start the receive loop for `connection`.  Must be called from within a tokio runtime.
    pub fn new(connection: DatagramConnection) -> Self {
        let task = tokio::spawn(receive_loop(connection.clone()));
        log::info!("[listener] receiving datagrams on {}", connection.local_addr());
        Self {
            inner: Arc::new(Inner { connection, task }),
        }
    }

    /// Bind an unbound datagram connection to `addr` and drive it.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: LinkConfig,
        handler: impl ReceiveHandler,
    ) -> Result<Self> {
        let connection = DatagramConnection::bind(addr, config, handler).await?;
        Ok(Self::new(connection))
    }

    pub fn connection(&self) -> &DatagramConnection {
        &self.inner.connection
    }

    /// Whether the receive loop has exited.
    pub fn is_finished(&self) -> bool {
        self.inner.task.is_finished()
    }
}

#[async_trait]
impl Listener for DatagramListener {
    async fn dispose(&self) -> Result<()> {
        self.inner.connection.dispose().await
    }

    fn state(&self) -> ListenerState {
        if self.inner.connection.is_connected() {
            ListenerState::Listening
        } else {
            ListenerState::Disposed
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.connection.local_addr()
    }
}

impl std::fmt::Debug for DatagramListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramListener")
            .field("connection", &self.inner.connection)
            .field("state", &self.state())
            .finish()
    }
}

async fn receive_loop(conn: DatagramConnection) {
    let local = conn.local_addr();
    while conn.is_connected() {
        if let Err(e) = conn.receive().await {
            log::warn!("[listener] datagram receive on {local} failed: {e}");
        }
    }
    log::debug!("[listener] datagram receive loop on {local} ended");
}
