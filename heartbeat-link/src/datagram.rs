//! [`Connection`] over a UDP socket.
//!
//! A datagram connection is either *bound* to one peer (the socket handed in
//! was already `connect`ed) or *unbound*.  Unbound connections report the
//! source of every datagram in [`Packet::peer`] and can only send once they
//! have a destination, either per call via [`DatagramConnection::send_to`] or
//! once via [`DatagramConnection::set_destination`].
//!
//! UDP has no end-of-stream.  A vanished peer shows up as an I/O error on the
//! next receive (ICMP port unreachable on a connected socket), which is
//! treated as a remote closure; any other error is a fault.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::config::LinkConfig;
use crate::connection::{Connection, Core, Inbound, Packet, ReceiveHandler};
use crate::error::{is_peer_unreachable, LinkError, Result};
use crate::heartbeat::WeakConnection;

/// A heartbeat-aware UDP connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct DatagramConnection {
    inner: Arc<Inner>,
}

/// Handle held by the heartbeat task; does not keep the connection open.
struct WeakDatagram(Weak<Inner>);

impl WeakConnection for WeakDatagram {
    type Strong = DatagramConnection;

    fn upgrade(&self) -> Option<DatagramConnection> {
        self.0.upgrade().map(|inner| DatagramConnection { inner })
    }
}

struct Inner {
    core: Core,
    /// Shared with in-flight operations; `None` once disposed.
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local: SocketAddr,
    /// Fixed peer of a connected socket.
    peer: Option<SocketAddr>,
    /// Fallback destination for an unbound socket.
    destination: Mutex<Option<SocketAddr>>,
    buffer: tokio::sync::Mutex<Vec<u8>>,
}

impl DatagramConnection {
    /// Wrap a bound socket.  If the socket is connected, the connection is
    /// bound to that peer.  Starts the heartbeat if `config` asks for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        socket: UdpSocket,
        config: LinkConfig,
        handler: impl ReceiveHandler,
    ) -> Result<Self> {
        let local = socket.local_addr()?;
        let peer = socket.peer_addr().ok();
        let maintain = config.maintain_heartbeat;

        let conn = Self {
            inner: Arc::new(Inner {
                core: Core::new(config, Arc::new(handler)),
                socket: Mutex::new(Some(Arc::new(socket))),
                local,
                peer,
                destination: Mutex::new(None),
                buffer: tokio::sync::Mutex::new(Vec::new()),
            }),
        };
        if maintain {
            conn.set_maintain_heartbeat(true);
        }
        match peer {
            Some(peer) => log::debug!("[datagram] {local} bound to {peer}"),
            None => log::debug!("[datagram] {local} unbound"),
        }
        Ok(conn)
    }

    /// Bind a socket to `local` and wrap it unbound.
    pub async fn bind(
        local: impl ToSocketAddrs,
        config: LinkConfig,
        handler: impl ReceiveHandler,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Self::new(socket, config, handler)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// The fixed peer, if the socket was connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.inner.peer.or(*self.lock_destination())
    }

    /// Set where `send()` goes on an unbound connection.  Ignored when bound.
    pub fn set_destination(&self, destination: Option<SocketAddr>) {
        *self.lock_destination() = destination;
    }

    /// Send one datagram to an explicit destination.
    ///
    /// On a bound connection the destination must be the bound peer; the OS
    /// rejects anything else.
    pub async fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<()> {
        let socket = self.socket()?;
        let sent = tokio::select! {
            _ = self.inner.core.closed.cancelled() => Err(LinkError::Closed),
            sent = socket.send_to(data, dest) => sent.map_err(LinkError::from),
        };
        drop(socket);
        self.finish_send(sent.map(drop), dest).await
    }

    fn lock_destination(&self) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
        self.inner
            .destination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(LinkError::Closed)
    }

    async fn finish_send(&self, result: Result<()>, dest: SocketAddr) -> Result<()> {
        if let Err(e) = &result {
            if !e.is_local_closure() {
                log::debug!("[datagram] send to {dest} failed: {e}");
                self.close_quietly().await;
            }
        }
        result
    }

    async fn close_quietly(&self) {
        if let Err(e) = self.dispose().await {
            log::debug!("[datagram] {} dispose: {e}", self.inner.local);
        }
    }
}

#[async_trait]
impl Connection for DatagramConnection {
    async fn send(&self, data: &[u8]) -> Result<()> {
        let Some(dest) = self.destination() else {
            return Err(LinkError::NoDestination);
        };
        if self.inner.peer.is_none() {
            return self.send_to(data, dest).await;
        }

        let socket = self.socket()?;
        let sent = tokio::select! {
            _ = self.inner.core.closed.cancelled() => Err(LinkError::Closed),
            sent = socket.send(data) => sent.map_err(LinkError::from),
        };
        drop(socket);
        self.finish_send(sent.map(drop), dest).await
    }

    async fn receive(&self) -> Result<()> {
        let core = &self.inner.core;
        let socket = self.socket()?;

        let received = {
            let mut buffer = self.inner.buffer.lock().await;
            let capacity = core.settings.max_receivable_bytes();
            if buffer.len() != capacity {
                *buffer = vec![0; capacity];
            }

            let received = tokio::select! {
                _ = core.closed.cancelled() => Err(LinkError::Closed),
                received = socket.recv_from(&mut buffer[..]) => received.map_err(LinkError::from),
            };
            if let Ok((len, peer)) = received {
                // A fresh packet view per datagram; the bytes stay in the shared buffer.
                let packet = Packet {
                    buffer: &buffer[..],
                    len,
                    peer,
                };
                match core.classify(packet.payload()) {
                    Inbound::Heartbeat => log::trace!("[datagram] ← heartbeat from {peer}"),
                    Inbound::Data => core.deliver(&packet),
                }
            }
            received
        };
        drop(socket);

        match received {
            Ok(_) => Ok(()),
            Err(e) if e.is_local_closure() => {
                self.close_quietly().await;
                Ok(())
            }
            Err(LinkError::Io(e)) if is_peer_unreachable(&e) => {
                log::debug!("[datagram] {} peer unreachable: {e}", self.inner.local);
                self.close_quietly().await;
                Ok(())
            }
            Err(e) => {
                log::debug!("[datagram] receive on {} failed: {e}", self.inner.local);
                self.close_quietly().await;
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    fn set_maintain_heartbeat(&self, enabled: bool) {
        self.inner
            .core
            .set_heartbeat(WeakDatagram(Arc::downgrade(&self.inner)), enabled);
    }

    fn maintains_heartbeat(&self) -> bool {
        self.inner.core.maintains_heartbeat()
    }

    async fn dispose(&self) -> Result<()> {
        if !self.inner.core.begin_dispose() {
            return Ok(());
        }
        log::debug!("[datagram] {} disposed", self.inner.local);
        // In-flight operations hold their own clone and drop it once woken.
        self.inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn heartbeat_data(&self) -> Vec<u8> {
        self.inner.core.settings.heartbeat_data()
    }

    fn set_heartbeat_data(&self, data: Vec<u8>) {
        self.inner.core.settings.set_heartbeat_data(data);
    }

    fn heartbeat_interval(&self) -> Duration {
        self.inner.core.settings.heartbeat_interval()
    }

    fn set_heartbeat_interval(&self, interval: Duration) {
        self.inner.core.settings.set_heartbeat_interval(interval);
    }

    fn max_receivable_bytes(&self) -> usize {
        self.inner.core.settings.max_receivable_bytes()
    }

    fn set_max_receivable_bytes(&self, bytes: usize) {
        self.inner.core.settings.set_max_receivable_bytes(bytes);
    }
}

impl std::fmt::Debug for DatagramConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramConnection")
            .field("local", &self.inner.local)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}
