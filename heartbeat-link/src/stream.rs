//! [`Connection`] over a TCP byte stream.
//!
//! The stream is split into owned halves so a blocked `receive()` and a
//! `send()` (from the caller or the heartbeat) never wait on each other.
//! Each half sits in its own async mutex; `dispose()` takes both out and drops
//! them, which closes the socket.
//!
//! One `receive()` issues exactly one read.  Whatever that read returns is
//! classified and delivered as-is: there is no framing and no accumulation of
//! short reads.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

use crate::config::LinkConfig;
use crate::connection::{Connection, Core, Inbound, Packet, ReceiveHandler};
use crate::error::{LinkError, Result};
use crate::heartbeat::WeakConnection;

/// A heartbeat-aware TCP connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<Inner>,
}

/// Handle held by the heartbeat task; does not keep the connection open.
struct WeakStream(Weak<Inner>);

impl WeakConnection for WeakStream {
    type Strong = StreamConnection;

    fn upgrade(&self) -> Option<StreamConnection> {
        self.0.upgrade().map(|inner| StreamConnection { inner })
    }
}

struct Inner {
    core: Core,
    peer: SocketAddr,
    local: SocketAddr,
    reader: Mutex<ReadSide>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

struct ReadSide {
    half: Option<OwnedReadHalf>,
    /// Reused while its length equals the configured capacity.
    buffer: Vec<u8>,
}

/// How one read ended, decided while the read side is still locked.
enum ReadEnd {
    Done,
    PeerClosed,
    LocallyClosed,
    Fault(LinkError),
}

impl StreamConnection {
    /// Wrap an established stream.  Starts the heartbeat if `config` asks for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        stream: TcpStream,
        config: LinkConfig,
        handler: impl ReceiveHandler,
    ) -> Result<Self> {
        Self::with_shared_handler(stream, config, Arc::new(handler))
    }

    /// Connect to `addr` and wrap the resulting stream.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        config: LinkConfig,
        handler: impl ReceiveHandler,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, config, handler)
    }

    pub(crate) fn with_shared_handler(
        stream: TcpStream,
        config: LinkConfig,
        handler: Arc<dyn ReceiveHandler>,
    ) -> Result<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let maintain = config.maintain_heartbeat;
        let (read, write) = stream.into_split();

        let conn = Self {
            inner: Arc::new(Inner {
                core: Core::new(config, handler),
                peer,
                local,
                reader: Mutex::new(ReadSide {
                    half: Some(read),
                    buffer: Vec::new(),
                }),
                writer: Mutex::new(Some(write)),
            }),
        };
        if maintain {
            conn.set_maintain_heartbeat(true);
        }
        log::debug!("[stream] {local} ↔ {peer} connected");
        Ok(conn)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    async fn read_once(&self) -> Result<ReadEnd> {
        let core = &self.inner.core;
        let mut side = self.inner.reader.lock().await;
        let ReadSide { half, buffer } = &mut *side;
        let half = half.as_mut().ok_or(LinkError::Closed)?;

        let capacity = core.settings.max_receivable_bytes();
        if buffer.len() != capacity {
            *buffer = vec![0; capacity];
        }

        let read = tokio::select! {
            _ = core.closed.cancelled() => Err(LinkError::Closed),
            read = half.read(buffer) => read.map_err(LinkError::from),
        };

        let n = match read {
            // A zero-capacity buffer reads zero bytes without reaching EOF.
            Ok(0) if capacity > 0 => return Ok(ReadEnd::PeerClosed),
            Ok(n) => n,
            Err(e) if e.is_local_closure() => return Ok(ReadEnd::LocallyClosed),
            Err(e) => return Ok(ReadEnd::Fault(e)),
        };

        match core.classify(&buffer[..n]) {
            Inbound::Heartbeat => log::trace!("[stream] ← heartbeat from {}", self.inner.peer),
            Inbound::Data => core.deliver(&Packet {
                buffer: buffer.as_slice(),
                len: n,
                peer: self.inner.peer,
            }),
        }
        Ok(ReadEnd::Done)
    }

    /// Dispose after the connection ended on its own; the outcome is already known.
    async fn close_quietly(&self) {
        if let Err(e) = self.dispose().await {
            log::debug!("[stream] {} dispose: {e}", self.inner.peer);
        }
    }
}

#[async_trait]
impl Connection for StreamConnection {
    async fn send(&self, data: &[u8]) -> Result<()> {
        let result = {
            let mut writer = self.inner.writer.lock().await;
            let half = writer.as_mut().ok_or(LinkError::Closed)?;
            tokio::select! {
                _ = self.inner.core.closed.cancelled() => Err(LinkError::Closed),
                written = half.write_all(data) => written.map_err(LinkError::from),
            }
        };
        if let Err(e) = &result {
            if !e.is_local_closure() {
                log::debug!("[stream] send to {} failed: {e}", self.inner.peer);
                self.close_quietly().await;
            }
        }
        result
    }

    async fn receive(&self) -> Result<()> {
        match self.read_once().await? {
            ReadEnd::Done => Ok(()),
            ReadEnd::PeerClosed => {
                log::debug!("[stream] {} closed by peer", self.inner.peer);
                self.close_quietly().await;
                Ok(())
            }
            ReadEnd::LocallyClosed => {
                self.close_quietly().await;
                Ok(())
            }
            ReadEnd::Fault(e) => {
                log::debug!("[stream] receive from {} failed: {e}", self.inner.peer);
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
            .set_heartbeat(WeakStream(Arc::downgrade(&self.inner)), enabled);
    }

    fn maintains_heartbeat(&self) -> bool {
        self.inner.core.maintains_heartbeat()
    }

    async fn dispose(&self) -> Result<()> {
        if !self.inner.core.begin_dispose() {
            return Ok(());
        }
        log::debug!("[stream] {} disposed", self.inner.peer);

        let writer = self.inner.writer.lock().await.take();
        self.inner.reader.lock().await.half.take();
        match writer {
            Some(mut half) => half.shutdown().await.map_err(LinkError::from),
            None => Ok(()),
        }
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

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("local", &self.inner.local)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}
