//! The [`Connection`] contract and the pieces every implementation shares.
//!
//! A connection owns one transport handle and one optional heartbeat.  Its
//! responsibilities are:
//! - Sending application bytes (and heartbeats) to the peer.
//! - Receiving one unit of data per `receive()` call and classifying it.
//! - Tearing itself down exactly once, whoever notices the end first.
//!
//! # Classification
//!
//! Heartbeats travel on the same channel as application data, so every
//! received payload is checked before the consumer sees it:
//!
//! | Observation                        | Result                              |
//! |------------------------------------|-------------------------------------|
//! | handle closed by local `dispose()` | dispose, return `Ok(())`            |
//! | peer closed (EOF / unreachable)    | dispose, return `Ok(())`            |
//! | any other transport error          | dispose, return `Err`               |
//! | payload == heartbeat marker        | swallow, return `Ok(())`            |
//! | anything else                      | [`ReceiveHandler::on_receive_data`] |
//!
//! Calling `receive()` on a connection that was already disposed is an error
//! ([`crate::error::LinkError::Closed`]); only a receive that was *in flight*
//! when the handle closed is treated as a clean local closure.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{LinkConfig, Settings};
use crate::error::Result;
use crate::heartbeat::{HeartbeatTask, WeakConnection};
use crate::state::ConnectionState;

/// One bidirectional, heartbeat-aware peer relationship.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Write `data` to the peer.
    ///
    /// On a transport failure the connection disposes itself before the error
    /// is returned; the caller has nothing left to clean up.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Wait for one inbound unit of data and classify it.
    async fn receive(&self) -> Result<()>;

    /// Whether the transport is still open.  Never true again once false.
    fn is_connected(&self) -> bool;

    fn state(&self) -> ConnectionState {
        ConnectionState::from_connected(self.is_connected())
    }

    /// Start or stop the heartbeat.  Both directions are idempotent, and
    /// stopping does not wait for the heartbeat task to exit.
    fn set_maintain_heartbeat(&self, enabled: bool);

    /// Whether a heartbeat task is currently alive.
    fn maintains_heartbeat(&self) -> bool;

    /// Close the transport handle and stop the heartbeat.
    ///
    /// Only the first call does any work; later calls return `Ok(())`.
    async fn dispose(&self) -> Result<()>;

    fn heartbeat_data(&self) -> Vec<u8>;
    fn set_heartbeat_data(&self, data: Vec<u8>);
    fn heartbeat_interval(&self) -> Duration;
    fn set_heartbeat_interval(&self, interval: Duration);
    fn max_receivable_bytes(&self) -> usize;
    fn set_max_receivable_bytes(&self, bytes: usize);
}

/// One received unit of application data.
///
/// `buffer` is the connection's whole receive buffer and is reused by the
/// next `receive()`: copy [`Packet::payload`] if it must outlive the callback.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub buffer: &'a [u8],
    /// Number of valid bytes at the start of `buffer`.
    pub len: usize,
    /// Where the data came from.
    pub peer: SocketAddr,
}

impl<'a> Packet<'a> {
    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[..self.len]
    }
}

/// Consumer of application data, injected at construction.
pub trait ReceiveHandler: Send + Sync + 'static {
    fn on_receive_data(&self, packet: &Packet<'_>);
}

impl<F> ReceiveHandler for F
where
    F: Fn(&Packet<'_>) + Send + Sync + 'static,
{
    fn on_receive_data(&self, packet: &Packet<'_>) {
        self(packet)
    }
}

/// What a received payload turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Data,
}

/// Compare `received` against the heartbeat marker.
///
/// Length is part of the match, so an application message that merely starts
/// with the marker is still data.
pub fn classify(heartbeat: &[u8], received: &[u8]) -> Inbound {
    if received == heartbeat {
        Inbound::Heartbeat
    } else {
        Inbound::Data
    }
}

/// State shared by both connection kinds: settings, the closed signal, the
/// heartbeat slot and the consumer.
pub(crate) struct Core {
    pub(crate) settings: Settings,
    /// Cancelled by `dispose()`; wakes any in-flight send or receive.
    pub(crate) closed: CancellationToken,
    disposed: AtomicBool,
    heartbeat: Mutex<Option<HeartbeatTask>>,
    handler: Arc<dyn ReceiveHandler>,
}

impl Core {
    pub(crate) fn new(config: LinkConfig, handler: Arc<dyn ReceiveHandler>) -> Self {
        Self {
            settings: Settings::new(config),
            closed: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
            handler,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Mark the connection disposed.  Returns true for the first caller only.
    pub(crate) fn begin_dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed.cancel();
        self.stop_heartbeat();
        true
    }

    pub(crate) fn classify(&self, received: &[u8]) -> Inbound {
        classify(&self.settings.read().heartbeat_data, received)
    }

    pub(crate) fn deliver(&self, packet: &Packet<'_>) {
        self.handler.on_receive_data(packet);
    }

    pub(crate) fn set_heartbeat<W: WeakConnection>(&self, owner: W, enabled: bool) {
        if !enabled {
            self.stop_heartbeat();
            return;
        }
        let mut slot = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(HeartbeatTask::is_running) || !self.is_connected() {
            return;
        }
        *slot = Some(HeartbeatTask::spawn(owner));
    }

    pub(crate) fn maintains_heartbeat(&self) -> bool {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(HeartbeatTask::is_running)
    }

    fn stop_heartbeat(&self) {
        let task = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop();
        }
    }
}
