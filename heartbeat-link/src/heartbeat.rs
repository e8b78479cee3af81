//! Keep-alive loop for one connection.
//!
//! A [`HeartbeatTask`] runs on its own tokio task and repeats:
//!
//! ```text
//!   sleep(interval) ──cancelled──▶ exit
//!        │
//!        ▼
//!   connection alive and connected? ──no──▶ exit
//!        │ yes
//!        ▼
//!   send(marker) ──no destination──▶ skip this beat
//!        │       ──other err─────▶ dispose connection, exit
//!        │ ok
//!        └──────────▶ loop
//! ```
//!
//! With interval `I`, `floor(T / I)` markers have been sent `T` after start.
//! The interval and marker are re-read on every iteration, so changes made
//! through the connection's setters apply from the next beat on.
//!
//! The task only holds a weak handle.  Once every user handle is gone the
//! connection is dropped, its socket closes and the loop ends on its own.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::LinkError;

/// A non-owning connection handle the heartbeat can upgrade once per beat.
pub(crate) trait WeakConnection: Send + Sync + 'static {
    type Strong: Connection + 'static;

    fn upgrade(&self) -> Option<Self::Strong>;
}

/// Handle to a running heartbeat.  Owned by exactly one connection.
///
/// Dropping the handle stops the loop.
pub struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatTask {
    /// Spawn the loop for the connection behind `conn` on the current tokio runtime.
    pub(crate) fn spawn<W: WeakConnection>(conn: W) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(conn, cancel.clone()));
        Self { cancel, handle }
    }

    /// Request the loop to stop.  Does not wait for it.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<W: WeakConnection>(weak: W, cancel: CancellationToken) {
    let mut warned = false;
    loop {
        let Some(interval) = weak.upgrade().map(|conn| conn.heartbeat_interval()) else {
            break;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(conn) = weak.upgrade() else {
            break;
        };
        if conn.is_connected() {
            let marker = conn.heartbeat_data();
            match conn.send(&marker).await {
                Ok(()) => log::trace!("[heartbeat] → {} byte marker", marker.len()),
                // Nowhere to beat towards yet; the connection itself is fine.
                Err(LinkError::NoDestination) => {
                    if !warned {
                        log::warn!("[heartbeat] no destination set, skipping beats until there is one");
                        warned = true;
                    }
                }
                Err(e) => {
                    // The peer is gone; a failed send already disposed the
                    // connection unless it was closed locally in the meantime.
                    log::debug!("[heartbeat] send failed, treating as remote closure: {e}");
                    if let Err(e) = conn.dispose().await {
                        log::debug!("[heartbeat] dispose after failed send: {e}");
                    }
                    break;
                }
            }
        }

        if !conn.is_connected() || cancel.is_cancelled() {
            break;
        }
    }
    log::debug!("[heartbeat] loop ended");
}
