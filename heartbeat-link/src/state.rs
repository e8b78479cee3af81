//! Lifecycle state types.
//!
//! Both machines have a single transition into a terminal state:
//!
//! ```text
//!  Connection:  CONNECTED ──dispose / peer gone / heartbeat failed──▶ DISCONNECTED
//!  Listener:    LISTENING ──dispose / fatal accept error───────────▶ DISPOSED
//! ```
//!
//! There is no reconnecting state; a new connection needs a new handle.

/// State of a [`crate::connection::Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The transport handle is open.
    Connected,
    /// The handle has been disposed.  Terminal.
    Disconnected,
}

impl ConnectionState {
    pub fn from_connected(connected: bool) -> Self {
        if connected {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// State of a [`crate::listener::Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Accepting connections (stream) or driving the receive loop (datagram).
    Listening,
    /// Stopped.  Terminal.
    Disposed,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
