//! Error type shared by connections and listeners.
//!
//! Transport failures fall into three buckets (see [`crate::connection`]):
//! closure we caused ourselves, closure the peer caused, and everything else.
//! Only the last one is ever surfaced to a caller of `receive()`.  The two
//! predicates in this module are the single place that decides which bucket an
//! error belongs to.

use std::io;

use thiserror::Error;

/// Errors that can arise from connection and listener operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The handle was already closed by a local `dispose()`.
    #[error("connection closed")]
    Closed,
    /// A datagram send had neither an explicit nor a bound destination.
    #[error("datagram send without a destination address")]
    NoDestination,
    /// Underlying I/O error from the OS.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Returns true if the error reports a handle that was closed locally.
    ///
    /// tokio has no "socket closed" error of its own: once a connection is
    /// disposed the handle is dropped and every later operation yields
    /// [`LinkError::Closed`], so matching that variant is sufficient.
    pub fn is_local_closure(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Returns true if a datagram error means the peer went away.
///
/// A connected UDP socket learns about a vanished peer only through ICMP,
/// which the OS reports on the next receive as one of these kinds.
pub fn is_peer_unreachable(e: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    )
}
