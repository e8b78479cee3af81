//! Connection tunables.
//!
//! [`LinkConfig`] is the value callers build up front and hand to a
//! connection or listener constructor.  Each connection copies it into a
//! [`Settings`] store so the accessors on [`crate::connection::Connection`]
//! can change it later, from any task, without `&mut self`.
//!
//! No value is validated: an empty or very large heartbeat payload and a
//! zero interval are all accepted as-is.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Heartbeat marker used when none is configured.  Peers on defaults must agree on it.
pub const DEFAULT_HEARTBEAT_DATA: [u8; 1] = [0xFF];

/// Delay between two heartbeat sends.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10_000);

/// Size of the receive buffer, i.e. the most bytes one `receive()` can deliver.
pub const DEFAULT_MAX_RECEIVABLE_BYTES: usize = 1024;

/// Adjustable connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Payload that marks a heartbeat; compared by exact length and content.
    pub heartbeat_data: Vec<u8>,
    /// Interval between heartbeat sends.
    pub heartbeat_interval: Duration,
    /// Receive buffer capacity.
    pub max_receivable_bytes: usize,
    /// Start the heartbeat as soon as the connection is constructed.
    pub maintain_heartbeat: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_data: DEFAULT_HEARTBEAT_DATA.to_vec(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_receivable_bytes: DEFAULT_MAX_RECEIVABLE_BYTES,
            maintain_heartbeat: false,
        }
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.heartbeat_data = data.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_receivable_bytes(mut self, bytes: usize) -> Self {
        self.max_receivable_bytes = bytes;
        self
    }

    pub fn with_heartbeat(mut self, enabled: bool) -> Self {
        self.maintain_heartbeat = enabled;
        self
    }
}

/// Live copy of a [`LinkConfig`] owned by one connection.
///
/// Readers always observe the most recent write.
#[derive(Debug)]
pub(crate) struct Settings {
    inner: RwLock<LinkConfig>,
}

impl Settings {
    pub(crate) fn new(config: LinkConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    // A panic while holding the lock cannot leave a plain value struct
    // half-written, so poisoning is ignored.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, LinkConfig> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LinkConfig> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn heartbeat_data(&self) -> Vec<u8> {
        self.read().heartbeat_data.clone()
    }

    pub(crate) fn set_heartbeat_data(&self, data: Vec<u8>) {
        self.write().heartbeat_data = data;
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        self.read().heartbeat_interval
    }

    pub(crate) fn set_heartbeat_interval(&self, interval: Duration) {
        self.write().heartbeat_interval = interval;
    }

    pub(crate) fn max_receivable_bytes(&self) -> usize {
        self.read().max_receivable_bytes
    }

    pub(crate) fn set_max_receivable_bytes(&self, bytes: usize) {
        self.write().max_receivable_bytes = bytes;
    }
}
