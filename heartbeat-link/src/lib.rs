//! `heartbeat-link`: heartbeat-monitored TCP and UDP connections, and the
//! listeners that supervise them.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────────┐  accept   ┌──────────────────┐  receive()  ┌─────────────────┐
//!  │ StreamListener │──────────▶│ StreamConnection │────────────▶│ ReceiveHandler  │
//!  └────────────────┘  (1 task  └────────┬─────────┘  heartbeats │ (consumer code) │
//!                       per conn)        │            filtered   └─────────────────┘
//!  ┌──────────────────┐           ┌──────▼────────┐                      ▲
//!  │ DatagramListener │──────────▶│ HeartbeatTask │                      │
//!  └──────────────────┘  drives   └──────▲────────┘                      │
//!            │                           │                               │
//!            └──────────────▶ DatagramConnection ────────────────────────┘
//! ```
//!
//! Heartbeats share the data channel: a received payload that equals the
//! configured marker byte-for-byte (default `[0xFF]`) is consumed as a
//! liveness signal and never reaches the handler.
//!
//! Each module has a single responsibility:
//! - [`connection`]        : the `Connection` contract, packets, classification
//! - [`stream`]            : `Connection` over TCP
//! - [`datagram`]          : `Connection` over UDP, bound or unbound
//! - [`heartbeat`]         : the per-connection keep-alive task
//! - [`listener`]          : the `Listener` contract and the TCP server
//! - [`datagram_listener`] : receive loop driver for a UDP connection
//! - [`config`]            : tunables and their defaults
//! - [`state`]             : lifecycle state types
//! - [`error`]             : error type and closure predicates

pub mod config;
pub mod connection;
pub mod datagram;
pub mod datagram_listener;
pub mod error;
pub mod heartbeat;
pub mod listener;
pub mod state;
pub mod stream;

pub use config::LinkConfig;
pub use connection::{Connection, Packet, ReceiveHandler};
pub use datagram::DatagramConnection;
pub use datagram_listener::DatagramListener;
pub use error::{LinkError, Result};
pub use listener::{Listener, StreamListener};
pub use state::{ConnectionState, ListenerState};
pub use stream::StreamConnection;
