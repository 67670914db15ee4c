//! # skiff-transport
//!
//! Reliable-UDP peer-to-peer session transport.
//!
//! Selective reliability and in-order delivery on top of raw datagrams:
//! every packet carries an ack plus a 16-bit window of the acks before it,
//! reliable messages are resent until an ack covering them comes back, and
//! in-order messages are resequenced on the receiver. A host/join/deny
//! handshake manages a small fixed table of peers.
//!
//! ## Crate structure
//!
//! - [`seq`] — Cyclic u16 comparison and the ack window bitfield
//! - [`wire`] — Packet header and message framing
//! - [`message`] — Message registry, dispatch context, core payloads
//! - [`reliability`] — Ack bundles, confirmation watermark, dedup, resequencer
//! - [`connection`] — Per-peer reliability engine and RTT tracking
//! - [`transport`] — Non-blocking datagram transports (UDP, in-memory)
//! - [`sim`] — Loss/latency injection over any transport
//! - [`session`] — Connection table, handshake, tick loop, timeouts
//! - [`config`] — Session configuration and TOML loading
//! - [`error`] — Error types and handshake result codes
//! - [`stats`] — Per-connection and session statistics

pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod reliability;
pub mod seq;
pub mod session;
pub mod sim;
pub mod stats;
pub mod transport;
pub mod wire;

pub use config::{SessionConfig, SessionConfigInput};
pub use connection::{ConnectionId, ConnectionState, Guid, PeerConnection, MAX_CONNECTIONS};
pub use error::{ErrorCode, SessionError};
pub use message::{MessageContext, CORE_MESSAGE_COUNT};
pub use session::{Session, SessionEvent, SessionState};
pub use transport::{MemoryNetwork, Transport, UdpTransport};
pub use wire::{ControlFlags, MessageOptions, WireMessage};
