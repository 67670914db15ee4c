//! # Session Statistics
//!
//! Per-connection counters and a session-wide aggregate, serialisable to
//! JSON for logging.

use serde::Serialize;

use crate::connection::{ConnectionId, ConnectionState};

// ─── Connection Stats ───────────────────────────────────────────────────────

/// Counters kept by one [`PeerConnection`](crate::connection::PeerConnection).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    /// Datagrams built and handed to the transport.
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Datagrams routed to this connection.
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Reliable messages written again after the resend threshold.
    pub reliable_resends: u64,
    /// Reliable messages dropped because their id was already processed.
    pub duplicates_dropped: u64,
    /// In-order messages held back waiting for a gap to fill.
    pub out_of_order_buffered: u64,
    /// In-order messages whose sequence id had already passed.
    pub stale_dropped: u64,
    /// Messages skipped for a bad length prefix.
    pub malformed_messages: u64,
    /// Messages handed to a handler.
    pub messages_delivered: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resends per packet sent.
    pub fn resend_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.reliable_resends as f64 / self.packets_sent as f64
        }
    }

    /// Fold `other` into `self`.
    pub fn accumulate(&mut self, other: &ConnectionStats) {
        self.packets_sent += other.packets_sent;
        self.bytes_sent += other.bytes_sent;
        self.packets_received += other.packets_received;
        self.bytes_received += other.bytes_received;
        self.reliable_resends += other.reliable_resends;
        self.duplicates_dropped += other.duplicates_dropped;
        self.out_of_order_buffered += other.out_of_order_buffered;
        self.stale_dropped += other.stale_dropped;
        self.malformed_messages += other.malformed_messages;
        self.messages_delivered += other.messages_delivered;
    }
}

// ─── Session Stats ──────────────────────────────────────────────────────────

/// Snapshot of one connection inside [`SessionStats`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub name: String,
    pub state: ConnectionState,
    /// Smoothed RTT in µs, 0 before the first PONG.
    pub srtt_us: u64,
    /// Reliable messages queued or in flight.
    pub reliables_outstanding: usize,
    pub stats: ConnectionStats,
}

/// Session-wide snapshot returned by [`Session::stats`](crate::session::Session::stats).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub connections: Vec<ConnectionSnapshot>,
    /// Sum over every connection.
    pub totals: ConnectionStats,
    /// Datagrams that could not be attributed to a connection.
    pub connectionless_packets: u64,
    /// Messages dropped because their type is not registered.
    pub unknown_messages: u64,
}

impl SessionStats {
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
