//! # Peer Connection
//!
//! One remote endpoint's reliability and ordering engine. The session owns
//! one [`PeerConnection`] per table slot and drives it through three calls:
//!
//! - [`PeerConnection::build_packet`] once per tick: old unconfirmed
//!   reliables first, then new reliables, then unreliables.
//! - [`PeerConnection::mark_packet_received`] for every datagram routed here:
//!   updates our ack window and resolves the peer's acks against our
//!   [`AckBundleRing`].
//! - [`PeerConnection::process_message`] for every message in that datagram:
//!   dedups reliables, resequences in-order messages, returns what is ready.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes};
use quanta::Instant;
use serde::Serialize;

use crate::message::{Ping, Pong};
use crate::reliability::{
    AckBundleRing, ConfirmedReliables, ReceivedReliables, Resequencer, Sequenced,
    MAX_RELIABLE_RANGE,
};
use crate::seq::{next_ack, sequence_diff, AckWindow};
use crate::stats::ConnectionStats;
use crate::wire::{
    PacketHeader, PacketWriter, WireMessage, INVALID_ACK, INVALID_CONNECTION_INDEX,
};

/// Slots in a session's connection table.
pub const MAX_CONNECTIONS: usize = 8;

/// Length of a [`Guid`] on the wire.
pub const GUID_LEN: usize = 32;

// ─── Identity ───────────────────────────────────────────────────────────────

/// Index of a connection in the session table; travels as the packet
/// header's sender byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u8);

impl ConnectionId {
    pub const INVALID: ConnectionId = ConnectionId(INVALID_CONNECTION_INDEX);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_CONNECTIONS
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "#invalid")
        }
    }
}

/// Fixed-width peer name, zero padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid([u8; GUID_LEN]);

impl Guid {
    /// Build from a display name, truncated to [`GUID_LEN`] bytes.
    pub fn from_name(name: &str) -> Self {
        let mut raw = [0u8; GUID_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(GUID_LEN);
        raw[..n].copy_from_slice(&bytes[..n]);
        Guid(raw)
    }

    pub fn as_bytes(&self) -> &[u8; GUID_LEN] {
        &self.0
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < GUID_LEN {
            return None;
        }
        let mut raw = [0u8; GUID_LEN];
        buf.copy_to_slice(&mut raw);
        Some(Guid(raw))
    }

    /// The name with padding stripped.
    pub fn name(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(GUID_LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:?})", self.name())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Health of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Silent past the bad-connection threshold; still in the table.
    Bad,
    /// Our own endpoint; never sends datagrams.
    Local,
    /// Nothing received from the peer yet.
    Unconfirmed,
    Confirmed,
}

// ─── RTT Tracker ────────────────────────────────────────────────────────────

/// Pings older than this are forgotten.
const PING_EXPIRY: Duration = Duration::from_secs(5);

/// RTT estimation from PING/PONG exchanges (RFC 6298 smoothing).
#[derive(Debug)]
pub struct RttTracker {
    /// Outstanding pings: ping_id → send time.
    pending: HashMap<u16, Instant>,
    next_ping_id: u16,
    srtt_us: f64,
    rttvar_us: f64,
    min_rtt_us: f64,
    max_rtt_us: f64,
    sample_count: u64,
}

impl RttTracker {
    pub fn new() -> Self {
        RttTracker {
            pending: HashMap::new(),
            next_ping_id: 0,
            srtt_us: 0.0,
            rttvar_us: 0.0,
            min_rtt_us: f64::MAX,
            max_rtt_us: 0.0,
            sample_count: 0,
        }
    }

    /// Start a ping at `now`. `timestamp_us` is echoed back by the peer.
    pub fn make_ping(&mut self, now: Instant, timestamp_us: u32) -> Ping {
        let ping_id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.pending.insert(ping_id, now);
        Ping {
            ping_id,
            origin_timestamp_us: timestamp_us,
        }
    }

    /// Resolve a PONG. Returns the measured RTT, or `None` for an unknown
    /// or expired ping id.
    pub fn handle_pong(&mut self, now: Instant, pong: &Pong) -> Option<Duration> {
        let sent = self.pending.remove(&pong.ping_id)?;
        let rtt = now.saturating_duration_since(sent);
        let rtt_us = rtt.as_micros() as f64;

        self.sample_count += 1;
        self.min_rtt_us = self.min_rtt_us.min(rtt_us);
        self.max_rtt_us = self.max_rtt_us.max(rtt_us);

        if self.sample_count == 1 {
            self.srtt_us = rtt_us;
            self.rttvar_us = rtt_us / 2.0;
        } else {
            // α = 1/8, β = 1/4
            self.rttvar_us = 0.75 * self.rttvar_us + 0.25 * (self.srtt_us - rtt_us).abs();
            self.srtt_us = 0.875 * self.srtt_us + 0.125 * rtt_us;
        }

        self.pending
            .retain(|_, t| now.saturating_duration_since(*t) < PING_EXPIRY);
        Some(rtt)
    }

    pub fn srtt_us(&self) -> f64 {
        self.srtt_us
    }

    pub fn rttvar_us(&self) -> f64 {
        self.rttvar_us
    }

    /// Smallest RTT seen, `None` before the first sample.
    pub fn min_rtt_us(&self) -> Option<f64> {
        (self.sample_count > 0).then_some(self.min_rtt_us)
    }

    pub fn max_rtt_us(&self) -> f64 {
        self.max_rtt_us
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for RttTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Peer Connection ────────────────────────────────────────────────────────

/// A reliable message waiting for confirmation.
#[derive(Debug)]
struct SentReliable {
    msg: WireMessage,
    sent_at: Instant,
}

/// Per-peer reliability state.
#[derive(Debug)]
pub struct PeerConnection {
    id: ConnectionId,
    addr: SocketAddr,
    guid: Guid,
    state: ConnectionState,
    last_sent: Instant,
    last_received: Instant,
    /// The remote has sent us packets stamped with this slot's index.
    addressed: bool,

    // Outbound
    unsent_reliables: VecDeque<WireMessage>,
    sent_reliables: VecDeque<SentReliable>,
    unreliables: Vec<WireMessage>,
    next_reliable_id: u16,
    next_sequence_id: u16,
    confirmed: ConfirmedReliables,

    // Acks
    bundles: AckBundleRing,
    next_ack: u16,
    received_acks: AckWindow,

    // Inbound
    received_reliables: ReceivedReliables,
    resequencer: Resequencer,

    rtt: RttTracker,
    stats: ConnectionStats,
}

impl PeerConnection {
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        guid: Guid,
        state: ConnectionState,
        now: Instant,
    ) -> Self {
        PeerConnection {
            id,
            addr,
            guid,
            state,
            last_sent: now,
            last_received: now,
            addressed: false,
            unsent_reliables: VecDeque::new(),
            sent_reliables: VecDeque::new(),
            unreliables: Vec::new(),
            next_reliable_id: 0,
            next_sequence_id: 0,
            confirmed: ConfirmedReliables::new(),
            bundles: AckBundleRing::new(),
            next_ack: 0,
            received_acks: AckWindow::new(),
            received_reliables: ReceivedReliables::new(),
            resequencer: Resequencer::new(),
            rtt: RttTracker::new(),
            stats: ConnectionStats::new(),
        }
    }

    /// Our own endpoint.
    pub fn local(id: ConnectionId, addr: SocketAddr, guid: Guid, now: Instant) -> Self {
        Self::new(id, addr, guid, ConnectionState::Local, now)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_local(&self) -> bool {
        self.state == ConnectionState::Local
    }

    pub fn is_addressed(&self) -> bool {
        self.addressed
    }

    pub fn mark_addressed(&mut self) {
        self.addressed = true;
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut ConnectionStats {
        &mut self.stats
    }

    pub fn rtt(&self) -> &RttTracker {
        &self.rtt
    }

    pub fn rtt_mut(&mut self) -> &mut RttTracker {
        &mut self.rtt
    }

    /// Our ack window as it will be advertised in the next header.
    pub fn received_acks(&self) -> AckWindow {
        self.received_acks
    }

    pub fn oldest_unconfirmed(&self) -> u16 {
        self.confirmed.oldest_unconfirmed()
    }

    /// Reliable messages queued or awaiting confirmation.
    pub fn reliables_outstanding(&self) -> usize {
        self.unsent_reliables.len() + self.sent_reliables.len()
    }

    pub fn unreliables_queued(&self) -> usize {
        self.unreliables.len()
    }

    /// Rebind a joining placeholder to the slot and name the host assigned.
    pub(crate) fn assign(&mut self, id: ConnectionId, guid: Guid) {
        self.id = id;
        self.guid = guid;
    }

    /// Flag as unhealthy. Returns `true` on the transition.
    pub(crate) fn mark_bad(&mut self) -> bool {
        if matches!(self.state, ConnectionState::Bad | ConnectionState::Local) {
            return false;
        }
        tracing::debug!(conn = %self.id, addr = %self.addr, "connection bad");
        self.state = ConnectionState::Bad;
        true
    }

    // ─── Outbound ───────────────────────────────────────────────────────

    /// Queue a message for the next packet. In-order messages get their
    /// sequence id here.
    pub fn send_message(&mut self, mut msg: WireMessage) {
        if msg.is_in_order() {
            msg.sequence_id = self.next_sequence_id;
            self.next_sequence_id = self.next_sequence_id.wrapping_add(1);
        }
        if msg.is_reliable() {
            self.unsent_reliables.push_back(msg);
        } else {
            self.unreliables.push(msg);
        }
    }

    /// Everything queued on the local connection, for in-process delivery.
    pub fn take_loopback(&mut self) -> Vec<WireMessage> {
        let mut out: Vec<WireMessage> = self.unsent_reliables.drain(..).collect();
        out.append(&mut self.unreliables);
        out
    }

    /// Whether a new reliable id may be put in flight.
    fn reliable_window_open(&self) -> bool {
        sequence_diff(self.next_reliable_id, self.confirmed.oldest_unconfirmed())
            < MAX_RELIABLE_RANGE as i32
    }

    /// Build this tick's packet. `sender` is our index in the peer's table.
    pub fn build_packet(&mut self, now: Instant, sender: u8, resend_after: Duration) -> Bytes {
        let ack = self.next_ack;
        self.next_ack = next_ack(ack);
        self.bundles.begin(ack);

        let mut writer = PacketWriter::new(PacketHeader::new(sender, ack, self.received_acks));

        // Old unconfirmed reliables, round-robin.
        let mut resends = 0u64;
        for _ in 0..self.sent_reliables.len() {
            let Some(mut entry) = self.sent_reliables.pop_front() else {
                break;
            };
            if self.confirmed.is_confirmed(entry.msg.reliable_id) {
                continue;
            }
            let age = now.saturating_duration_since(entry.sent_at);
            if age >= resend_after && writer.write_message(&entry.msg) {
                self.bundles.record(ack, entry.msg.reliable_id);
                entry.sent_at = now;
                resends += 1;
                tracing::debug!(
                    conn = %self.id,
                    reliable_id = entry.msg.reliable_id,
                    age_ms = age.as_millis() as u64,
                    "resending reliable"
                );
            }
            self.sent_reliables.push_back(entry);
        }
        self.stats.reliable_resends += resends;

        // New reliables.
        while self.reliable_window_open() {
            let Some(front) = self.unsent_reliables.front_mut() else {
                break;
            };
            front.reliable_id = self.next_reliable_id;
            if !writer.write_message(front) {
                break;
            }
            let Some(msg) = self.unsent_reliables.pop_front() else {
                break;
            };
            self.bundles.record(ack, msg.reliable_id);
            self.next_reliable_id = self.next_reliable_id.wrapping_add(1);
            self.sent_reliables.push_back(SentReliable { msg, sent_at: now });
        }

        // Unreliables: whatever fits, the rest is dropped.
        let mut dropped = 0usize;
        for msg in self.unreliables.drain(..) {
            if !writer.write_message(&msg) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(conn = %self.id, dropped, "unreliables did not fit");
        }

        let bytes = writer.finish();
        self.last_sent = now;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes.len() as u64;
        bytes
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    /// Account for a datagram from this peer: record its ack and confirm
    /// every reliable id the peer's ack window covers.
    pub fn mark_packet_received(&mut self, header: &PacketHeader, len: usize, now: Instant) {
        self.received_acks.record(header.ack);

        for ack in header.ack_window().acked() {
            if let Some(bundle) = self.bundles.get(ack) {
                for &id in bundle.reliable_ids() {
                    self.confirmed.mark_confirmed(id);
                }
            }
        }

        self.last_received = now;
        self.stats.packets_received += 1;
        self.stats.bytes_received += len as u64;

        if matches!(
            self.state,
            ConnectionState::Unconfirmed | ConnectionState::Bad
        ) {
            tracing::debug!(conn = %self.id, addr = %self.addr, "connection confirmed");
            self.state = ConnectionState::Confirmed;
        }
    }

    /// Confirm a single reliable id. Returns `true` if this was news.
    pub fn mark_reliable_confirmed(&mut self, id: u16) -> bool {
        self.confirmed.mark_confirmed(id)
    }

    pub fn has_received_reliable(&self, id: u16) -> bool {
        self.received_reliables.has_received(id)
    }

    /// Record a reliable id processed outside [`process_message`](Self::process_message).
    pub fn record_reliable(&mut self, id: u16) {
        self.received_reliables.record(id);
    }

    /// Run one received message through dedup and resequencing. Returns the
    /// messages now ready for dispatch, in order.
    ///
    /// `msg` must already carry its registered options.
    pub fn process_message(&mut self, msg: WireMessage) -> Vec<WireMessage> {
        if msg.is_reliable() {
            if self.received_reliables.has_received(msg.reliable_id) {
                self.stats.duplicates_dropped += 1;
                tracing::debug!(
                    conn = %self.id,
                    reliable_id = msg.reliable_id,
                    "dropping duplicate reliable"
                );
                return Vec::new();
            }
            self.received_reliables.record(msg.reliable_id);
        }

        if !msg.is_in_order() {
            return vec![msg];
        }

        let sequence_id = msg.sequence_id;
        match self.resequencer.accept(msg) {
            Sequenced::Ready(ready) => ready,
            Sequenced::Buffered => {
                self.stats.out_of_order_buffered += 1;
                tracing::debug!(
                    conn = %self.id,
                    sequence_id,
                    expected = self.resequencer.next_expected(),
                    "buffering out-of-order message"
                );
                Vec::new()
            }
            Sequenced::Duplicate | Sequenced::Stale => {
                self.stats.stale_dropped += 1;
                Vec::new()
            }
        }
    }

    /// Header for a standalone datagram outside the tick cadence. Carries
    /// no ack of its own.
    pub fn direct_header(&self, sender: u8) -> PacketHeader {
        PacketHeader::new(sender, INVALID_ACK, self.received_acks)
    }
}
