//! # Session
//!
//! Top-level orchestrator: the connection table, the message registry, the
//! host/join handshake and the tick loop.
//!
//! ```text
//!   INVALID ──start──▶ DISCONNECTED ──host──▶ HOSTING ──▶ CONNECTED
//!                          ▲   │                              │
//!                          │   └──join──▶ JOINING ──accept────┘
//!                          │                 │ deny / timeout │
//!                          └─────────────────┴──── leave ─────┘
//! ```
//!
//! Everything happens inside [`Session::update`], called once per frame:
//! drain inbound datagrams, tick every connection when the tick interval
//! has elapsed, sweep for timeouts, then check the pending join.
//!
//! Table slot 0 is always the host. While joining, the host lives in a
//! placeholder outside the table until JOIN_ACCEPT assigns real indices.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use quanta::{Clock, Instant};

use crate::config::SessionConfig;
use crate::connection::{
    ConnectionId, ConnectionState, Guid, PeerConnection, RttTracker, MAX_CONNECTIONS,
};
use crate::error::{ErrorCode, SessionError};
use crate::message::{
    core_type, Handler, JoinAccept, JoinDeny, JoinRequest, MessageContext, MessageDefinition,
    MessageRegistry, Outgoing, Ping, Pong,
};
use crate::seq::AckWindow;
use crate::sim::{SimulatedChannel, SimulationHandle};
use crate::stats::{ConnectionSnapshot, SessionStats};
use crate::transport::{Transport, UdpTransport};
use crate::wire::{
    ControlFlags, MessageOptions, PacketHeader, WireMessage, WirePacket, INVALID_ACK,
    INVALID_CONNECTION_INDEX, MAX_PAYLOAD_LEN,
};

/// Slot the host always occupies.
pub const HOST_INDEX: ConnectionId = ConnectionId(0);

// ─── State & Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started; no transport bound.
    Invalid,
    Disconnected,
    Hosting,
    Joining,
    Connected,
}

/// Lifecycle notifications, drained with [`Session::drain_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { local_addr: SocketAddr },
    Hosting { me: ConnectionId },
    Joined { me: ConnectionId, host: ConnectionId },
    JoinFailed(ErrorCode),
    PeerConnected(ConnectionId),
    PeerDisconnected(ConnectionId),
    ConnectionBad(ConnectionId),
    Pong { from: SocketAddr, rtt: Duration },
    /// We left the party: every connection is gone.
    Disconnected,
}

/// Which connection an inbound datagram belongs to.
#[derive(Debug, Clone, Copy)]
enum Route {
    Table(ConnectionId),
    PendingHost,
}

// ─── Session ────────────────────────────────────────────────────────────────

pub struct Session {
    config: SessionConfig,
    clock: Clock,
    epoch: Instant,
    state: SessionState,
    transport: Option<Box<dyn Transport>>,
    local_addr: Option<SocketAddr>,
    simulation: Option<SimulationHandle>,
    registry: MessageRegistry,

    connections: [Option<PeerConnection>; MAX_CONNECTIONS],
    me: Option<ConnectionId>,
    host: Option<ConnectionId>,
    pending_host: Option<PeerConnection>,
    pending_me: Option<PeerConnection>,
    join_started: Option<Instant>,
    accepting_joins: bool,

    tick_accumulator: Duration,
    last_error: Option<ErrorCode>,
    events: Vec<SessionEvent>,
    outbox: Vec<Outgoing>,
    /// Pings to addresses without a connection.
    pings: RttTracker,
    connectionless_packets: u64,
    unknown_messages: u64,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self::new_with_clock(config, Clock::new())
    }

    /// Build a session on an explicit clock (`Clock::mock()` in tests).
    pub fn new_with_clock(config: SessionConfig, clock: Clock) -> Self {
        let epoch = clock.now();
        Session {
            config,
            clock,
            epoch,
            state: SessionState::Invalid,
            transport: None,
            local_addr: None,
            simulation: None,
            registry: MessageRegistry::with_core_types(),
            connections: std::array::from_fn(|_| None),
            me: None,
            host: None,
            pending_host: None,
            pending_me: None,
            join_started: None,
            accepting_joins: true,
            tick_accumulator: Duration::ZERO,
            last_error: None,
            events: Vec::new(),
            outbox: Vec::new(),
            pings: RttTracker::new(),
            connectionless_packets: 0,
            unknown_messages: 0,
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn me(&self) -> Option<ConnectionId> {
        self.me
    }

    pub fn host_id(&self) -> Option<ConnectionId> {
        self.host
    }

    pub fn is_host(&self) -> bool {
        self.me.is_some() && self.me == self.host
    }

    /// Outcome of the last handshake or teardown, if it was not a success.
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    pub fn is_accepting_joins(&self) -> bool {
        self.accepting_joins
    }

    /// Open or close hosting to new joiners.
    pub fn set_accepting_joins(&mut self, accepting: bool) {
        self.accepting_joins = accepting;
    }

    /// Loss/latency controls when the simulated channel is active.
    pub fn simulation(&self) -> Option<SimulationHandle> {
        self.simulation.clone()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&PeerConnection> {
        self.connections.get(id.index()).and_then(Option::as_ref)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut PeerConnection> {
        self.connections.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Occupied table slots, ours included.
    pub fn connections(&self) -> impl Iterator<Item = &PeerConnection> {
        self.connections.iter().flatten()
    }

    pub fn connection_count(&self) -> usize {
        self.connections().count()
    }

    pub fn find_connection(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.connections()
            .find(|c| !c.is_local() && c.addr() == addr)
            .map(PeerConnection::id)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats {
            connectionless_packets: self.connectionless_packets,
            unknown_messages: self.unknown_messages,
            ..Default::default()
        };
        for conn in self.connections() {
            stats.totals.accumulate(conn.stats());
            stats.connections.push(ConnectionSnapshot {
                id: conn.id(),
                name: conn.guid().name(),
                state: conn.state(),
                srtt_us: conn.rtt().srtt_us() as u64,
                reliables_outstanding: conn.reliables_outstanding(),
                stats: conn.stats().clone(),
            });
        }
        stats
    }

    fn my_index(&self) -> u8 {
        self.me.map_or(INVALID_CONNECTION_INDEX, |id| id.0)
    }

    fn timestamp_us(&self) -> u32 {
        self.clock.now().saturating_duration_since(self.epoch).as_micros() as u32
    }

    fn invalid_state(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state,
        }
    }

    // ─── Registration ───────────────────────────────────────────────────

    /// Register an application message type. Must happen before
    /// [`start`](Self::start).
    ///
    /// # Panics
    ///
    /// If `message_type` is already registered (core types included).
    pub fn register_message_type<F>(
        &mut self,
        message_type: u8,
        name: impl Into<Cow<'static, str>>,
        callback: F,
        options: MessageOptions,
        control: ControlFlags,
    ) -> Result<(), SessionError>
    where
        F: FnMut(&mut MessageContext<'_>, &WireMessage) + Send + 'static,
    {
        if self.state != SessionState::Invalid {
            return Err(SessionError::AlreadyStarted);
        }
        self.registry.register(MessageDefinition {
            message_type,
            name: name.into(),
            options,
            control,
            handler: Handler::User(Box::new(callback)),
        });
        Ok(())
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    /// Build a message of a registered type with its registered flags.
    pub fn message(
        &self,
        message_type: u8,
        payload: impl Into<Bytes>,
    ) -> Result<WireMessage, SessionError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(SessionError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        let def = self
            .registry
            .get(message_type)
            .ok_or(SessionError::UnknownMessageType(message_type))?;
        Ok(def.message(payload))
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Bind a UDP socket at the configured address.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Invalid {
            return Err(self.invalid_state("start"));
        }
        match UdpTransport::bind(self.config.bind) {
            Ok(udp) => self.start_with(Box::new(udp)),
            Err(e) => {
                tracing::warn!(bind = %self.config.bind, error = %e, "socket bind failed");
                self.last_error = Some(ErrorCode::SocketBindFailed);
                Err(SessionError::Bind(e))
            }
        }
    }

    /// Start on a caller-supplied transport.
    pub fn start_with(&mut self, transport: Box<dyn Transport>) -> Result<(), SessionError> {
        if self.state != SessionState::Invalid {
            return Err(self.invalid_state("start"));
        }
        let local_addr = transport.local_addr()?;
        let transport: Box<dyn Transport> = match &self.config.simulation {
            Some(sim) => {
                let channel = SimulatedChannel::from_config(transport, sim, self.clock.clone());
                self.simulation = Some(channel.handle());
                tracing::info!(
                    loss = sim.loss,
                    min_latency_ms = sim.min_latency.as_millis() as u64,
                    max_latency_ms = sim.max_latency.as_millis() as u64,
                    "simulated channel enabled"
                );
                Box::new(channel)
            }
            None => transport,
        };

        self.transport = Some(transport);
        self.local_addr = Some(local_addr);
        self.state = SessionState::Disconnected;
        self.last_error = None;
        self.events.push(SessionEvent::Started { local_addr });
        tracing::info!(%local_addr, tick_rate_hz = self.config.tick_rate_hz, "session started");
        Ok(())
    }

    /// Leave any party and release the transport.
    pub fn stop(&mut self) {
        if self.state == SessionState::Invalid {
            return;
        }
        if matches!(self.state, SessionState::Connected | SessionState::Joining) {
            if let Err(e) = self.leave() {
                tracing::debug!(error = %e, "leave during stop failed");
            }
        }
        self.transport = None;
        self.local_addr = None;
        self.simulation = None;
        self.tick_accumulator = Duration::ZERO;
        self.state = SessionState::Invalid;
        tracing::info!("session stopped");
    }

    /// Host a party as `name`. Reaches `Connected` immediately.
    pub fn host(&mut self, name: &str) -> Result<ConnectionId, SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(self.invalid_state("host"));
        }
        let local_addr = self.local_addr.ok_or_else(|| self.invalid_state("host"))?;

        self.state = SessionState::Hosting;
        let id = HOST_INDEX;
        let me = PeerConnection::local(id, local_addr, Guid::from_name(name), self.clock.now());
        self.connections[id.index()] = Some(me);
        self.me = Some(id);
        self.host = Some(id);
        self.accepting_joins = true;
        self.last_error = None;
        self.events.push(SessionEvent::Hosting { me: id });

        self.state = SessionState::Connected;
        tracing::info!(name, %local_addr, "hosting");
        Ok(id)
    }

    /// Ask the host at `host_addr` to let us in as `name`.
    pub fn join(&mut self, name: &str, host_addr: SocketAddr) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(self.invalid_state("join"));
        }
        let local_addr = self.local_addr.ok_or_else(|| self.invalid_state("join"))?;
        let now = self.clock.now();
        let guid = Guid::from_name(name);

        let request = self.message(core_type::JOIN_REQUEST, JoinRequest { guid }.encode())?;
        let mut host = PeerConnection::new(
            HOST_INDEX,
            host_addr,
            Guid::from_name(""),
            ConnectionState::Unconfirmed,
            now,
        );
        host.send_message(request);

        self.pending_host = Some(host);
        self.pending_me = Some(PeerConnection::local(ConnectionId::INVALID, local_addr, guid, now));
        self.join_started = Some(now);
        self.last_error = None;
        self.state = SessionState::Joining;
        tracing::info!(name, %host_addr, "joining");
        Ok(())
    }

    /// Leave the party (or abandon a pending join).
    ///
    /// A host sends QUIT to every peer; a peer sends CONNECTION_LEAVE.
    pub fn leave(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Joining => {
                self.cancel_join();
                self.events.push(SessionEvent::Disconnected);
                tracing::info!("join abandoned");
                Ok(())
            }
            SessionState::Connected => {
                let me = self.me.ok_or_else(|| self.invalid_state("leave"))?;
                let farewell = if self.is_host() {
                    core_type::QUIT
                } else {
                    core_type::CONNECTION_LEAVE
                };
                let peers: Vec<SocketAddr> = self
                    .connections()
                    .filter(|c| !c.is_local())
                    .map(PeerConnection::addr)
                    .collect();
                for addr in peers {
                    if let Err(e) = self.send_direct(addr, farewell, Bytes::new()) {
                        tracing::warn!(%addr, error = %e, "farewell not sent");
                    }
                }
                self.disconnect(me);
                Ok(())
            }
            _ => Err(self.invalid_state("leave")),
        }
    }

    /// Remove `id` from the party (host only).
    pub fn kick(&mut self, id: ConnectionId) -> Result<(), SessionError> {
        if self.state != SessionState::Connected || !self.is_host() {
            return Err(self.invalid_state("kick"));
        }
        let addr = match self.connection(id) {
            Some(conn) if !conn.is_local() => conn.addr(),
            _ => return Err(SessionError::NoSuchConnection(id)),
        };
        self.send_direct(addr, core_type::KICK, Bytes::new())?;
        tracing::info!(conn = %id, %addr, "kicked");
        self.disconnect(id);
        Ok(())
    }

    /// Tear down a connection.
    ///
    /// Disconnecting the host (when it is not us) disconnects us instead.
    /// Disconnecting us removes every other peer, then us, then the host.
    ///
    /// # Panics
    ///
    /// If `id` is not in the table.
    pub fn disconnect(&mut self, id: ConnectionId) {
        assert!(
            self.connection(id).is_some(),
            "disconnect of {id}: no such connection"
        );

        if Some(id) == self.host && self.host != self.me {
            if let Some(me) = self.me {
                return self.disconnect(me);
            }
        }

        if Some(id) != self.me {
            self.remove_connection(id);
            return;
        }

        let host = self.host;
        let peers: Vec<ConnectionId> = self
            .connections()
            .map(PeerConnection::id)
            .filter(|&c| c != id && Some(c) != host)
            .collect();
        for peer in peers {
            self.remove_connection(peer);
        }
        self.remove_connection(id);
        if let Some(host) = host.filter(|&h| h != id) {
            self.remove_connection(host);
        }

        self.me = None;
        self.host = None;
        self.state = SessionState::Disconnected;
        self.events.push(SessionEvent::Disconnected);
        tracing::info!(reason = ?self.last_error, "disconnected");
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections[id.index()].take() else {
            return;
        };
        if !conn.is_local() {
            tracing::info!(conn = %id, addr = %conn.addr(), name = %conn.guid(), "peer disconnected");
            self.events.push(SessionEvent::PeerDisconnected(id));
        }
    }

    fn cancel_join(&mut self) {
        self.pending_host = None;
        self.pending_me = None;
        self.join_started = None;
        self.state = SessionState::Disconnected;
    }

    // ─── Sending ────────────────────────────────────────────────────────

    /// Queue a message on connection `id` for the next tick.
    pub fn send(
        &mut self,
        id: ConnectionId,
        message_type: u8,
        payload: impl Into<Bytes>,
    ) -> Result<(), SessionError> {
        let msg = self.message(message_type, payload)?;
        self.connection_mut(id)
            .ok_or(SessionError::NoSuchConnection(id))?
            .send_message(msg);
        Ok(())
    }

    /// Queue a message on every connection except ours. Returns how many
    /// connections it was queued on.
    pub fn broadcast(
        &mut self,
        message_type: u8,
        payload: impl Into<Bytes>,
    ) -> Result<usize, SessionError> {
        let msg = self.message(message_type, payload)?;
        let mut queued = 0;
        for conn in self.connections.iter_mut().flatten() {
            if conn.is_local() {
                continue;
            }
            conn.send_message(msg.clone());
            queued += 1;
        }
        Ok(queued)
    }

    /// Send a message right now as its own datagram, bypassing reliability.
    ///
    /// The receiver delivers it once on arrival whatever the type's
    /// options: no resend, dedup or ordering.
    pub fn send_direct(
        &mut self,
        addr: SocketAddr,
        message_type: u8,
        payload: impl Into<Bytes>,
    ) -> Result<(), SessionError> {
        let msg = self.message(message_type, payload)?;
        let sender = self.my_index();
        let route = self.find_connection(addr);
        let header = match route.and_then(|id| self.connection(id)) {
            Some(conn) => conn.direct_header(sender),
            None => PacketHeader::new(sender, INVALID_ACK, AckWindow::new()),
        };
        let bytes = WirePacket::encode(header, std::slice::from_ref(&msg)).ok_or(
            SessionError::PayloadTooLarge {
                len: msg.payload.len(),
                max: MAX_PAYLOAD_LEN,
            },
        )?;

        let transport = self
            .transport
            .as_mut()
            .ok_or(SessionError::InvalidState {
                operation: "send_direct",
                state: self.state,
            })?;
        transport.send_to(addr, &bytes)?;

        if let Some(conn) = route.and_then(|id| self.connection_mut(id)) {
            let stats = conn.stats_mut();
            stats.packets_sent += 1;
            stats.bytes_sent += bytes.len() as u64;
        }
        tracing::trace!(%addr, message_type, len = bytes.len(), "direct send");
        Ok(())
    }

    /// Measure round-trip time to `addr`. The result arrives as
    /// [`SessionEvent::Pong`].
    pub fn ping(&mut self, addr: SocketAddr) -> Result<(), SessionError> {
        let now = self.clock.now();
        let timestamp = self.timestamp_us();
        let ping = match self.find_connection(addr).and_then(|id| self.connection_mut(id)) {
            Some(conn) => conn.rtt_mut().make_ping(now, timestamp),
            None => self.pings.make_ping(now, timestamp),
        };
        self.send_direct(addr, core_type::PING, ping.encode())
    }

    fn flush_outbox(&mut self) {
        for out in std::mem::take(&mut self.outbox) {
            let result = match out {
                Outgoing::Connection(id, ty, payload) => self.send(id, ty, payload),
                Outgoing::Direct(addr, ty, payload) => self.send_direct(addr, ty, payload),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "message queued by handler not sent");
            }
        }
    }

    fn send_datagram(&mut self, addr: SocketAddr, bytes: &[u8]) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.send_to(addr, bytes) {
            tracing::warn!(%addr, error = %e, "send failed");
        }
    }

    // ─── Update Loop ────────────────────────────────────────────────────

    /// Advance the session by `dt`.
    pub fn update(&mut self, dt: Duration) {
        if self.state == SessionState::Invalid {
            return;
        }
        self.receive_all();

        let interval = self.config.tick_interval();
        self.tick_accumulator += dt;
        if self.tick_accumulator >= interval {
            self.tick_accumulator = (self.tick_accumulator - interval).min(interval);
            self.tick();
        }

        if self.config.timeouts_enabled {
            self.check_for_timeouts();
        }
        self.check_for_join_response();
    }

    fn receive_all(&mut self) {
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            match transport.recv_from() {
                Ok(Some((from, data))) => self.handle_datagram(from, data),
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "receive failed");
                    return;
                }
            }
        }
    }

    /// Send one packet on every remote connection and deliver loopback
    /// messages queued on ours.
    fn tick(&mut self) {
        let now = self.clock.now();
        let sender = self.my_index();
        let resend_after = self.config.resend_threshold();

        let mut datagrams = Vec::with_capacity(MAX_CONNECTIONS);
        let mut loopback = Vec::new();
        for conn in self.connections.iter_mut().flatten() {
            if conn.is_local() {
                loopback.extend(conn.take_loopback());
            } else {
                datagrams.push((conn.addr(), conn.build_packet(now, sender, resend_after)));
            }
        }
        if let Some(host) = self.pending_host.as_mut() {
            datagrams.push((host.addr(), host.build_packet(now, sender, resend_after)));
        }

        for (addr, bytes) in datagrams {
            self.send_datagram(addr, &bytes);
        }

        if let (Some(me), Some(addr)) = (self.me, self.local_addr) {
            for msg in loopback {
                self.dispatch(addr, Some(me), msg);
            }
        }
    }

    fn check_for_timeouts(&mut self) {
        let now = self.clock.now();
        let bad_after = self.config.bad_connection_threshold;
        let timeout = self.config.connection_timeout;

        let mut timed_out = Vec::new();
        for conn in self.connections.iter_mut().flatten() {
            if conn.is_local() {
                continue;
            }
            let silent = now.saturating_duration_since(conn.last_received());
            if silent >= timeout {
                timed_out.push(conn.id());
            } else if silent >= bad_after && conn.mark_bad() {
                tracing::warn!(
                    conn = %conn.id(),
                    silent_ms = silent.as_millis() as u64,
                    "connection bad"
                );
                self.events.push(SessionEvent::ConnectionBad(conn.id()));
            }
        }

        for id in timed_out {
            // An earlier teardown may already have removed it.
            if self.connection(id).is_some() {
                tracing::warn!(conn = %id, "connection timed out");
                if Some(id) == self.host && self.host != self.me {
                    self.last_error = Some(ErrorCode::ConnectionTimeout);
                }
                self.disconnect(id);
            }
        }
    }

    fn check_for_join_response(&mut self) {
        if self.state != SessionState::Joining {
            return;
        }
        let Some(started) = self.join_started else {
            return;
        };
        if self.clock.now().saturating_duration_since(started) < self.config.join_timeout {
            return;
        }
        tracing::warn!("join timed out");
        self.fail_join(ErrorCode::JoinTimeout);
    }

    fn fail_join(&mut self, code: ErrorCode) {
        self.last_error = Some(code);
        self.cancel_join();
        self.events.push(SessionEvent::JoinFailed(code));
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    fn route(&self, sender: u8, from: SocketAddr) -> Option<Route> {
        if sender == INVALID_CONNECTION_INDEX {
            return None;
        }
        if let Some(conn) = self.connections.get(sender as usize).and_then(Option::as_ref) {
            if conn.addr() == from && !conn.is_local() {
                return Some(Route::Table(conn.id()));
            }
        }
        if self.pending_host.as_ref().is_some_and(|h| h.addr() == from) {
            return Some(Route::PendingHost);
        }
        self.find_connection(from).map(Route::Table)
    }

    fn route_mut(&mut self, route: Route) -> Option<&mut PeerConnection> {
        match route {
            Route::Table(id) => self.connection_mut(id),
            Route::PendingHost => self.pending_host.as_mut(),
        }
    }

    /// Attach registered flags to a received message.
    fn stamp(&mut self, mut msg: WireMessage) -> Option<WireMessage> {
        match self.registry.get(msg.message_type) {
            Some(def) => {
                msg.options = def.options;
                msg.control = def.control;
                Some(msg)
            }
            None => {
                self.unknown_messages += 1;
                tracing::warn!(message_type = msg.message_type, "unknown message type");
                None
            }
        }
    }

    fn handle_datagram(&mut self, from: SocketAddr, mut data: Bytes) {
        let len = data.len();
        let Some(packet) = WirePacket::decode(&mut data) else {
            tracing::debug!(%from, len, "runt datagram");
            return;
        };
        let now = self.clock.now();
        let header = packet.header;
        let messages: Vec<WireMessage> = packet
            .messages
            .into_iter()
            .filter_map(|m| self.stamp(m))
            .collect();

        // Direct datagrams carry no ack, so their ids were never assigned
        // for this link: skip dedup and resequencing.
        let direct = header.ack == INVALID_ACK;

        if let Some(route) = self.route(header.sender, from) {
            // Until JOIN_ACCEPT lands only connectionless traffic is taken
            // from the host. A packet holding an early reliable goes unacked
            // so the host resends it once we are connected, and a packet
            // with nothing connectionless (possibly from a link the host
            // is replacing) is not acked at all.
            let (messages, early): (Vec<_>, Vec<_>) = match route {
                Route::PendingHost => messages
                    .into_iter()
                    .partition(|m| m.control.is_connectionless()),
                Route::Table(_) => (messages, Vec::new()),
            };
            for msg in &early {
                tracing::debug!(
                    %from,
                    message = self.registry.name(msg.message_type),
                    "dropping message sent before join completed"
                );
            }
            if matches!(route, Route::PendingHost) && messages.is_empty() {
                return;
            }
            let mut header = header;
            if early.iter().any(WireMessage::is_reliable) {
                header.ack = INVALID_ACK;
            }

            let Some(conn) = self.route_mut(route) else {
                return;
            };
            conn.mark_packet_received(&header, len, now);
            conn.stats_mut().malformed_messages += packet.rejected as u64;
            if matches!(route, Route::Table(id) if id.0 == header.sender) {
                conn.mark_addressed();
            }
            let mut ready = Vec::new();
            for msg in messages {
                if direct {
                    ready.push(msg);
                } else {
                    ready.extend(conn.process_message(msg));
                }
            }
            let sender = match route {
                Route::Table(id) => Some(id),
                Route::PendingHost => None,
            };
            for msg in ready {
                self.dispatch(from, sender, msg);
            }
            return;
        }

        self.connectionless_packets += 1;
        let mut delivered = Vec::new();
        let mut held = Vec::new();
        for msg in messages {
            if msg.control.is_connectionless() {
                if msg.is_reliable() {
                    delivered.push(msg.reliable_id);
                }
                self.dispatch(from, None, msg);
            } else {
                held.push(msg);
            }
        }

        // A JOIN_REQUEST may just have created a connection for `from`:
        // ack its packet so the joiner stops resending, and deliver the
        // rest of the packet through the new connection.
        let Some(id) = self.find_connection(from) else {
            for msg in &held {
                tracing::debug!(
                    %from,
                    message = self.registry.name(msg.message_type),
                    "dropping message with no connection"
                );
            }
            return;
        };
        let Some(conn) = self.connection_mut(id) else {
            return;
        };
        conn.mark_packet_received(&header, len, now);
        let mut ready = Vec::new();
        if !direct {
            for reliable_id in delivered {
                conn.record_reliable(reliable_id);
            }
        }
        for msg in held {
            if direct {
                ready.push(msg);
            } else {
                ready.extend(conn.process_message(msg));
            }
        }
        for msg in ready {
            self.dispatch(from, Some(id), msg);
        }
    }

    fn dispatch(&mut self, from: SocketAddr, sender: Option<ConnectionId>, msg: WireMessage) {
        if let Some(conn) = sender.and_then(|id| self.connection_mut(id)) {
            conn.stats_mut().messages_delivered += 1;
        }
        let Some(def) = self.registry.get_mut(msg.message_type) else {
            return;
        };
        match &mut def.handler {
            Handler::Core => self.handle_core(from, sender, &msg),
            Handler::User(callback) => {
                let mut ctx = MessageContext::new(from, sender, &mut self.outbox);
                callback(&mut ctx, &msg);
                self.flush_outbox();
            }
        }
    }

    // ─── Core Handlers ──────────────────────────────────────────────────

    fn handle_core(&mut self, from: SocketAddr, sender: Option<ConnectionId>, msg: &WireMessage) {
        match msg.message_type {
            core_type::PING => self.handle_ping(from, msg),
            core_type::PONG => self.handle_pong(from, msg),
            core_type::JOIN_REQUEST => self.handle_join_request(from, msg),
            core_type::JOIN_ACCEPT => self.handle_join_accept(from, msg),
            core_type::JOIN_DENY => self.handle_join_deny(from, msg),
            core_type::CONNECTION_LEAVE => {
                if let Some(id) = sender.filter(|&id| self.connection(id).is_some()) {
                    tracing::info!(conn = %id, "peer left");
                    self.disconnect(id);
                }
            }
            core_type::KICK => self.handle_host_farewell(sender, ErrorCode::Kicked),
            core_type::QUIT => self.handle_host_farewell(sender, ErrorCode::HostQuit),
            // HEARTBEAT, INORDER_HEARTBEAT, ACK: arrival alone is the point.
            _ => {}
        }
    }

    fn handle_ping(&mut self, from: SocketAddr, msg: &WireMessage) {
        let Some(ping) = Ping::decode(&mut msg.payload.clone()) else {
            tracing::warn!(%from, "malformed PING");
            return;
        };
        let pong = Pong::answer(&ping, self.timestamp_us());
        if let Err(e) = self.send_direct(from, core_type::PONG, pong.encode()) {
            tracing::warn!(%from, error = %e, "PONG not sent");
        }
    }

    fn handle_pong(&mut self, from: SocketAddr, msg: &WireMessage) {
        let Some(pong) = Pong::decode(&mut msg.payload.clone()) else {
            tracing::warn!(%from, "malformed PONG");
            return;
        };
        let now = self.clock.now();
        let via_connection = self
            .find_connection(from)
            .and_then(|id| self.connection_mut(id))
            .and_then(|conn| conn.rtt_mut().handle_pong(now, &pong));
        let rtt = via_connection.or_else(|| self.pings.handle_pong(now, &pong));
        if let Some(rtt) = rtt {
            tracing::debug!(%from, rtt_us = rtt.as_micros() as u64, "pong");
            self.events.push(SessionEvent::Pong { from, rtt });
        }
    }

    fn deny_join(&mut self, from: SocketAddr, reason: ErrorCode) {
        tracing::info!(%from, %reason, "denying join");
        if let Err(e) = self.send_direct(from, core_type::JOIN_DENY, JoinDeny { reason }.encode()) {
            tracing::warn!(%from, error = %e, "JOIN_DENY not sent");
        }
    }

    fn handle_join_request(&mut self, from: SocketAddr, msg: &WireMessage) {
        let Some(request) = JoinRequest::decode(&mut msg.payload.clone()) else {
            tracing::warn!(%from, "malformed JOIN_REQUEST");
            return;
        };
        if self.state != SessionState::Connected || !self.is_host() {
            return self.deny_join(from, ErrorCode::JoinDeniedNotHost);
        }

        let owner = self
            .connections()
            .find(|c| c.guid() == &request.guid)
            .map(|c| (c.id(), c.addr(), c.is_local()));
        let mut owner = owner;
        if let Some((id, addr, false)) = owner {
            if addr == from {
                let rejoined = self.connection(id).is_some_and(PeerConnection::is_addressed);
                if !rejoined {
                    tracing::debug!(conn = %id, "repeated JOIN_REQUEST, accepting again");
                    return self.send_join_accept(id);
                }
                // The peer restarted without a farewell reaching us; its old
                // link state would reject everything it sends now.
                tracing::info!(conn = %id, %from, "peer rejoined, replacing its connection");
                self.disconnect(id);
                owner = None;
            }
        }

        if !self.accepting_joins {
            return self.deny_join(from, ErrorCode::JoinDeniedClosed);
        }
        if owner.is_some() {
            return self.deny_join(from, ErrorCode::JoinDeniedGuidTaken);
        }
        if let Some(stale) = self.find_connection(from) {
            tracing::info!(conn = %stale, %from, "join from a connected address, replacing");
            self.disconnect(stale);
        }
        let Some(slot) = self.connections.iter().position(Option::is_none) else {
            return self.deny_join(from, ErrorCode::JoinDeniedFull);
        };

        let id = ConnectionId(slot as u8);
        let conn = PeerConnection::new(
            id,
            from,
            request.guid,
            ConnectionState::Unconfirmed,
            self.clock.now(),
        );
        self.connections[slot] = Some(conn);
        tracing::info!(conn = %id, %from, name = %request.guid, "peer joined");
        self.events.push(SessionEvent::PeerConnected(id));
        self.send_join_accept(id);
    }

    fn send_join_accept(&mut self, id: ConnectionId) {
        let (Some(me), Some(peer)) = (
            self.me.and_then(|me| self.connection(me)),
            self.connection(id),
        ) else {
            return;
        };
        let accept = JoinAccept {
            host_index: me.id().0,
            host_guid: *me.guid(),
            peer_index: id.0,
            peer_guid: *peer.guid(),
        };
        if let Err(e) = self.send(id, core_type::JOIN_ACCEPT, accept.encode()) {
            tracing::warn!(conn = %id, error = %e, "JOIN_ACCEPT not queued");
        }
    }

    fn handle_join_accept(&mut self, from: SocketAddr, msg: &WireMessage) {
        let expected = self.pending_host.as_ref().map(PeerConnection::addr);
        if self.state != SessionState::Joining || expected != Some(from) {
            tracing::debug!(%from, state = ?self.state, "ignoring JOIN_ACCEPT");
            return;
        }
        let Some(accept) = JoinAccept::decode(&mut msg.payload.clone()) else {
            tracing::warn!(%from, "malformed JOIN_ACCEPT");
            return;
        };
        let host_id = ConnectionId(accept.host_index);
        let me_id = ConnectionId(accept.peer_index);
        if !host_id.is_valid() || !me_id.is_valid() || host_id == me_id {
            tracing::warn!(%from, host = %host_id, me = %me_id, "JOIN_ACCEPT with bad indices");
            return;
        }
        let (Some(mut host), Some(mut me)) = (self.pending_host.take(), self.pending_me.take())
        else {
            return;
        };
        assert!(
            self.connections.iter().all(Option::is_none),
            "joined while connections are still present"
        );

        host.assign(host_id, accept.host_guid);
        me.assign(me_id, accept.peer_guid);
        self.connections[host_id.index()] = Some(host);
        self.connections[me_id.index()] = Some(me);
        self.host = Some(host_id);
        self.me = Some(me_id);
        self.join_started = None;
        self.state = SessionState::Connected;
        self.events.push(SessionEvent::Joined {
            me: me_id,
            host: host_id,
        });
        tracing::info!(me = %me_id, host = %accept.host_guid, %from, "joined");
    }

    fn handle_join_deny(&mut self, from: SocketAddr, msg: &WireMessage) {
        let expected = self.pending_host.as_ref().map(PeerConnection::addr);
        if self.state != SessionState::Joining || expected != Some(from) {
            tracing::debug!(%from, "ignoring JOIN_DENY");
            return;
        }
        let Some(deny) = JoinDeny::decode(&mut msg.payload.clone()) else {
            tracing::warn!(%from, "malformed JOIN_DENY");
            return;
        };
        tracing::info!(%from, reason = %deny.reason, "join denied");
        self.fail_join(deny.reason);
    }

    /// KICK or QUIT: only honoured from the host.
    fn handle_host_farewell(&mut self, sender: Option<ConnectionId>, reason: ErrorCode) {
        if sender.is_none() || sender != self.host || self.is_host() {
            return;
        }
        let Some(me) = self.me else {
            return;
        };
        tracing::info!(%reason, "host ended our membership");
        self.last_error = Some(reason);
        self.disconnect(me);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
