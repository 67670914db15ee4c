//! # Message Registry
//!
//! Every message type is registered once, before the session starts, with
//! its delivery options, control flags and a handler. Dispatch is by the
//! type byte carried on the wire.
//!
//! Types `0..CORE_MESSAGE_COUNT` are reserved for the session's own
//! protocol (ping, handshake, teardown) and are registered by the session
//! itself. Their payload codecs live here as well.

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::connection::{ConnectionId, Guid, GUID_LEN};
use crate::error::ErrorCode;
use crate::wire::{ControlFlags, MessageOptions, WireMessage};

// ─── Core Message Types ─────────────────────────────────────────────────────

/// Reserved type ids of the session protocol.
pub mod core_type {
    pub const PING: u8 = 0;
    pub const PONG: u8 = 1;
    pub const HEARTBEAT: u8 = 2;
    pub const INORDER_HEARTBEAT: u8 = 3;
    pub const ACK: u8 = 4;
    pub const JOIN_REQUEST: u8 = 5;
    pub const JOIN_DENY: u8 = 6;
    pub const JOIN_ACCEPT: u8 = 7;
    pub const CONNECTION_LEAVE: u8 = 8;
    pub const KICK: u8 = 9;
    pub const QUIT: u8 = 10;
}

/// Number of reserved core type ids; application types start here.
pub const CORE_MESSAGE_COUNT: u8 = 11;

/// Number of registry slots, one per possible type byte.
pub const MESSAGE_TYPE_SLOTS: usize = 256;

// ─── Dispatch ───────────────────────────────────────────────────────────────

/// Where a message queued from inside a callback should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Through an established connection (reliability applies).
    Connection(ConnectionId, u8, Bytes),
    /// As a standalone datagram to a raw address.
    Direct(SocketAddr, u8, Bytes),
}

/// Handed to message callbacks: who sent the message and a way to answer.
///
/// Sends are queued and flushed by the session after the callback returns.
pub struct MessageContext<'a> {
    from: SocketAddr,
    sender: Option<ConnectionId>,
    outbox: &'a mut Vec<Outgoing>,
}

impl<'a> MessageContext<'a> {
    pub fn new(
        from: SocketAddr,
        sender: Option<ConnectionId>,
        outbox: &'a mut Vec<Outgoing>,
    ) -> Self {
        MessageContext {
            from,
            sender,
            outbox,
        }
    }

    /// Address the datagram came from.
    pub fn from(&self) -> SocketAddr {
        self.from
    }

    /// Connection the message arrived on, if any.
    pub fn sender(&self) -> Option<ConnectionId> {
        self.sender
    }

    /// Answer the sender: through its connection when there is one,
    /// directly to its address otherwise.
    pub fn reply(&mut self, message_type: u8, payload: impl Into<Bytes>) {
        let out = match self.sender {
            Some(id) => Outgoing::Connection(id, message_type, payload.into()),
            None => Outgoing::Direct(self.from, message_type, payload.into()),
        };
        self.outbox.push(out);
    }

    pub fn send_to(&mut self, id: ConnectionId, message_type: u8, payload: impl Into<Bytes>) {
        self.outbox
            .push(Outgoing::Connection(id, message_type, payload.into()));
    }

    pub fn send_direct(&mut self, addr: SocketAddr, message_type: u8, payload: impl Into<Bytes>) {
        self.outbox
            .push(Outgoing::Direct(addr, message_type, payload.into()));
    }
}

/// Application message callback.
pub type MessageCallback = Box<dyn FnMut(&mut MessageContext<'_>, &WireMessage) + Send>;

/// Who handles a message type.
pub enum Handler {
    /// Handled inside the session (reserved types).
    Core,
    User(MessageCallback),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Core => write!(f, "Core"),
            Handler::User(_) => write!(f, "User(..)"),
        }
    }
}

/// Static description of one message type.
#[derive(Debug)]
pub struct MessageDefinition {
    pub message_type: u8,
    pub name: Cow<'static, str>,
    pub options: MessageOptions,
    pub control: ControlFlags,
    pub handler: Handler,
}

impl MessageDefinition {
    /// Stamp this type's flags onto a new message.
    pub fn message(&self, payload: Bytes) -> WireMessage {
        WireMessage::new(self.message_type, payload)
            .with_options(self.options)
            .with_control(self.control)
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// 256-slot table of [`MessageDefinition`]s keyed by type byte.
pub struct MessageRegistry {
    slots: Vec<Option<MessageDefinition>>,
}

impl MessageRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        MessageRegistry {
            slots: (0..MESSAGE_TYPE_SLOTS).map(|_| None).collect(),
        }
    }

    /// A registry holding the reserved core types.
    pub fn with_core_types() -> Self {
        use core_type::*;

        let reliable = MessageOptions::RELIABLE;
        let ordered = MessageOptions::RELIABLE | MessageOptions::INORDER;
        let unreliable = MessageOptions::UNRELIABLE;
        let anyone = ControlFlags::PROCESS_CONNECTIONLESS;
        let connected = ControlFlags::NONE;

        let mut registry = Self::empty();
        for (ty, name, options, control) in [
            (PING, "ping", unreliable, anyone),
            (PONG, "pong", unreliable, anyone),
            (HEARTBEAT, "heartbeat", unreliable, connected),
            (INORDER_HEARTBEAT, "inorder_heartbeat", ordered, connected),
            (ACK, "ack", unreliable, connected),
            (JOIN_REQUEST, "join_request", reliable, anyone),
            (JOIN_DENY, "join_deny", unreliable, anyone),
            (JOIN_ACCEPT, "join_accept", reliable, anyone),
            (CONNECTION_LEAVE, "connection_leave", unreliable, connected),
            (KICK, "kick", unreliable, connected),
            (QUIT, "quit", unreliable, connected),
        ] {
            registry.register(MessageDefinition {
                message_type: ty,
                name: Cow::Borrowed(name),
                options,
                control,
                handler: Handler::Core,
            });
        }
        registry
    }

    /// Add a definition.
    ///
    /// # Panics
    ///
    /// If the type id is already registered.
    pub fn register(&mut self, mut def: MessageDefinition) {
        let slot = &mut self.slots[def.message_type as usize];
        if let Some(existing) = slot {
            panic!(
                "message type {} already registered as {:?}",
                def.message_type, existing.name
            );
        }
        if def.options.is_in_order() && !def.options.is_reliable() {
            tracing::warn!(
                message_type = def.message_type,
                name = %def.name,
                "in-order message types are always reliable; adding RELIABLE"
            );
            def.options = def.options | MessageOptions::RELIABLE;
        }
        *slot = Some(def);
    }

    pub fn get(&self, message_type: u8) -> Option<&MessageDefinition> {
        self.slots[message_type as usize].as_ref()
    }

    pub fn get_mut(&mut self, message_type: u8) -> Option<&mut MessageDefinition> {
        self.slots[message_type as usize].as_mut()
    }

    pub fn is_registered(&self, message_type: u8) -> bool {
        self.slots[message_type as usize].is_some()
    }

    /// Debug name of a type, or `"unknown"`.
    pub fn name(&self, message_type: u8) -> &str {
        self.get(message_type).map_or("unknown", |d| d.name.as_ref())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::with_core_types()
    }
}

// ─── Core Payloads ──────────────────────────────────────────────────────────

/// JOIN_REQUEST: the name the joiner wants to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub guid: Guid,
}

impl JoinRequest {
    pub const ENCODED_LEN: usize = GUID_LEN;

    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self.guid.as_bytes())
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        Some(JoinRequest {
            guid: Guid::decode(buf)?,
        })
    }
}

/// JOIN_ACCEPT: slot and name assignments for host and joiner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAccept {
    pub host_index: u8,
    pub host_guid: Guid,
    pub peer_index: u8,
    pub peer_guid: Guid,
}

impl JoinAccept {
    pub const ENCODED_LEN: usize = 2 + 2 * GUID_LEN;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u8(self.host_index);
        buf.extend_from_slice(self.host_guid.as_bytes());
        buf.put_u8(self.peer_index);
        buf.extend_from_slice(self.peer_guid.as_bytes());
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        let host_index = buf.get_u8();
        let host_guid = Guid::decode(buf)?;
        let peer_index = buf.get_u8();
        let peer_guid = Guid::decode(buf)?;
        Some(JoinAccept {
            host_index,
            host_guid,
            peer_index,
            peer_guid,
        })
    }
}

/// JOIN_DENY: why the join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinDeny {
    pub reason: ErrorCode,
}

impl JoinDeny {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.reason as u8])
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let reason = ErrorCode::from_byte(buf.get_u8())?;
        Some(JoinDeny { reason })
    }
}

/// PING for round-trip measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub ping_id: u16,
    /// Sender's clock in µs when the ping left.
    pub origin_timestamp_us: u32,
}

impl Ping {
    pub const ENCODED_LEN: usize = 6;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u16(self.ping_id);
        buf.put_u32(self.origin_timestamp_us);
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(Ping {
            ping_id: buf.get_u16(),
            origin_timestamp_us: buf.get_u32(),
        })
    }
}

/// PONG answering a [`Ping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub ping_id: u16,
    pub origin_timestamp_us: u32,
    /// Responder's clock in µs when the ping arrived.
    pub receive_timestamp_us: u32,
}

impl Pong {
    pub const ENCODED_LEN: usize = 10;

    pub fn answer(ping: &Ping, receive_timestamp_us: u32) -> Self {
        Pong {
            ping_id: ping.ping_id,
            origin_timestamp_us: ping.origin_timestamp_us,
            receive_timestamp_us,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u16(self.ping_id);
        buf.put_u32(self.origin_timestamp_us);
        buf.put_u32(self.receive_timestamp_us);
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(Pong {
            ping_id: buf.get_u16(),
            origin_timestamp_us: buf.get_u32(),
            receive_timestamp_us: buf.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_def(ty: u8, options: MessageOptions) -> MessageDefinition {
        MessageDefinition {
            message_type: ty,
            name: Cow::Borrowed("chat"),
            options,
            control: ControlFlags::NONE,
            handler: Handler::User(Box::new(|_, _| {})),
        }
    }

    #[test]
    fn core_types_registered() {
        let reg = MessageRegistry::with_core_types();
        assert_eq!(reg.len(), CORE_MESSAGE_COUNT as usize);
        assert!(reg.get(core_type::JOIN_REQUEST).unwrap().control.is_connectionless());
        assert!(!reg.get(core_type::KICK).unwrap().control.is_connectionless());
        assert!(reg.get(core_type::INORDER_HEARTBEAT).unwrap().options.is_in_order());
        assert_eq!(reg.name(core_type::QUIT), "quit");
        assert_eq!(reg.name(200), "unknown");
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_registration_panics() {
        let mut reg = MessageRegistry::with_core_types();
        reg.register(user_def(40, MessageOptions::RELIABLE));
        reg.register(user_def(40, MessageOptions::RELIABLE));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn core_type_cannot_be_replaced() {
        let mut reg = MessageRegistry::with_core_types();
        reg.register(user_def(core_type::PING, MessageOptions::UNRELIABLE));
    }

    #[test]
    fn in_order_implies_reliable() {
        let mut reg = MessageRegistry::empty();
        reg.register(user_def(40, MessageOptions::INORDER));
        let opts = reg.get(40).unwrap().options;
        assert!(opts.is_reliable() && opts.is_in_order());
    }

    #[test]
    fn definition_stamps_flags() {
        let def = user_def(40, MessageOptions::RELIABLE);
        let msg = def.message(Bytes::from_static(b"x"));
        assert_eq!(msg.message_type, 40);
        assert!(msg.is_reliable());
    }

    #[test]
    fn context_reply_routes_by_sender() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut outbox = Vec::new();
        {
            let mut ctx = MessageContext::new(addr, None, &mut outbox);
            ctx.reply(40, Bytes::from_static(b"a"));
        }
        {
            let mut ctx = MessageContext::new(addr, Some(ConnectionId(2)), &mut outbox);
            ctx.reply(40, Bytes::from_static(b"b"));
        }
        assert_eq!(
            outbox,
            vec![
                Outgoing::Direct(addr, 40, Bytes::from_static(b"a")),
                Outgoing::Connection(ConnectionId(2), 40, Bytes::from_static(b"b")),
            ]
        );
    }

    #[test]
    fn join_accept_roundtrip() {
        let accept = JoinAccept {
            host_index: 0,
            host_guid: Guid::from_name("host"),
            peer_index: 3,
            peer_guid: Guid::from_name("alice"),
        };
        let bytes = accept.encode();
        assert_eq!(bytes.len(), JoinAccept::ENCODED_LEN);
        assert_eq!(JoinAccept::decode(&mut bytes.clone()), Some(accept));
    }

    #[test]
    fn join_deny_rejects_unknown_reason() {
        assert!(JoinDeny::decode(&mut &[200u8][..]).is_none());
        let deny = JoinDeny {
            reason: ErrorCode::JoinDeniedFull,
        };
        assert_eq!(JoinDeny::decode(&mut deny.encode()), Some(deny));
    }

    #[test]
    fn short_payloads_rejected() {
        assert!(JoinRequest::decode(&mut &[0u8; 10][..]).is_none());
        assert!(Ping::decode(&mut &[0u8; 5][..]).is_none());
        assert!(Pong::decode(&mut &[0u8; 9][..]).is_none());
    }

    #[test]
    fn pong_echoes_ping() {
        let ping = Ping {
            ping_id: 7,
            origin_timestamp_us: 1234,
        };
        let pong = Pong::answer(&ping, 5678);
        assert_eq!(pong.ping_id, 7);
        assert_eq!(pong.origin_timestamp_us, 1234);
        assert_eq!(Pong::decode(&mut pong.encode()), Some(pong));
    }
}
