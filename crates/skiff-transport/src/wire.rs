//! # Skiff Wire Format
//!
//! One datagram carries one packet: a fixed 8-byte header followed by a run
//! of length-prefixed messages. All multi-byte fields are big-endian.
//!
//! ## Packet header (8 bytes)
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +---------------+---------------+-------------------------------+
//! | Sender Index  | Message Count |             Ack               |
//! +---------------+---------------+-------------------------------+
//! |     Highest Received Ack      |     Previous Acks Bitfield    |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! ## Message (2-byte length prefix + 5-byte header + payload)
//!
//! ```text
//! +-------------------------------+---------------+---------------+
//! |        Total Length           |     Type      | Reliable Id.. |
//! +-------------------------------+---------------+---------------+
//! | ..Reliable Id |          Sequence Id          |  Payload ...  |
//! +---------------+-------------------------------+---------------+
//! ```
//!
//! `Total Length` counts the 5 header bytes plus the payload.
//! The message count is written as a placeholder and patched once the
//! packet is full, so senders can pack greedily.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::BitOr;

use crate::seq::AckWindow;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Largest datagram we ever send: stays under a 1280-byte IPv6 link MTU
/// after IP and UDP headers.
pub const PACKET_MTU: usize = 1232;

/// Largest encoded message (header + payload, excluding the length prefix).
pub const MESSAGE_MTU: usize = 1024;

/// sender (1) + count (1) + ack (2) + highest ack (2) + bitfield (2).
pub const PACKET_HEADER_SIZE: usize = 8;

/// type (1) + reliable id (2) + sequence id (2).
pub const MESSAGE_HEADER_SIZE: usize = 5;

/// Size of the per-message `u16` length prefix.
pub const MESSAGE_LENGTH_PREFIX: usize = 2;

/// Largest payload a single message can carry.
pub const MAX_PAYLOAD_LEN: usize = MESSAGE_MTU - MESSAGE_HEADER_SIZE;

/// Sender index used when the sender has no slot in the receiver's table.
pub const INVALID_CONNECTION_INDEX: u8 = 0xFF;

/// "No ack received yet". Ack numbering never produces this value.
pub const INVALID_ACK: u16 = 0xFFFF;

// ─── Message Flags ───────────────────────────────────────────────────────────

/// Delivery options of a message type.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageOptions(u8);

impl MessageOptions {
    /// Fire-and-forget, processed on arrival.
    pub const UNRELIABLE: Self = MessageOptions(0);
    /// Resent until the peer confirms it; processed at most once.
    pub const RELIABLE: Self = MessageOptions(0b01);
    /// Processed in the order the sender enqueued it.
    pub const INORDER: Self = MessageOptions(0b10);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_reliable(self) -> bool {
        self.contains(Self::RELIABLE)
    }

    pub const fn is_in_order(self) -> bool {
        self.contains(Self::INORDER)
    }
}

impl BitOr for MessageOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        MessageOptions(self.0 | rhs.0)
    }
}

impl fmt::Debug for MessageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_reliable(), self.is_in_order()) {
            (false, false) => write!(f, "UNRELIABLE"),
            (true, false) => write!(f, "RELIABLE"),
            (false, true) => write!(f, "INORDER"),
            (true, true) => write!(f, "RELIABLE|INORDER"),
        }
    }
}

/// Session-level handling flags of a message type.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ControlFlags(u8);

impl ControlFlags {
    pub const NONE: Self = ControlFlags(0);
    /// May be processed from an address with no established connection.
    pub const PROCESS_CONNECTIONLESS: Self = ControlFlags(0b01);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_connectionless(self) -> bool {
        self.contains(Self::PROCESS_CONNECTIONLESS)
    }
}

impl BitOr for ControlFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        ControlFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for ControlFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_connectionless() {
            write!(f, "PROCESS_CONNECTIONLESS")
        } else {
            write!(f, "NONE")
        }
    }
}

// ─── Wire Message ────────────────────────────────────────────────────────────

/// One application-level message.
///
/// `options` and `control` are not on the wire: both ends look them up in
/// their message registry by `message_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub message_type: u8,
    pub options: MessageOptions,
    pub control: ControlFlags,
    /// Assigned when the message is first attached to an outgoing packet.
    pub reliable_id: u16,
    /// Assigned when an in-order message is enqueued.
    pub sequence_id: u16,
    pub payload: Bytes,
}

impl WireMessage {
    /// An unreliable, unordered message.
    pub fn new(message_type: u8, payload: impl Into<Bytes>) -> Self {
        WireMessage {
            message_type,
            options: MessageOptions::UNRELIABLE,
            control: ControlFlags::NONE,
            reliable_id: 0,
            sequence_id: 0,
            payload: payload.into(),
        }
    }

    pub fn with_options(mut self, options: MessageOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_control(mut self, control: ControlFlags) -> Self {
        self.control = control;
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.options.is_reliable()
    }

    pub fn is_in_order(&self) -> bool {
        self.options.is_in_order()
    }

    /// Bytes this message occupies inside a packet, length prefix included.
    pub fn encoded_len(&self) -> usize {
        MESSAGE_LENGTH_PREFIX + MESSAGE_HEADER_SIZE + self.payload.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16((MESSAGE_HEADER_SIZE + self.payload.len()) as u16);
        buf.put_u8(self.message_type);
        buf.put_u16(self.reliable_id);
        buf.put_u16(self.sequence_id);
        buf.extend_from_slice(&self.payload);
    }
}

/// Result of reading one message from a packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Message(WireMessage),
    /// Length prefix was out of bounds; the message's bytes were skipped.
    Rejected { length: usize },
    /// Fewer bytes remain than the message claims.
    Truncated,
}

/// Read the next length-prefixed message from `buf`.
pub fn read_message(buf: &mut impl Buf) -> ReadOutcome {
    if buf.remaining() < MESSAGE_LENGTH_PREFIX {
        return ReadOutcome::Truncated;
    }
    let length = buf.get_u16() as usize;
    if buf.remaining() < length {
        return ReadOutcome::Truncated;
    }
    if length > MESSAGE_MTU || length < MESSAGE_HEADER_SIZE {
        buf.advance(length);
        return ReadOutcome::Rejected { length };
    }

    let message_type = buf.get_u8();
    let reliable_id = buf.get_u16();
    let sequence_id = buf.get_u16();
    let payload = buf.copy_to_bytes(length - MESSAGE_HEADER_SIZE);
    ReadOutcome::Message(WireMessage {
        message_type,
        options: MessageOptions::UNRELIABLE,
        control: ControlFlags::NONE,
        reliable_id,
        sequence_id,
        payload,
    })
}

// ─── Packet Header ──────────────────────────────────────────────────────────

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Sender's slot in the connection table, or [`INVALID_CONNECTION_INDEX`].
    pub sender: u8,
    pub message_count: u8,
    /// This packet's own ack number.
    pub ack: u16,
    /// Highest ack the sender has received from us.
    pub highest_received_ack: u16,
    /// The 16 acks below `highest_received_ack` the sender also received.
    pub ack_bits: u16,
}

impl PacketHeader {
    pub fn new(sender: u8, ack: u16, window: AckWindow) -> Self {
        PacketHeader {
            sender,
            message_count: 0,
            ack,
            highest_received_ack: window.highest(),
            ack_bits: window.bits(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.sender);
        buf.put_u8(self.message_count);
        buf.put_u16(self.ack);
        buf.put_u16(self.highest_received_ack);
        buf.put_u16(self.ack_bits);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < PACKET_HEADER_SIZE {
            return None;
        }
        Some(PacketHeader {
            sender: buf.get_u8(),
            message_count: buf.get_u8(),
            ack: buf.get_u16(),
            highest_received_ack: buf.get_u16(),
            ack_bits: buf.get_u16(),
        })
    }

    /// The sender's view of which of our acks it received.
    pub fn ack_window(&self) -> AckWindow {
        AckWindow::from_parts(self.highest_received_ack, self.ack_bits)
    }
}

// ─── Packet Writer ──────────────────────────────────────────────────────────

/// Greedy packet builder bounded by [`PACKET_MTU`].
pub struct PacketWriter {
    buf: BytesMut,
    header: PacketHeader,
    /// Bookmark of the message-count byte, patched in `finish`.
    count_at: usize,
    count: u8,
}

impl PacketWriter {
    pub fn new(header: PacketHeader) -> Self {
        let mut buf = BytesMut::with_capacity(PACKET_MTU);
        let count_at = 1;
        PacketHeader {
            message_count: 0,
            ..header
        }
        .encode(&mut buf);
        PacketWriter {
            buf,
            header,
            count_at,
            count: 0,
        }
    }

    /// Bytes still available before hitting the packet MTU.
    pub fn remaining(&self) -> usize {
        PACKET_MTU - self.buf.len()
    }

    pub fn message_count(&self) -> u8 {
        self.count
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Whether `msg` fits in the remaining space.
    pub fn can_write(&self, msg: &WireMessage) -> bool {
        self.count < u8::MAX
            && msg.payload.len() <= MAX_PAYLOAD_LEN
            && self.remaining() >= MESSAGE_HEADER_SIZE + msg.payload.len() + MESSAGE_LENGTH_PREFIX
    }

    /// Append `msg` if it fits. Returns whether it was written.
    pub fn write_message(&mut self, msg: &WireMessage) -> bool {
        if !self.can_write(msg) {
            return false;
        }
        msg.encode(&mut self.buf);
        self.count += 1;
        true
    }

    /// Write the longest prefix of `msgs` that fits, all or nothing per
    /// message. Returns how many were written.
    pub fn write_messages(&mut self, msgs: &[WireMessage]) -> usize {
        let mut budget = self.remaining();
        let mut fits = 0;
        for msg in msgs {
            let needed = msg.encoded_len();
            if msg.payload.len() > MAX_PAYLOAD_LEN
                || needed > budget
                || self.count as usize + fits >= u8::MAX as usize
            {
                break;
            }
            budget -= needed;
            fits += 1;
        }
        for msg in &msgs[..fits] {
            msg.encode(&mut self.buf);
        }
        self.count += fits as u8;
        fits
    }

    /// Patch the message count and hand back the datagram.
    pub fn finish(mut self) -> Bytes {
        self.buf[self.count_at] = self.count;
        self.buf.freeze()
    }
}

// ─── Full Packet ────────────────────────────────────────────────────────────

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    pub header: PacketHeader,
    pub messages: Vec<WireMessage>,
    /// Messages skipped because their length prefix was out of bounds.
    pub rejected: usize,
}

impl WirePacket {
    /// Encode `messages` behind `header`. Returns `None` if they do not fit.
    pub fn encode(header: PacketHeader, messages: &[WireMessage]) -> Option<Bytes> {
        let mut writer = PacketWriter::new(header);
        if writer.write_messages(messages) != messages.len() {
            return None;
        }
        Some(writer.finish())
    }

    /// Decode a datagram. Returns `None` only if the header is unreadable;
    /// bad messages are counted in `rejected` and skipped.
    pub fn decode(data: &mut impl Buf) -> Option<Self> {
        let header = PacketHeader::decode(data)?;
        let mut messages = Vec::with_capacity(header.message_count as usize);
        let mut rejected = 0;

        for _ in 0..header.message_count {
            match read_message(data) {
                ReadOutcome::Message(msg) => messages.push(msg),
                ReadOutcome::Rejected { length } => {
                    tracing::warn!(length, max = MESSAGE_MTU, "discarding malformed message");
                    rejected += 1;
                }
                ReadOutcome::Truncated => {
                    tracing::warn!(
                        expected = header.message_count,
                        read = messages.len() + rejected,
                        "packet truncated"
                    );
                    rejected += 1;
                    break;
                }
            }
        }

        Some(WirePacket {
            header,
            messages,
            rejected,
        })
    }
}
