//! # Reliability and Ordering Bookkeeping
//!
//! Per-connection structures that turn lossy, duplicating, reordering
//! datagrams into at-most-once processing of reliable messages and
//! sender-order processing of in-order messages.
//!
//! ## Sender side
//!
//! - [`AckBundleRing`]: which reliable ids rode on each outgoing ack.
//! - [`ConfirmedReliables`]: oldest-unconfirmed watermark plus the set of
//!   ids confirmed out of order above it.
//!
//! ## Receiver side
//!
//! - [`ReceivedReliables`]: dedup window of reliable ids.
//! - [`Resequencer`]: holds in-order messages that arrived early.
//!
//! All ids are wrapping u16 counters compared through [`crate::seq`].

use std::collections::{HashSet, VecDeque};

use crate::seq::{sequence_diff, sequence_greater_or_equal, sequence_greater_than};
use crate::wire::{WireMessage, INVALID_ACK};

/// Number of outgoing acks whose reliable ids are remembered.
pub const ACK_BUNDLE_COUNT: usize = 64;

/// How far below the newest received reliable id duplicates are still
/// detected; also the most reliable ids a sender keeps in flight.
pub const MAX_RELIABLE_RANGE: u16 = 1000;

// ─── Ack Bundles (Sender-Side) ──────────────────────────────────────────────

/// Reliable ids attached to one outgoing ack.
#[derive(Debug, Clone)]
pub struct AckBundle {
    ack: u16,
    reliable_ids: Vec<u16>,
}

impl AckBundle {
    fn empty() -> Self {
        AckBundle {
            ack: INVALID_ACK,
            reliable_ids: Vec::new(),
        }
    }

    pub fn ack(&self) -> u16 {
        self.ack
    }

    pub fn reliable_ids(&self) -> &[u16] {
        &self.reliable_ids
    }
}

/// Fixed ring of [`AckBundle`]s indexed by `ack % ACK_BUNDLE_COUNT`.
#[derive(Debug)]
pub struct AckBundleRing {
    bundles: Vec<AckBundle>,
}

impl AckBundleRing {
    pub fn new() -> Self {
        AckBundleRing {
            bundles: (0..ACK_BUNDLE_COUNT).map(|_| AckBundle::empty()).collect(),
        }
    }

    fn slot(ack: u16) -> usize {
        ack as usize % ACK_BUNDLE_COUNT
    }

    /// Claim the slot for a new outgoing ack, discarding whatever it held.
    pub fn begin(&mut self, ack: u16) {
        let bundle = &mut self.bundles[Self::slot(ack)];
        bundle.ack = ack;
        bundle.reliable_ids.clear();
    }

    /// Note that `reliable_id` travelled with `ack`.
    pub fn record(&mut self, ack: u16, reliable_id: u16) {
        let bundle = &mut self.bundles[Self::slot(ack)];
        debug_assert_eq!(bundle.ack, ack, "record without begin");
        bundle.reliable_ids.push(reliable_id);
    }

    /// The bundle for `ack`, if its slot has not been reused since.
    pub fn get(&self, ack: u16) -> Option<&AckBundle> {
        if ack == INVALID_ACK {
            return None;
        }
        let bundle = &self.bundles[Self::slot(ack)];
        (bundle.ack == ack).then_some(bundle)
    }
}

impl Default for AckBundleRing {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Confirmation Watermark (Sender-Side) ───────────────────────────────────

/// Tracks which sent reliable ids the peer has confirmed.
///
/// Everything below `oldest_unconfirmed` is confirmed. Ids confirmed above
/// it sit in `confirmed` until the gap closes and the watermark sweeps them.
#[derive(Debug, Default)]
pub struct ConfirmedReliables {
    oldest_unconfirmed: u16,
    confirmed: HashSet<u16>,
}

impl ConfirmedReliables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest reliable id not yet known to be confirmed.
    pub fn oldest_unconfirmed(&self) -> u16 {
        self.oldest_unconfirmed
    }

    /// Ids confirmed above the watermark, waiting for the gap to close.
    pub fn pending_len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn is_confirmed(&self, id: u16) -> bool {
        !sequence_greater_or_equal(id, self.oldest_unconfirmed) || self.confirmed.contains(&id)
    }

    /// Mark `id` confirmed. Returns `true` if this is news.
    pub fn mark_confirmed(&mut self, id: u16) -> bool {
        if id == self.oldest_unconfirmed {
            self.confirmed.insert(id);
            while self.confirmed.remove(&self.oldest_unconfirmed) {
                self.oldest_unconfirmed = self.oldest_unconfirmed.wrapping_add(1);
            }
            true
        } else if sequence_greater_than(id, self.oldest_unconfirmed) {
            self.confirmed.insert(id)
        } else {
            false
        }
    }
}

// ─── Dedup Window (Receiver-Side) ───────────────────────────────────────────

/// Reliable ids already processed, bounded by [`MAX_RELIABLE_RANGE`].
#[derive(Debug, Default)]
pub struct ReceivedReliables {
    next_expected: u16,
    received: HashSet<u16>,
}

impl ReceivedReliables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_expected(&self) -> u16 {
        self.next_expected
    }

    pub fn len(&self) -> usize {
        self.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    /// Whether `id` was already processed. Ids older than the window are
    /// treated as processed.
    pub fn has_received(&self, id: u16) -> bool {
        if sequence_greater_or_equal(id, self.next_expected) {
            return false;
        }
        if sequence_diff(self.next_expected, id) > MAX_RELIABLE_RANGE as i32 {
            return true;
        }
        self.received.contains(&id)
    }

    /// Record `id` as processed.
    pub fn record(&mut self, id: u16) {
        if sequence_greater_or_equal(id, self.next_expected) {
            self.received.insert(id);
            self.next_expected = id.wrapping_add(1);
            let next = self.next_expected;
            self.received
                .retain(|&r| sequence_diff(next, r) <= MAX_RELIABLE_RANGE as i32);
        } else if sequence_diff(self.next_expected, id) <= MAX_RELIABLE_RANGE as i32 {
            self.received.insert(id);
        }
    }
}

// ─── Resequencer (Receiver-Side) ────────────────────────────────────────────

/// What happened to an in-order message handed to the [`Resequencer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Sequenced {
    /// The message was next in line; it and any unblocked followers are
    /// ready, in order.
    Ready(Vec<WireMessage>),
    /// Arrived early, held until the gap fills.
    Buffered,
    /// Already buffered under the same sequence id.
    Duplicate,
    /// Sequence id already passed.
    Stale,
}

/// Reorders in-order messages by sequence id.
#[derive(Debug, Default)]
pub struct Resequencer {
    next_expected: u16,
    /// Ascending by sequence id relative to `next_expected`.
    buffered: VecDeque<WireMessage>,
}

impl Resequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_expected(&self) -> u16 {
        self.next_expected
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn accept(&mut self, msg: WireMessage) -> Sequenced {
        let seq = msg.sequence_id;
        if seq == self.next_expected {
            let mut ready = vec![msg];
            self.next_expected = self.next_expected.wrapping_add(1);
            while self
                .buffered
                .front()
                .is_some_and(|m| m.sequence_id == self.next_expected)
            {
                if let Some(next) = self.buffered.pop_front() {
                    ready.push(next);
                }
                self.next_expected = self.next_expected.wrapping_add(1);
            }
            return Sequenced::Ready(ready);
        }

        if !sequence_greater_than(seq, self.next_expected) {
            return Sequenced::Stale;
        }

        let base = self.next_expected;
        let offset = |m: &WireMessage| sequence_diff(m.sequence_id, base);
        let key = sequence_diff(seq, base);
        match self.buffered.binary_search_by_key(&key, offset) {
            Ok(_) => Sequenced::Duplicate,
            Err(pos) => {
                self.buffered.insert(pos, msg);
                Sequenced::Buffered
            }
        }
    }
}
