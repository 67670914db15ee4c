//! # Cyclic Sequence Arithmetic
//!
//! Acks, reliable ids and sequence ids are all 16-bit counters that wrap.
//! Everything that compares them goes through this module.
//!
//! ## Ack window
//!
//! [`AckWindow`] is the receive-side record carried in every packet header:
//! the highest ack received so far plus a 16-bit bitfield where
//! bit `i` is set iff ack `highest - (i + 1)` was also received.
//!
//! ```text
//!   highest = 100, bits = 0b0000_0000_0000_0101
//!                                            │ └─ 99 received
//!                                            └─── 97 received
//! ```

use crate::wire::INVALID_ACK;

/// Number of acks tracked below the highest one.
pub const ACK_WINDOW_BITS: u16 = 16;

/// `true` if `a` is ahead of `b` in wrapping u16 space.
#[inline]
pub fn sequence_greater_than(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// `true` if `a` is ahead of or equal to `b` in wrapping u16 space.
#[inline]
pub fn sequence_greater_or_equal(a: u16, b: u16) -> bool {
    a == b || sequence_greater_than(a, b)
}

/// Signed distance from `b` to `a` (positive when `a` is ahead).
#[inline]
pub fn sequence_diff(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

/// Next ack number after `ack`, skipping the [`INVALID_ACK`] sentinel.
#[inline]
pub fn next_ack(ack: u16) -> u16 {
    let next = ack.wrapping_add(1);
    if next == INVALID_ACK {
        next.wrapping_add(1)
    } else {
        next
    }
}

// ─── Ack Window ─────────────────────────────────────────────────────────────

/// Highest-received-ack plus the bitfield of the 16 acks below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckWindow {
    highest: u16,
    bits: u16,
}

impl AckWindow {
    /// An empty window: nothing received yet.
    pub const fn new() -> Self {
        AckWindow {
            highest: INVALID_ACK,
            bits: 0,
        }
    }

    /// Rebuild a window from header fields.
    pub const fn from_parts(highest: u16, bits: u16) -> Self {
        AckWindow { highest, bits }
    }

    /// Highest ack recorded, or [`INVALID_ACK`] if none.
    pub fn highest(&self) -> u16 {
        self.highest
    }

    /// Bitfield of the acks immediately below `highest`.
    pub fn bits(&self) -> u16 {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.highest == INVALID_ACK
    }

    /// Record that `ack` was received.
    ///
    /// Newer acks shift the window up by the gap; older acks inside the
    /// window set their bit; anything older than the window is forgotten.
    pub fn record(&mut self, ack: u16) {
        if ack == INVALID_ACK {
            return;
        }
        if self.is_empty() {
            self.highest = ack;
            self.bits = 0;
            return;
        }
        if ack == self.highest {
            return;
        }

        if sequence_greater_than(ack, self.highest) {
            let gap = sequence_diff(ack, self.highest) as u32;
            // Old highest lands at bit (gap - 1); the rest shift with it.
            let shifted = if gap >= 32 {
                0
            } else {
                ((self.bits as u32) << gap) | (1u32 << (gap - 1))
            };
            self.bits = (shifted & 0xFFFF) as u16;
            self.highest = ack;
        } else {
            let behind = sequence_diff(self.highest, ack) as u32;
            if behind <= ACK_WINDOW_BITS as u32 {
                self.bits |= 1 << (behind - 1);
            }
        }
    }

    /// Whether `ack` is covered by this window.
    pub fn contains(&self, ack: u16) -> bool {
        if self.is_empty() || ack == INVALID_ACK {
            return false;
        }
        if ack == self.highest {
            return true;
        }
        if !sequence_greater_than(self.highest, ack) {
            return false;
        }
        let behind = sequence_diff(self.highest, ack) as u32;
        behind <= ACK_WINDOW_BITS as u32 && self.bits & (1 << (behind - 1)) != 0
    }

    /// Iterate every ack this window claims: `highest` first, then each set bit.
    pub fn acked(&self) -> impl Iterator<Item = u16> + '_ {
        let highest = (!self.is_empty()).then_some(self.highest);
        let below = (0..ACK_WINDOW_BITS).filter_map(move |i| {
            if !self.is_empty() && self.bits & (1 << i) != 0 {
                Some(self.highest.wrapping_sub(i + 1))
            } else {
                None
            }
        });
        highest.into_iter().chain(below)
    }
}

impl Default for AckWindow {
    fn default() -> Self {
        Self::new()
    }
}
