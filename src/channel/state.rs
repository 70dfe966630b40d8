//! Qualification bitfields (§3 "Channel" state model, §9 design notes).
//!
//! The source represents `state`/`delta`/`events` as three one-byte
//! bitfields sharing the same bit layout. Per the design notes, the
//! producer side (`delta`, written by `acquire`/`terminate`/`force` under
//! the Array's mutex) and the consumer side (`state`, written only while
//! draining the delta queue at cycle-enter) must never race on the same
//! word — here that's enforced by both living behind the same
//! `Mutex<ChannelSlot>` rather than by lock-free bit tricks, but the two
//! fields are kept textually and semantically distinct so a reader can
//! still see which side wrote what.

/// Internal (process-side) qualification: the caller has supplied a buffer,
/// or has requested termination.
pub const INTERNAL_TRANSFER: u8 = 0b0000_0001;
pub const INTERNAL_TERMINATE: u8 = 0b0000_0010;
/// External (kernel-side) qualification: the kernel reports I/O can
/// proceed, or the peer has gone away.
pub const EXTERNAL_TRANSFER: u8 = 0b0000_0100;
pub const EXTERNAL_TERMINATE: u8 = 0b0000_1000;
/// Control bits (§3: "polarity, force-transfer, requeue, connect-pending" —
/// polarity itself is carried in a separate immutable field in this port,
/// the remaining three live here).
pub const FORCE: u8 = 0b0001_0000;
pub const REQUEUE: u8 = 0b0010_0000;
pub const CONNECT_PENDING: u8 = 0b0100_0000;

/// A qualification bitset: used identically for a channel's `state` and
/// `delta` fields (§3). The per-cycle `events` summary (which of
/// `transfer`/`terminate` fired) is reported separately via
/// [`crate::cycle::ChannelEvent`] rather than stored as a third bitset on
/// the channel, since it only ever needs to be read once per cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bits(pub u8);

impl Bits {
    pub const EMPTY: Bits = Bits(0);

    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    pub fn any(self, bits: u8) -> bool {
        self.0 & bits != 0
    }

    pub fn set(&mut self, bits: u8) {
        self.0 |= bits;
    }

    pub fn clear(&mut self, bits: u8) {
        self.0 &= !bits;
    }

    /// Merge `delta` into `self` (`state |= delta`) and return the emptied
    /// delta, per §4.3 step 3.
    pub fn drain_into(delta: &mut Bits) -> Bits {
        let taken = *delta;
        *delta = Bits::EMPTY;
        taken
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn terminated(self) -> bool {
        self.contains(INTERNAL_TERMINATE | EXTERNAL_TERMINATE)
    }

    pub fn should_transfer(self) -> bool {
        self.contains(INTERNAL_TRANSFER | EXTERNAL_TRANSFER) && !self.terminated()
    }
}

/// Which direction a Channel moves bytes: into the process (reading from the
/// kernel) or out of it (writing to the kernel). Immutable for the
/// channel's lifetime (§3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Input,
    Output,
}

impl Polarity {
    pub fn is_input(self) -> bool {
        matches!(self, Polarity::Input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_requires_both_sides() {
        let mut s = Bits::EMPTY;
        assert!(!s.terminated());
        s.set(INTERNAL_TERMINATE);
        assert!(!s.terminated());
        s.set(EXTERNAL_TERMINATE);
        assert!(s.terminated());
    }

    #[test]
    fn should_transfer_false_once_terminated() {
        let mut s = Bits::EMPTY;
        s.set(INTERNAL_TRANSFER | EXTERNAL_TRANSFER);
        assert!(s.should_transfer());
        s.set(INTERNAL_TERMINATE | EXTERNAL_TERMINATE);
        assert!(!s.should_transfer());
    }
}
