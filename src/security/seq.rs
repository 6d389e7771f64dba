//! 48-bit Data Secure sequence counters.
//!
//! Every counter on the wire is a 6-byte big-endian unsigned integer. We keep
//! it in a `u64` (top 2 bytes always zero) so it fits in an `AtomicU64` for
//! lock-free increment/compare.

use crate::addressing::IndividualAddress;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum representable sequence value (2^48 - 1).
pub const MAX_SEQUENCE: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Decode a 6-byte big-endian sequence number.
#[must_use]
pub fn decode(bytes: &[u8; 6]) -> u64 {
    let mut buf = [0u8; 8];
    buf[2..].copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

/// Encode a sequence number as 6 big-endian bytes.
///
/// # Panics
///
/// Panics in debug builds if `value` exceeds [`MAX_SEQUENCE`].
#[must_use]
pub fn encode(value: u64) -> [u8; 6] {
    debug_assert!(value <= MAX_SEQUENCE, "sequence number overflows 48 bits");
    let full = value.to_be_bytes();
    let mut out = [0u8; 6];
    out.copy_from_slice(&full[2..]);
    out
}

/// A single atomic 48-bit counter, used for our own outgoing `seqPlain` /
/// `seqTool` counters.
#[derive(Debug)]
pub struct SequenceCounter {
    value: AtomicU64,
}

impl SequenceCounter {
    /// Start the counter at `initial`.
    #[must_use]
    pub const fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    /// Current value without advancing.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Atomically advance the counter by one and return the value used
    /// (pre-increment), wrapping at [`MAX_SEQUENCE`].
    pub fn next(&self) -> u64 {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let next = if current >= MAX_SEQUENCE { 0 } else { current + 1 };
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(used) => return used,
                Err(observed) => current = observed,
            }
        }
    }

    /// Force the counter to at least `value`, used when a sync response
    /// reports a higher remote counter than ours.
    pub fn advance_to_at_least(&self, value: u64) {
        let mut current = self.value.load(Ordering::Acquire);
        while value > current {
            match self.value.compare_exchange_weak(
                current,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Per-peer "last valid received sequence" tracking, keyed by
/// [`IndividualAddress`]. Used both for normal peer replay protection and,
/// indexed separately, for broadcast/serial-keyed peers by the caller.
#[derive(Debug, Default)]
pub struct LastValidSeqTable {
    table: DashMap<IndividualAddress, u64>,
}

impl LastValidSeqTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    /// Last sequence accepted from `peer`, if any frame from it has been
    /// validated yet.
    #[must_use]
    pub fn last_valid(&self, peer: IndividualAddress) -> Option<u64> {
        self.table.get(&peer).map(|v| *v)
    }

    /// Check whether `received` is acceptable from `peer`: strictly greater
    /// than the last accepted value (or any value, if none has been accepted
    /// yet).
    #[must_use]
    pub fn is_acceptable(&self, peer: IndividualAddress, received: u64) -> bool {
        self.table.get(&peer).is_none_or(|last| received >= *last + 1)
    }

    /// Record `received` as the new last-valid sequence for `peer`.
    pub fn record(&self, peer: IndividualAddress, received: u64) {
        self.table.insert(peer, received);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let value = 0x0102_0304_0506;
        let bytes = encode(value);
        assert_eq!(decode(&bytes), value);
    }

    #[test]
    fn counter_advances_and_wraps() {
        let counter = SequenceCounter::new(MAX_SEQUENCE - 1);
        assert_eq!(counter.next(), MAX_SEQUENCE - 1);
        assert_eq!(counter.next(), MAX_SEQUENCE);
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn advance_to_at_least_only_moves_forward() {
        let counter = SequenceCounter::new(5);
        counter.advance_to_at_least(3);
        assert_eq!(counter.current(), 5);
        counter.advance_to_at_least(10);
        assert_eq!(counter.current(), 10);
    }

    #[test]
    fn last_valid_seq_table_rejects_replay() {
        let table = LastValidSeqTable::new();
        let peer = IndividualAddress::new(1, 1, 1).unwrap();

        assert!(table.is_acceptable(peer, 1));
        table.record(peer, 5);

        assert!(!table.is_acceptable(peer, 5));
        assert!(!table.is_acceptable(peer, 4));
        assert!(table.is_acceptable(peer, 6));
    }
}
