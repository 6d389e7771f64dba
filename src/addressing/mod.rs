//! KNX addressing system.
//!
//! KNX uses two types of addresses:
//! - Individual addresses for physical devices (Area.Line.Device)
//! - Group addresses for logical grouping (Main/Middle/Sub or Main/Sub)
//!
//! [`KnxAddress`] unifies both under a single sum type for code that needs
//! to carry "whatever was in the destination field" without committing to
//! one kind up front (e.g. cEMI frame parsing).

pub mod group;
pub mod individual;
pub mod serial;

#[doc(inline)]
pub use group::GroupAddress;
#[doc(inline)]
pub use individual::IndividualAddress;
#[doc(inline)]
pub use serial::SerialNumber;

/// Either kind of 16-bit KNX address, as carried in a cEMI destination field.
///
/// The destination-address-type bit in Control Field 2 (§ cEMI) is what
/// distinguishes the two at the wire level; this type exists so higher
/// layers can pattern-match on it instead of juggling a raw `u16` plus a
/// separate "is group" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnxAddress {
    /// A physical device address.
    Individual(IndividualAddress),
    /// A logical group address. `0x0000` denotes broadcast.
    Group(GroupAddress),
}

impl KnxAddress {
    /// The reserved group address used for system broadcasts.
    pub const BROADCAST: Self = Self::Group(GroupAddress::from_raw(0x0000));

    /// Raw 16-bit value, independent of address kind.
    #[inline]
    pub const fn raw(self) -> u16 {
        match self {
            Self::Individual(a) => a.raw(),
            Self::Group(a) => a.raw(),
        }
    }

    /// True if this is the reserved broadcast group address (`0x0000`).
    #[inline]
    pub const fn is_broadcast(self) -> bool {
        matches!(self, Self::Group(g) if g.raw() == 0x0000)
    }

    /// True if this address is a group address.
    #[inline]
    pub const fn is_group(self) -> bool {
        matches!(self, Self::Group(_))
    }
}

impl From<IndividualAddress> for KnxAddress {
    fn from(addr: IndividualAddress) -> Self {
        Self::Individual(addr)
    }
}

impl From<GroupAddress> for KnxAddress {
    fn from(addr: GroupAddress) -> Self {
        Self::Group(addr)
    }
}

impl std::fmt::Display for KnxAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Individual(a) => write!(f, "{a}"),
            Self::Group(a) => write!(f, "{a}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_is_group_zero() {
        assert!(KnxAddress::BROADCAST.is_broadcast());
        assert_eq!(KnxAddress::BROADCAST.raw(), 0);
    }

    #[test]
    fn non_broadcast_group_is_not_broadcast() {
        let addr = KnxAddress::from(GroupAddress::new(1, 2, 3).unwrap());
        assert!(!addr.is_broadcast());
        assert!(addr.is_group());
    }

    #[test]
    fn individual_is_never_group() {
        let addr = KnxAddress::from(IndividualAddress::new(1, 1, 1).unwrap());
        assert!(!addr.is_group());
        assert!(!addr.is_broadcast());
    }
}
