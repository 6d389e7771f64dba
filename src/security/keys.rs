//! In-memory Data Secure key material.
//!
//! A [`Security`] entity exclusively owns the tool/group/broadcast key
//! tables. Keys are pre-provisioned by the caller (no certificate-based
//! distribution here); a transient broadcast key is zeroized the moment it
//! is dropped.

use crate::addressing::{GroupAddress, IndividualAddress, SerialNumber};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A raw 16-byte AES key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AesKey([u8; 16]);

impl AesKey {
    /// Wrap 16 raw key bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub const fn bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AesKey").field(&"<redacted>").finish()
    }
}

/// Owner of all Data Secure key material for one device.
///
/// Tables are populated once at construction from pre-provisioned key
/// material (see [`crate::config::Config`]) and mutated only to install or
/// drop a transient broadcast key established via sync.
#[derive(Debug, Default)]
pub struct Security {
    tool_keys: DashMap<IndividualAddress, Arc<AesKey>>,
    group_keys: DashMap<GroupAddress, Arc<AesKey>>,
    group_senders: DashMap<GroupAddress, DashSet<IndividualAddress>>,
    broadcast_tool_keys: DashMap<SerialNumber, Arc<AesKey>>,
}

impl Security {
    /// Create an empty key store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision the tool key used to talk to `device`.
    pub fn set_tool_key(&self, device: IndividualAddress, key: AesKey) {
        self.tool_keys.insert(device, Arc::new(key));
    }

    /// Look up the tool key for `device`, if provisioned.
    #[must_use]
    pub fn tool_key(&self, device: IndividualAddress) -> Option<Arc<AesKey>> {
        self.tool_keys.get(&device).map(|entry| Arc::clone(&entry))
    }

    /// Provision the group key for `group`.
    pub fn set_group_key(&self, group: GroupAddress, key: AesKey) {
        self.group_keys.insert(group, Arc::new(key));
    }

    /// Look up the group key for `group`, if provisioned.
    #[must_use]
    pub fn group_key(&self, group: GroupAddress) -> Option<Arc<AesKey>> {
        self.group_keys.get(&group).map(|entry| Arc::clone(&entry))
    }

    /// Set the sender whitelist for `group`. An empty or absent whitelist
    /// means any sender with the group key is accepted.
    pub fn set_group_senders(&self, group: GroupAddress, senders: impl IntoIterator<Item = IndividualAddress>) {
        let set = DashSet::new();
        for sender in senders {
            set.insert(sender);
        }
        self.group_senders.insert(group, set);
    }

    /// Check whether `sender` is allowed to write to `group`: allowed if no
    /// whitelist was configured, or the whitelist is empty, or `sender` is in it.
    #[must_use]
    pub fn is_allowed_sender(&self, group: GroupAddress, sender: IndividualAddress) -> bool {
        self.group_senders
            .get(&group)
            .is_none_or(|set| set.is_empty() || set.contains(&sender))
    }

    /// Install a transient broadcast tool key established via broadcast sync,
    /// keyed by the peer's serial number.
    pub fn set_broadcast_tool_key(&self, serial: SerialNumber, key: AesKey) {
        self.broadcast_tool_keys.insert(serial, Arc::new(key));
    }

    /// Look up the broadcast tool key for `serial`, if any.
    #[must_use]
    pub fn broadcast_tool_key(&self, serial: SerialNumber) -> Option<Arc<AesKey>> {
        self.broadcast_tool_keys.get(&serial).map(|entry| Arc::clone(&entry))
    }

    /// Drop the transient broadcast key for `serial` (zeroized via [`AesKey`]'s
    /// `Drop` impl once its last `Arc` reference is released).
    pub fn clear_broadcast_tool_key(&self, serial: SerialNumber) {
        self.broadcast_tool_keys.remove(&serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_sender_whitelist_empty_allows_all() {
        let security = Security::new();
        let group = GroupAddress::new(1, 2, 3).unwrap();
        let sender = IndividualAddress::new(1, 1, 1).unwrap();
        assert!(security.is_allowed_sender(group, sender));
    }

    #[test]
    fn group_sender_whitelist_rejects_unknown() {
        let security = Security::new();
        let group = GroupAddress::new(1, 2, 3).unwrap();
        let allowed = IndividualAddress::new(1, 1, 1).unwrap();
        let other = IndividualAddress::new(1, 1, 2).unwrap();

        security.set_group_senders(group, [allowed]);
        assert!(security.is_allowed_sender(group, allowed));
        assert!(!security.is_allowed_sender(group, other));
    }

    #[test]
    fn broadcast_key_round_trips_and_clears() {
        let security = Security::new();
        let serial = SerialNumber::new([1, 2, 3, 4, 5, 6]);
        security.set_broadcast_tool_key(serial, AesKey::new([0xAA; 16]));
        assert!(security.broadcast_tool_key(serial).is_some());
        security.clear_broadcast_tool_key(serial);
        assert!(security.broadcast_tool_key(serial).is_none());
    }
}
