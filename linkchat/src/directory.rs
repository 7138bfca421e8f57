//! Peer Directory: the live set of known peers and their addresses.

use std::collections::HashMap;

use linkchat_proto::envelope::PeerListUpdate;

/// Errors from peer selection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// The peer is the local identity or not currently present.
    #[error("invalid target {peer}: {reason}")]
    InvalidTarget {
        /// The rejected name.
        peer: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

/// A known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Registered display name.
    pub identity: String,
    /// Last known network address.
    pub address: Option<String>,
}

/// Tracks the peer set reported by the bus.
///
/// The set is replaced wholesale on every list response. Addresses live in
/// a side map that only ever gains or updates non-empty entries, so a list
/// without address data never forgets a known address.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    local_identity: Option<String>,
    local_address: Option<String>,
    peers: Vec<String>,
    addresses: HashMap<String, String>,
}

impl PeerDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the identity excluded from the visible set.
    pub fn set_local_identity(&mut self, identity: impl Into<String>) {
        let identity = identity.into();
        self.peers.retain(|p| *p != identity);
        self.local_identity = Some(identity);
    }

    /// Record the address the bus assigned to the local identity.
    pub fn record_local_address(&mut self, address: impl Into<String>) {
        let address = address.into();
        if address.trim().is_empty() {
            return;
        }
        if let Some(me) = &self.local_identity {
            self.addresses.insert(me.clone(), address.clone());
        }
        self.local_address = Some(address);
    }

    /// The local identity's assigned address.
    #[must_use]
    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }

    /// Replace the peer set from a list response.
    ///
    /// Returns `true` if the visible set or any address changed.
    pub fn apply_list(&mut self, update: &PeerListUpdate) -> bool {
        let peers: Vec<String> = update
            .users
            .iter()
            .filter(|u| Some(u.as_str()) != self.local_identity.as_deref())
            .cloned()
            .collect();
        let mut changed = peers != self.peers;
        self.peers = peers;
        for (identity, address) in &update.addresses {
            changed |= self.upsert_address(identity, address);
        }
        changed
    }

    /// Insert or update one address. Empty addresses are ignored.
    ///
    /// Returns `true` if the stored address changed.
    pub fn upsert_address(&mut self, identity: &str, address: &str) -> bool {
        let address = address.trim();
        if identity.is_empty() || address.is_empty() {
            return false;
        }
        if self.addresses.get(identity).map(String::as_str) == Some(address) {
            return false;
        }
        self.addresses
            .insert(identity.to_string(), address.to_string());
        true
    }

    /// Whether `identity` is in the visible set.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.peers.iter().any(|p| p == identity)
    }

    /// Last known address of `identity`.
    #[must_use]
    pub fn address_of(&self, identity: &str) -> Option<&str> {
        self.addresses.get(identity).map(String::as_str)
    }

    /// The visible peers, in bus order, with resolved addresses.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .map(|identity| Peer {
                identity: identity.clone(),
                address: self.addresses.get(identity).cloned(),
            })
            .collect()
    }

    /// Number of visible peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peers are visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Check that `peer` may become the active conversation target.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::InvalidTarget`] for the local identity or for a
    /// peer not currently present.
    pub fn validate_target(&self, peer: &str) -> Result<(), DirectoryError> {
        if self.local_identity.as_deref() == Some(peer) {
            return Err(DirectoryError::InvalidTarget {
                peer: peer.to_string(),
                reason: "cannot message yourself",
            });
        }
        if !self.contains(peer) {
            return Err(DirectoryError::InvalidTarget {
                peer: peer.to_string(),
                reason: "not in the peer list",
            });
        }
        Ok(())
    }

    /// Forget everything, as at the end of a session.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn update(users: &[&str], addresses: &[(&str, &str)]) -> PeerListUpdate {
        PeerListUpdate {
            users: users.iter().map(ToString::to_string).collect(),
            addresses: addresses
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn directory() -> PeerDirectory {
        let mut dir = PeerDirectory::new();
        dir.set_local_identity("alice");
        dir
    }

    #[test]
    fn local_identity_is_hidden() {
        let mut dir = directory();
        dir.apply_list(&update(&["alice", "bob", "carol"], &[]));
        let names: Vec<_> = dir.peers().into_iter().map(|p| p.identity).collect();
        assert_eq!(names, vec!["bob", "carol"]);
        assert!(!dir.contains("alice"));
    }

    #[test]
    fn list_replaces_set_wholesale() {
        let mut dir = directory();
        dir.apply_list(&update(&["bob", "carol"], &[]));
        dir.apply_list(&update(&["dave"], &[]));
        assert!(!dir.contains("bob"));
        assert!(dir.contains("dave"));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn applying_same_list_twice_is_idempotent() {
        let mut dir = directory();
        let list = update(&["alice", "bob"], &[("bob", "10.0.0.2")]);
        assert!(dir.apply_list(&list));
        let first = dir.peers();
        assert!(!dir.apply_list(&list));
        assert_eq!(dir.peers(), first);
    }

    #[test]
    fn addresses_survive_refresh_without_address_data() {
        let mut dir = directory();
        dir.apply_list(&update(&["bob"], &[("bob", "10.0.0.2")]));
        dir.apply_list(&update(&["bob"], &[]));
        assert_eq!(dir.address_of("bob"), Some("10.0.0.2"));

        assert!(!dir.upsert_address("bob", "   "));
        assert_eq!(dir.address_of("bob"), Some("10.0.0.2"));

        assert!(dir.upsert_address("bob", "10.0.0.9"));
        assert_eq!(dir.address_of("bob"), Some("10.0.0.9"));
    }

    #[test]
    fn address_kept_for_peer_that_left() {
        let mut dir = directory();
        dir.apply_list(&update(&["bob"], &[("bob", "10.0.0.2")]));
        dir.apply_list(&update(&[], &[]));
        assert!(dir.is_empty());
        dir.apply_list(&update(&["bob"], &[]));
        assert_eq!(dir.peers()[0].address.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn self_and_unknown_targets_are_invalid() {
        let mut dir = directory();
        dir.apply_list(&update(&["alice", "bob"], &[]));
        assert!(dir.validate_target("bob").is_ok());
        assert!(matches!(
            dir.validate_target("alice"),
            Err(DirectoryError::InvalidTarget { .. })
        ));
        assert!(matches!(
            dir.validate_target("zed"),
            Err(DirectoryError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn local_address_is_recorded() {
        let mut dir = directory();
        dir.record_local_address("127.0.0.1");
        assert_eq!(dir.local_address(), Some("127.0.0.1"));
        assert_eq!(dir.address_of("alice"), Some("127.0.0.1"));

        dir.clear();
        assert!(dir.local_address().is_none());
        assert!(dir.address_of("alice").is_none());
    }
}
