//! Full-mesh bookkeeping
//!
//! Decides who offers to whom and tracks each remote peer's link state.
//! No I/O happens here.

use std::collections::BTreeMap;

/// Only the lexicographically greater id initiates, so each pair connects once
pub fn should_initiate(local_peer_id: &str, remote_peer_id: &str) -> bool {
    local_peer_id > remote_peer_id
}

/// Link state for one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Known member, waiting for its offer
    Idle,
    Offering,
    Answering,
    Connected,
    Failed,
    Closed,
}

/// Membership of the local peer's mesh
#[derive(Debug)]
pub struct MeshState {
    local_peer_id: String,
    links: BTreeMap<String, LinkState>,
}

impl MeshState {
    pub fn new(local_peer_id: impl Into<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            links: BTreeMap::new(),
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// State of a link; unknown peers are Idle
    pub fn state(&self, peer_id: &str) -> LinkState {
        self.links.get(peer_id).copied().unwrap_or(LinkState::Idle)
    }

    /// A member appeared. Returns true if we should send it an offer.
    pub fn peer_joined(&mut self, peer_id: &str) -> bool {
        if peer_id == self.local_peer_id || self.links.contains_key(peer_id) {
            return false;
        }
        if should_initiate(&self.local_peer_id, peer_id) {
            self.links.insert(peer_id.to_string(), LinkState::Offering);
            true
        } else {
            self.links.insert(peer_id.to_string(), LinkState::Idle);
            false
        }
    }

    /// Admit the initial member list. Returns the peers to offer to.
    pub fn add_members<'a>(&mut self, members: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        members
            .into_iter()
            .filter(|peer| self.peer_joined(peer))
            .map(str::to_string)
            .collect()
    }

    /// An offer arrived. Returns false if the pair's tie-break says we offer instead.
    pub fn on_offer(&mut self, from: &str) -> bool {
        if from == self.local_peer_id || should_initiate(&self.local_peer_id, from) {
            return false;
        }
        self.links.insert(from.to_string(), LinkState::Answering);
        true
    }

    /// An answer arrived. Only meaningful while we are offering.
    pub fn on_answer(&self, from: &str) -> bool {
        self.state(from) == LinkState::Offering
    }

    pub fn on_connected(&mut self, peer_id: &str) {
        if let Some(state) = self.links.get_mut(peer_id) {
            *state = LinkState::Connected;
        }
    }

    /// Link failed or closed; the peer's entry is dropped. Returns the last state.
    pub fn on_terminated(&mut self, peer_id: &str, failed: bool) -> Option<LinkState> {
        let previous = self.links.remove(peer_id)?;
        tracing::debug!(
            "Link to {} {} (was {:?})",
            peer_id,
            if failed { "failed" } else { "closed" },
            previous
        );
        Some(previous)
    }

    /// Member left the session
    pub fn peer_left(&mut self, peer_id: &str) -> bool {
        self.links.remove(peer_id).is_some()
    }

    #[cfg(test)]
    pub fn connected_peers(&self) -> Vec<String> {
        self.links
            .iter()
            .filter(|(_, state)| **state == LinkState::Connected)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_side_offers() {
        let ids = ["alice", "bob", "carol", "a", "b", "peer-10", "peer-9"];
        for x in ids {
            for y in ids {
                if x == y {
                    continue;
                }
                assert_ne!(should_initiate(x, y), should_initiate(y, x), "{x} vs {y}");
                assert_eq!(should_initiate(x, y), x > y);
            }
        }
    }

    #[test]
    fn test_initial_members() {
        let mut mesh = MeshState::new("m");
        let offers = mesh.add_members(["a", "m", "z", "b"]);

        assert_eq!(offers, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(mesh.state("a"), LinkState::Offering);
        assert_eq!(mesh.state("z"), LinkState::Idle);
        assert_eq!(mesh.len(), 3);
    }

    #[test]
    fn test_offer_glare_rejected() {
        let mut mesh = MeshState::new("m");
        // "a" is lower, so it should be answering our offer, not offering
        assert!(!mesh.on_offer("a"));
        assert!(mesh.on_offer("z"));
        assert_eq!(mesh.state("z"), LinkState::Answering);
    }

    #[test]
    fn test_lifecycle_and_discard() {
        let mut mesh = MeshState::new("m");
        assert!(mesh.peer_joined("a"));
        assert!(!mesh.peer_joined("a"));
        assert!(mesh.on_answer("a"));

        mesh.on_connected("a");
        assert_eq!(mesh.connected_peers(), vec!["a".to_string()]);

        assert_eq!(mesh.on_terminated("a", true), Some(LinkState::Connected));
        assert!(mesh.is_empty());
        assert_eq!(mesh.on_terminated("a", true), None);
        // A discarded peer is not re-offered unless it joins again
        assert!(mesh.connected_peers().is_empty());
        assert!(mesh.peer_joined("a"));
    }

    #[test]
    fn test_answer_without_offer_ignored() {
        let mesh = MeshState::new("m");
        assert!(!mesh.on_answer("a"));
    }
}
